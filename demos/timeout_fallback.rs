//! Demonstrates falling back from a tight timeout to a looser one.
use sagamesh::{ResilienceError, TimeoutPolicy};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let fast = TimeoutPolicy::new(Duration::from_millis(100))?;
    let slow = TimeoutPolicy::new(Duration::from_secs(1))?;

    let work = |req: &'static str| async move {
        if req == "slow" {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        Ok::<_, ResilienceError<std::io::Error>>(req)
    };

    let fast_result = fast.execute(|| work("ok")).await?;
    println!("fast path: {}", fast_result);

    // "slow" blows the tight timeout; fall back to the looser one.
    let slow_result = match fast.execute(|| work("slow")).await {
        Ok(value) => value,
        Err(err) if err.is_timeout() => slow.execute(|| work("slow")).await?,
        Err(err) => return Err(Box::new(err)),
    };
    println!("fallback path: {}", slow_result);

    Ok(())
}
