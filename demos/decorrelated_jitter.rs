//! Decorrelated jitter demo.
use sagamesh::Jitter;
use std::time::Duration;

fn main() {
    let jitter = Jitter::decorrelated(Duration::from_millis(50), Duration::from_secs(2));
    let mut delay = Duration::from_millis(50);
    for _ in 0..5 {
        delay = jitter.apply(delay);
        println!("decorrelated sleep: {:?}", delay);
    }
}
