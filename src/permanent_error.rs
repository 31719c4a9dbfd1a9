//! Marker wrapper distinguishing errors a retry middleware should never retry.
//!
//! Handlers signal "do not retry, forward straight to the dead-letter queue"
//! by wrapping their error in [`PermanentError`] before returning it. The
//! retry middleware only needs `is_permanent` on a type-erased
//! `&(dyn Error + 'static)`, so it never has to know the handler's concrete
//! error type.

use std::error::Error as StdError;
use std::fmt;

/// Wraps an error to mark it as non-retriable.
///
/// A saga step or consumer handler returns `Err(PermanentError::new(e))` to
/// signal that no amount of retrying will make `e` succeed (e.g. a 4xx
/// validation failure, a malformed payload). The router's retry middleware
/// checks [`is_permanent`] before scheduling a retry and routes permanent
/// failures straight to the poison queue instead.
#[derive(Debug)]
pub struct PermanentError(Box<dyn StdError + Send + Sync + 'static>);

impl PermanentError {
    /// Wrap `error` as permanent.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Box::new(error))
    }

    /// Unwrap back into the boxed source error.
    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync + 'static> {
        self.0
    }
}

impl fmt::Display for PermanentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "permanent error: {}", self.0)
    }
}

impl StdError for PermanentError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.0.as_ref())
    }
}

/// Returns `true` if `err` (or anything in its `source()` chain) is a
/// [`PermanentError`].
///
/// Walking the chain matters because middleware layers tend to wrap errors
/// (a router might box a saga step's error before returning it); the
/// permanence marker must survive that wrapping.
pub fn is_permanent(err: &(dyn StdError + 'static)) -> bool {
    let mut cur: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = cur {
        if e.downcast_ref::<PermanentError>().is_some() {
            return true;
        }
        cur = e.source();
    }
    false
}
