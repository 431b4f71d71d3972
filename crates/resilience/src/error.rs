use std::time::Duration;

use thiserror::Error;

/// Why a guarded call did not produce a value.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The circuit is open; the operation was not attempted.
    #[error("Circuit breaker '{0}' is open")]
    Open(String),

    /// The last attempt exceeded the per-call timeout.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The last attempt failed with the operation's own error.
    #[error("Call failed: {0}")]
    Inner(E),
}

impl<E> ResilienceError<E> {
    /// Returns true if the breaker short-circuited the call.
    pub fn is_open(&self) -> bool {
        matches!(self, ResilienceError::Open(_))
    }

    /// Returns the operation's error, if that is what ended the call.
    pub fn into_inner(self) -> Option<E> {
        match self {
            ResilienceError::Inner(e) => Some(e),
            _ => None,
        }
    }
}
