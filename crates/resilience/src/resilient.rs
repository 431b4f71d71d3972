use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backon::Retryable;

use crate::{CircuitBreaker, ResilienceConfig, ResilienceError, RetryConfig};

/// Composes a circuit breaker, a retry policy and a per-attempt timeout
/// around a downstream call.
///
/// Every attempt passes through the breaker. A short-circuited attempt stops
/// the retry loop immediately.
#[derive(Clone)]
pub struct Resilient {
    breaker: Arc<CircuitBreaker>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl Resilient {
    /// Creates a wrapper with its own circuit breaker.
    pub fn new(name: impl Into<String>, config: ResilienceConfig) -> Self {
        Self {
            breaker: Arc::new(CircuitBreaker::new(name, config.breaker)),
            retry: config.retry,
            call_timeout: config.call_timeout,
        }
    }

    /// Returns the breaker guarding this wrapper.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Runs `op` under the breaker, retrying timeouts and errors.
    pub async fn call<T, E, F, Fut>(&self, mut op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        (|| self.attempt(op()))
            .retry(self.retry.backoff())
            .when(|e: &ResilienceError<E>| !e.is_open())
            .notify(|e: &ResilienceError<E>, delay: Duration| {
                tracing::debug!(
                    breaker = %self.breaker.name(),
                    error = %e,
                    delay = ?delay,
                    "Guarded call failed, retrying"
                );
            })
            .await
    }

    /// Runs `op` like [`call`](Self::call), converting any final failure
    /// into a value with `fallback`.
    pub async fn call_or_else<T, E, F, Fut, G, GFut>(&self, op: F, fallback: G) -> T
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        G: FnOnce(ResilienceError<E>) -> GFut,
        GFut: Future<Output = T>,
    {
        match self.call(op).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(breaker = %self.breaker.name(), error = %e, "Guarded call exhausted, using fallback");
                fallback(e).await
            }
        }
    }

    /// Runs `fut` once under the breaker and the per-attempt timeout, without
    /// retrying.
    ///
    /// For operations that must not be repeated when an attempt may already
    /// have taken effect.
    pub async fn call_once<T, E, Fut>(&self, fut: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.attempt(fut).await
    }

    async fn attempt<T, E, Fut>(&self, fut: Fut) -> Result<T, ResilienceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.breaker.try_acquire().await {
            return Err(ResilienceError::Open(self.breaker.name().to_string()));
        }
        let permit = Permit::new(Arc::clone(&self.breaker));

        let result = match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.breaker.on_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                self.breaker.on_failure().await;
                Err(ResilienceError::Inner(e))
            }
            Err(_) => {
                self.breaker.on_failure().await;
                Err(ResilienceError::Timeout(self.call_timeout))
            }
        };
        permit.settle();
        result
    }
}

/// A slot granted by the breaker. Dropped unsettled, it is released so a
/// cancelled attempt cannot hold a half-open trial forever.
struct Permit {
    breaker: Option<Arc<CircuitBreaker>>,
}

impl Permit {
    fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            breaker: Some(breaker),
        }
    }

    /// The outcome has been recorded.
    fn settle(mut self) {
        self.breaker = None;
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let Some(breaker) = self.breaker.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { breaker.release().await });
            }
            Err(_) => {
                tracing::warn!(breaker = %breaker.name(), "Attempt dropped outside a runtime, slot not released");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BreakerState, CircuitBreakerConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> ResilienceConfig {
        ResilienceConfig {
            breaker: CircuitBreakerConfig {
                sliding_window_size: 10,
                minimum_calls: 5,
                failure_rate_threshold: 50.0,
                open_duration: Duration::from_secs(60),
                half_open_permitted_calls: 1,
            },
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                multiplier: 2.0,
                max_backoff: Duration::from_millis(5),
            },
            call_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let resilient = Resilient::new("test", fast_config());
        let result: Result<u32, ResilienceError<String>> = resilient.call(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let resilient = Resilient::new("test", fast_config());
        let attempts = AtomicUsize::new(0);

        let result = resilient
            .call(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok("done")
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let resilient = Resilient::new("test", fast_config());
        let attempts = AtomicUsize::new(0);

        let result: Result<(), _> = resilient
            .call(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Inner(ref e)) if e == "down"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let resilient = Resilient::new("test", fast_config());

        let result: Result<(), ResilienceError<String>> = resilient
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Timeout(_))));
        assert_eq!(resilient.breaker().metrics().failures, 3);
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits_without_calling() {
        let resilient = Resilient::new("test", fast_config());
        resilient.breaker().trip().await;
        let attempts = AtomicUsize::new(0);

        let result: Result<(), ResilienceError<String>> = resilient
            .call(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(result.unwrap_err().is_open());
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_breaker_opens_mid_retry_and_stops_retrying() {
        let resilient = Resilient::new("test", fast_config());
        let attempts = AtomicUsize::new(0);

        // two calls of three failed attempts each: the fifth failure opens the circuit
        for _ in 0..2 {
            let _: Result<(), _> = resilient
                .call(|| async {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("down".to_string())
                })
                .await;
        }

        assert_eq!(resilient.breaker().state().await, BreakerState::Open);
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_call_once_does_not_retry() {
        let resilient = Resilient::new("test", fast_config());
        let attempts = AtomicUsize::new(0);

        let result: Result<(), _> = resilient
            .call_once(async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Inner(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(resilient.breaker().metrics().failures, 1);
    }

    #[tokio::test]
    async fn test_cancelled_trial_call_does_not_wedge_breaker() {
        let config = ResilienceConfig {
            breaker: CircuitBreakerConfig {
                open_duration: Duration::from_millis(20),
                half_open_permitted_calls: 1,
                ..fast_config().breaker
            },
            call_timeout: Duration::from_secs(5),
            ..fast_config()
        };
        let resilient = Resilient::new("test", config);
        resilient.breaker().trip().await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // the only trial slot goes to a call whose caller gives up on it
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            resilient.call(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, String>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(resilient.breaker().state().await, BreakerState::HalfOpen);

        let mut result: Result<u32, ResilienceError<String>> =
            Err(ResilienceError::Open(String::new()));
        for _ in 0..50 {
            result = resilient.call_once(async { Ok(1) }).await;
            if result.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(result.unwrap(), 1);
        assert_eq!(resilient.breaker().state().await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_fallback_converts_failure() {
        let resilient = Resilient::new("test", fast_config());

        let value = resilient
            .call_or_else(
                || async { Err::<bool, _>("down".to_string()) },
                |_| async { false },
            )
            .await;

        assert!(!value);
    }
}
