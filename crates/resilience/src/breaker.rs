//! Circuit breaker over a count-based sliding window.
//!
//! ```text
//! Closed ──(failure rate ≥ threshold over the last N calls)──► Open
//! Open ──(open_duration elapsed)──► HalfOpen
//! HalfOpen ──(all permitted trial calls succeed)──► Closed
//! HalfOpen ──(any trial call fails)──► Open
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;

use crate::CircuitBreakerConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls are allowed and recorded in the sliding window.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// A limited number of trial calls are allowed.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct BreakerInternalState {
    state: BreakerState,
    /// Outcomes of the most recent calls while closed; `true` is a failure.
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    half_open_issued: usize,
    half_open_successes: usize,
}

impl BreakerInternalState {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            window: VecDeque::new(),
            opened_at: None,
            half_open_issued: 0,
            half_open_successes: 0,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|failed| **failed).count();
        failures as f64 * 100.0 / self.window.len() as f64
    }
}

#[derive(Debug, Default)]
struct BreakerMetrics {
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    opens: AtomicU64,
}

/// Point-in-time copy of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerMetricsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub opens: u64,
}

/// Circuit breaker protecting one downstream dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerInternalState>,
    metrics: Arc<BreakerMetrics>,
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerInternalState::new()),
            metrics: Arc::new(BreakerMetrics::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state.
    pub async fn state(&self) -> BreakerState {
        self.state.lock().await.state
    }

    pub fn metrics(&self) -> BreakerMetricsSnapshot {
        BreakerMetricsSnapshot {
            successes: self.metrics.successes.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            rejections: self.metrics.rejections.load(Ordering::Relaxed),
            opens: self.metrics.opens.load(Ordering::Relaxed),
        }
    }

    /// Asks permission to attempt a call.
    ///
    /// Returns false if the call must be short-circuited. A granted call must
    /// be followed by exactly one of [`on_success`](Self::on_success) or
    /// [`on_failure`](Self::on_failure).
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        let allowed = match state.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled_down = state
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.open_duration);
                if cooled_down {
                    self.transition(&mut state, BreakerState::HalfOpen);
                    state.half_open_issued = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if state.half_open_issued < self.config.half_open_permitted_calls {
                    state.half_open_issued += 1;
                    true
                } else {
                    false
                }
            }
        };

        if !allowed {
            self.metrics.rejections.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    /// Records a successful call.
    pub async fn on_success(&self) {
        self.metrics.successes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock().await;
        match state.state {
            BreakerState::Closed => self.record(&mut state, false),
            BreakerState::HalfOpen => {
                state.half_open_successes += 1;
                if state.half_open_successes >= self.config.half_open_permitted_calls {
                    self.transition(&mut state, BreakerState::Closed);
                }
            }
            // A call admitted before the circuit opened.
            BreakerState::Open => {}
        }
    }

    /// Records a failed call.
    pub async fn on_failure(&self) {
        self.metrics.failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock().await;
        match state.state {
            BreakerState::Closed => {
                self.record(&mut state, true);
                if state.window.len() >= self.config.minimum_calls
                    && state.failure_rate() >= self.config.failure_rate_threshold
                {
                    tracing::warn!(
                        breaker = %self.name,
                        failure_rate = state.failure_rate(),
                        calls = state.window.len(),
                        "Circuit breaker opening"
                    );
                    self.transition(&mut state, BreakerState::Open);
                }
            }
            BreakerState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "Trial call failed, reopening circuit");
                self.transition(&mut state, BreakerState::Open);
            }
            BreakerState::Open => {}
        }
    }

    /// Hands back a slot granted by [`try_acquire`](Self::try_acquire)
    /// whose call ended without an outcome, such as a cancelled future.
    ///
    /// Nothing is recorded in the sliding window.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if state.state == BreakerState::HalfOpen && state.half_open_issued > 0 {
            state.half_open_issued -= 1;
            tracing::debug!(breaker = %self.name, "Abandoned trial call released");
        }
    }

    /// Forces the circuit open.
    pub async fn trip(&self) {
        let mut state = self.state.lock().await;
        self.transition(&mut state, BreakerState::Open);
    }

    /// Forces the circuit closed and clears its history.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        self.transition(&mut state, BreakerState::Closed);
    }

    fn record(&self, state: &mut BreakerInternalState, failed: bool) {
        state.window.push_back(failed);
        while state.window.len() > self.config.sliding_window_size {
            state.window.pop_front();
        }
    }

    fn transition(&self, state: &mut BreakerInternalState, to: BreakerState) {
        if state.state == to && to != BreakerState::Open {
            return;
        }
        match to {
            BreakerState::Open => {
                state.opened_at = Some(Instant::now());
                self.metrics.opens.fetch_add(1, Ordering::Relaxed);
            }
            BreakerState::HalfOpen => {
                state.half_open_issued = 0;
                state.half_open_successes = 0;
            }
            BreakerState::Closed => {
                state.window.clear();
                state.opened_at = None;
            }
        }
        tracing::info!(breaker = %self.name, from = %state.state, to = %to, "Circuit breaker transition");
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "breaker" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
        state.state = to;
    }
}
