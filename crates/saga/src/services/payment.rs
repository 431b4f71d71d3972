//! Payment decision source.

use std::sync::Arc;

use async_trait::async_trait;
use common::AggregateId;
use domain::{Money, UserId};
use rand::Rng;
use tokio::sync::RwLock;

use crate::error::SagaError;

/// A pluggable yes/no payment decision.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Returns whether the charge was accepted. An `Err` means no decision
    /// could be reached.
    async fn authorize(
        &self,
        order_id: AggregateId,
        user_id: UserId,
        amount: Money,
    ) -> Result<bool, SagaError>;
}

/// Accepts charges except for a fixed fraction chosen at random.
#[derive(Debug, Clone)]
pub struct SimulatedPaymentGateway {
    failure_rate: f64,
}

impl SimulatedPaymentGateway {
    /// `failure_rate` is clamped to `0.0..=1.0`.
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: if failure_rate.is_nan() {
                0.0
            } else {
                failure_rate.clamp(0.0, 1.0)
            },
        }
    }

    pub fn failure_rate(&self) -> f64 {
        self.failure_rate
    }
}

#[async_trait]
impl PaymentGateway for SimulatedPaymentGateway {
    async fn authorize(
        &self,
        order_id: AggregateId,
        _user_id: UserId,
        amount: Money,
    ) -> Result<bool, SagaError> {
        let declined = rand::rng().random::<f64>() < self.failure_rate;
        tracing::debug!(order_id = %order_id, amount = %amount, declined, "Simulated payment decision");
        Ok(!declined)
    }
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    charges: Vec<(AggregateId, Money)>,
    decline: bool,
    error: Option<String>,
}

/// Scripted payment gateway for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declines every following charge.
    pub async fn set_decline(&self, decline: bool) {
        self.state.write().await.decline = decline;
    }

    /// Fails every following charge with `error`.
    pub async fn set_error(&self, error: Option<String>) {
        self.state.write().await.error = error;
    }

    /// Returns the accepted charges.
    pub async fn charges(&self) -> Vec<(AggregateId, Money)> {
        self.state.read().await.charges.clone()
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn authorize(
        &self,
        order_id: AggregateId,
        _user_id: UserId,
        amount: Money,
    ) -> Result<bool, SagaError> {
        let mut state = self.state.write().await;

        if let Some(error) = &state.error {
            return Err(SagaError::PaymentGateway(error.clone()));
        }
        if state.decline {
            return Ok(false);
        }

        state.charges.push((order_id, amount));
        Ok(true)
    }
}
