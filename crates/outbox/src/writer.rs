use serde::Serialize;
use store::{NewOutboxEvent, OutboxEvent, Transaction};

use crate::{OutboxError, Result};

/// Stages outgoing events in the outbox.
///
/// Events are only ever written through a [`Transaction`]; the row commits
/// or rolls back together with the state change it describes.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxWriter;

impl OutboxWriter {
    pub fn new() -> Self {
        Self
    }

    /// Inserts a `PENDING` outbox row into `tx`.
    ///
    /// Fails with [`OutboxError::NoActiveTransaction`] if `tx` has already
    /// been committed or rolled back.
    #[tracing::instrument(skip(self, tx, payload), fields(event_type = %event_type, topic = %topic))]
    pub async fn save_event<P: Serialize + Sync + ?Sized>(
        &self,
        tx: &mut dyn Transaction,
        aggregate_type: &str,
        aggregate_id: &str,
        event_type: &str,
        topic: &str,
        payload: &P,
    ) -> Result<OutboxEvent> {
        if !tx.is_active() {
            return Err(OutboxError::NoActiveTransaction);
        }

        let payload = serde_json::to_value(payload)?;
        let row = tx
            .insert_outbox(NewOutboxEvent::new(
                aggregate_type,
                aggregate_id,
                event_type,
                topic,
                payload,
            ))
            .await?;

        tracing::debug!(outbox_id = %row.id, aggregate_id, "Outbox event staged");
        Ok(row)
    }
}
