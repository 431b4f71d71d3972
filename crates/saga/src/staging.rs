use outbox::OutboxWriter;
use store::Transaction;

use crate::{Result, SagaMessage};

/// Stages `message` in the outbox inside `tx`, keyed by its order.
pub(crate) async fn stage(
    writer: &OutboxWriter,
    tx: &mut dyn Transaction,
    aggregate_type: &str,
    message: &SagaMessage,
) -> Result<()> {
    let payload = message.to_payload()?;
    writer
        .save_event(
            tx,
            aggregate_type,
            &message.order_id().to_string(),
            message.event_type(),
            message.topic(),
            &payload,
        )
        .await?;
    Ok(())
}
