use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Deterministic identity of a processed event:
/// `aggregateId + "_" + eventType [+ "_" + subId]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessedKey {
    id: String,
    aggregate_id: String,
    event_type: String,
}

impl ProcessedKey {
    pub fn new(aggregate_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        let aggregate_id = aggregate_id.into();
        let event_type = event_type.into();
        Self {
            id: format!("{aggregate_id}_{event_type}"),
            aggregate_id,
            event_type,
        }
    }

    /// Builds a key for events that occur once per sub-entity (e.g. per order line).
    pub fn with_sub_id(
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        sub_id: impl AsRef<str>,
    ) -> Self {
        let mut key = Self::new(aggregate_id, event_type);
        key.id = format!("{}_{}", key.id, sub_id.as_ref());
        key
    }

    /// Returns the composite primary key.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }
}

impl std::fmt::Display for ProcessedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Write-once ledger entry. Its existence means the handler for `id`
/// must not run again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub id: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
    pub processed_by: String,
}

impl ProcessedEvent {
    pub fn new(key: &ProcessedKey, processed_by: impl Into<String>) -> Self {
        Self {
            id: key.id.clone(),
            aggregate_id: key.aggregate_id.clone(),
            event_type: key.event_type.clone(),
            processed_at: Utc::now(),
            processed_by: processed_by.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_id_without_sub_id() {
        let key = ProcessedKey::new("order-1", "PaymentCompleted");
        assert_eq!(key.id(), "order-1_PaymentCompleted");
        assert_eq!(key.aggregate_id(), "order-1");
        assert_eq!(key.event_type(), "PaymentCompleted");
    }

    #[test]
    fn composite_id_with_sub_id() {
        let key = ProcessedKey::with_sub_id("order-1", "ReservationSucceeded", "SKU-9");
        assert_eq!(key.id(), "order-1_ReservationSucceeded_SKU-9");
        assert_eq!(key.to_string(), key.id());
    }

    #[test]
    fn entry_copies_key_fields() {
        let key = ProcessedKey::with_sub_id("order-1", "RestoreRequested", "SKU-1");
        let entry = ProcessedEvent::new(&key, "inventory-service");
        assert_eq!(entry.id, key.id());
        assert_eq!(entry.event_type, "RestoreRequested");
        assert_eq!(entry.processed_by, "inventory-service");
    }
}
