use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event whose compensating action failed irrecoverably.
///
/// Dead letters require manual remediation; nothing in the saga retries them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub error_message: String,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
}

impl DeadLetterEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
        error_message: impl Into<String>,
        retry_count: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            topic: topic.into(),
            payload,
            error_message: error_message.into(),
            retry_count,
            created_at: Utc::now(),
            resolved: false,
        }
    }
}
