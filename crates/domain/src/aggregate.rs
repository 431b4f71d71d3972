//! Core trait for state-stored aggregates.

use common::AggregateId;
use serde::{Serialize, de::DeserializeOwned};
use store::{AggregateRow, Version};

/// Trait for aggregates persisted as a single versioned row.
///
/// The whole state is serialized on every save; the row version provides
/// optimistic concurrency between concurrent handlers of the same aggregate.
pub trait Aggregate: Serialize + DeserializeOwned + Send + Sync + Sized {
    /// Returns the aggregate type name stored alongside the row.
    fn aggregate_type() -> &'static str;

    /// Returns the aggregate's unique identifier.
    fn id(&self) -> AggregateId;

    /// Serializes the aggregate into a row read at `version`.
    fn to_row(&self, version: Version) -> Result<AggregateRow, serde_json::Error> {
        AggregateRow::from_state(self.id(), Self::aggregate_type(), version, self)
    }

    /// Deserializes an aggregate and the version it was read at.
    fn from_row(row: &AggregateRow) -> Result<(Self, Version), serde_json::Error> {
        Ok((row.to_state()?, row.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: AggregateId,
        value: i32,
    }

    impl Aggregate for Counter {
        fn aggregate_type() -> &'static str {
            "Counter"
        }

        fn id(&self) -> AggregateId {
            self.id
        }
    }

    #[test]
    fn test_row_roundtrip_keeps_version() {
        let counter = Counter {
            id: AggregateId::new(),
            value: 3,
        };
        let row = counter.to_row(Version::new(4)).unwrap();
        assert_eq!(row.aggregate_type, "Counter");
        assert_eq!(row.aggregate_id, counter.id);

        let (loaded, version) = Counter::from_row(&row).unwrap();
        assert_eq!(loaded, counter);
        assert_eq!(version, Version::new(4));
    }
}
