use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{AggregateId, ProductId};

/// Version number of a stored row, used for optimistic concurrency control.
///
/// A row that does not exist yet is at version 0; the first save writes
/// version 1 and every subsequent save increments by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) of a row that has never been saved.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the first version (1) written by the first save.
    pub fn first() -> Self {
        Self(1)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// The persisted state of an aggregate.
///
/// `version` is the version the row was read at. Saving the row writes
/// `version.next()` if, and only if, the stored version still equals `version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRow {
    /// The aggregate this row belongs to.
    pub aggregate_id: AggregateId,

    /// The type of aggregate (e.g., "Order").
    pub aggregate_type: String,

    /// The version the row was loaded at.
    pub version: Version,

    /// When the row was last written.
    pub updated_at: DateTime<Utc>,

    /// The serialized aggregate state.
    pub state: serde_json::Value,
}

impl AggregateRow {
    /// Creates a row from a serializable aggregate state.
    pub fn from_state<T: Serialize>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            updated_at: Utc::now(),
            state: serde_json::to_value(state)?,
        })
    }

    /// Deserializes the stored state.
    pub fn to_state<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state.clone())
    }
}

/// System-of-record stock level for a product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRow {
    pub product_id: ProductId,
    pub quantity: i64,
    pub version: Version,
    pub updated_at: DateTime<Utc>,
}

impl StockRow {
    /// Creates a stock row that has not been saved yet.
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
            version: Version::initial(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_ordering() {
        let v1 = Version::new(1);
        let v2 = Version::new(2);
        assert!(v1 < v2);
        assert_eq!(v1.next(), v2);
    }

    #[test]
    fn version_initial_and_first() {
        assert_eq!(Version::initial().as_i64(), 0);
        assert_eq!(Version::first().as_i64(), 1);
        assert_eq!(Version::initial().next(), Version::first());
    }

    #[test]
    fn aggregate_row_state_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Counter {
            value: u32,
        }

        let id = AggregateId::new();
        let row =
            AggregateRow::from_state(id, "Counter", Version::initial(), &Counter { value: 7 })
                .unwrap();

        assert_eq!(row.aggregate_id, id);
        assert_eq!(row.aggregate_type, "Counter");
        assert_eq!(row.to_state::<Counter>().unwrap(), Counter { value: 7 });
    }

    #[test]
    fn new_stock_row_is_unsaved() {
        let row = StockRow::new(ProductId::new("SKU-1"), 10);
        assert_eq!(row.version, Version::initial());
        assert_eq!(row.quantity, 10);
    }
}
