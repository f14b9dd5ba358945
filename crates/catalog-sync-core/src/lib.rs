use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

pub mod association;
pub mod checksum;
pub mod config;
pub mod conflict;
pub mod converter;
pub mod directory;
pub mod mapping;
pub mod product;
pub mod reconcile;
pub mod sync_state;

pub use association::{
    resolve_associations, select_rule, AssociationOptions, AssociationPlan, CategoryAssociation,
    LadderRule,
};
pub use checksum::{calculate_checksum, needs_sync, syncable_projection, SyncChecksum, SyncProjection};
pub use config::SyncConfig;
pub use conflict::{conflict_reason, detect_conflicts, MappingConflict};
pub use converter::PulledRecord;
pub use directory::{CategoryDirectory, DirectoryEntry, DirectorySnapshot};
pub use mapping::{
    parse_mapping_str, parse_mapping_value, LegacyRecord, MappingRecord, MappingSource,
    MappingValue, Mappings, Provenance, Selection,
};
pub use product::{Category, CategoryTree, PriceEntry, Product, StockEntry, SystemListing};
pub use reconcile::{
    PushPlan, ReconcileOutcome, Reconciler, RecordLocks, SweepEntry, SweepItem, SweepResult,
};
pub use sync_state::{SyncRecord, SyncStatus};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SyncError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("format error: {0}")]
    Format(String),
    #[error("invalid sync transition: {from} -> {to}")]
    Transition { from: SyncStatus, to: SyncStatus },
    #[error("{action} requires a pending sync record, status is {status}")]
    NotPending { action: &'static str, status: SyncStatus },
    #[error("config error: {0}")]
    Config(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Canonical catalog category identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CategoryId(pub u64);

impl Display for CategoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category identifier in a downstream system's own id space.
///
/// Always strictly positive. Unresolved selections are modelled as
/// `Option<ExternalId>::None`, never as a zero or negative value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "u64", into = "u64")]
pub struct ExternalId(u64);

impl ExternalId {
    /// Interpret a raw stored value; zero and negative values are placeholders.
    #[must_use]
    pub fn from_raw(raw: i64) -> Option<Self> {
        u64::try_from(raw).ok().filter(|value| *value > 0).map(Self)
    }

    #[must_use]
    pub fn new(value: u64) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for ExternalId {
    type Error = SyncError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
            .ok_or_else(|| SyncError::Format("external id MUST be greater than zero".to_string()))
    }
}

impl From<ExternalId> for u64 {
    fn from(value: ExternalId) -> Self {
        value.0
    }
}

impl Display for ExternalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ProductId(pub u64);

impl Display for ProductId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Downstream storefront system identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SystemId(pub u64);

impl Display for SystemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_id_rejects_placeholders() {
        assert_eq!(ExternalId::from_raw(0), None);
        assert_eq!(ExternalId::from_raw(-4), None);
        assert_eq!(ExternalId::from_raw(9).map(ExternalId::get), Some(9));
        assert!(serde_json::from_str::<ExternalId>("0").is_err());
    }

    #[test]
    fn ids_serialize_transparently() -> Result<(), serde_json::Error> {
        let id = ExternalId::new(15).map_or(0, ExternalId::get);
        assert_eq!(id, 15);
        assert_eq!(serde_json::to_string(&CategoryId(100))?, "100");
        assert_eq!(serde_json::to_string(&SystemId(3))?, "3");
        Ok(())
    }
}
