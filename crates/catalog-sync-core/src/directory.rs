//! External Category Directory contract and an immutable in-memory snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{CategoryId, ExternalId, SyncError, SystemId};

/// Authoritative canonical <-> external category lookup for each downstream system.
///
/// Implementations are expected to be cheap and side-effect free from the
/// caller's point of view.
pub trait CategoryDirectory {
    fn resolve(&self, category_id: CategoryId, system: SystemId) -> Option<ExternalId>;

    fn reverse_resolve(&self, external_id: ExternalId, system: SystemId) -> Option<CategoryId>;
}

impl<T: CategoryDirectory + ?Sized> CategoryDirectory for &T {
    fn resolve(&self, category_id: CategoryId, system: SystemId) -> Option<ExternalId> {
        (**self).resolve(category_id, system)
    }

    fn reverse_resolve(&self, external_id: ExternalId, system: SystemId) -> Option<CategoryId> {
        (**self).reverse_resolve(external_id, system)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DirectoryEntry {
    pub system: SystemId,
    pub category_id: CategoryId,
    pub external_id: ExternalId,
}

/// Read-only directory built once per sweep and shared across worker threads.
#[derive(Debug, Clone, Default)]
pub struct DirectorySnapshot {
    forward: BTreeMap<(SystemId, CategoryId), ExternalId>,
    reverse: BTreeMap<(SystemId, ExternalId), CategoryId>,
}

impl DirectorySnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot, rejecting entries that would make the lookup ambiguous.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when one canonical id maps to two external ids
    /// (or the reverse) within the same system.
    pub fn from_entries(
        entries: impl IntoIterator<Item = DirectoryEntry>,
    ) -> Result<Self, SyncError> {
        let mut snapshot = Self::new();
        for entry in entries {
            snapshot.insert(entry)?;
        }
        Ok(snapshot)
    }

    /// Add one entry.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the entry conflicts with an existing one.
    pub fn insert(&mut self, entry: DirectoryEntry) -> Result<(), SyncError> {
        if let Some(existing) = self.forward.get(&(entry.system, entry.category_id)) {
            if *existing != entry.external_id {
                return Err(SyncError::Validation(format!(
                    "category {} already maps to external {} in system {}",
                    entry.category_id, existing, entry.system
                )));
            }
        }
        if let Some(existing) = self.reverse.get(&(entry.system, entry.external_id)) {
            if *existing != entry.category_id {
                return Err(SyncError::Validation(format!(
                    "external {} already maps to category {} in system {}",
                    entry.external_id, existing, entry.system
                )));
            }
        }

        self.forward.insert((entry.system, entry.category_id), entry.external_id);
        self.reverse.insert((entry.system, entry.external_id), entry.category_id);
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = DirectoryEntry> + '_ {
        self.forward.iter().map(|((system, category_id), external_id)| DirectoryEntry {
            system: *system,
            category_id: *category_id,
            external_id: *external_id,
        })
    }
}

impl CategoryDirectory for DirectorySnapshot {
    fn resolve(&self, category_id: CategoryId, system: SystemId) -> Option<ExternalId> {
        self.forward.get(&(system, category_id)).copied()
    }

    fn reverse_resolve(&self, external_id: ExternalId, system: SystemId) -> Option<CategoryId> {
        self.reverse.get(&(system, external_id)).copied()
    }
}
