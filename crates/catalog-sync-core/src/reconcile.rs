//! Reconciliation planner.
//!
//! For each (product, system) pair: detect structural conflicts, compute the
//! current checksum, compare it with the Sync Record and, when they differ,
//! produce the outbound push plan. The read-compare-decide sequence and mapping
//! refreshes for the same pair are serialized through [`RecordLocks`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::association::{
    resolve_associations, AssociationOptions, AssociationPlan, CategoryAssociation, LadderRule,
};
use crate::checksum::{calculate_checksum, syncable_projection, SyncChecksum};
use crate::config::SyncConfig;
use crate::conflict::{conflict_reason, detect_conflicts};
use crate::converter::{self, from_external_ids, from_selection, unresolved_ids};
use crate::directory::CategoryDirectory;
use crate::mapping::MappingValue;
use crate::product::{CategoryTree, Product, SystemListing};
use crate::sync_state::{SyncRecord, SyncStatus};
use crate::{CategoryId, ExternalId, ProductId, SyncError, SystemId};

/// Everything the transport layer needs to deliver one product update.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct PushPlan {
    pub product_id: ProductId,
    pub system: SystemId,
    pub checksum: SyncChecksum,
    pub rule: LadderRule,
    pub associations: Vec<CategoryAssociation>,
    pub default_category: Option<ExternalId>,
    pub unresolved: Vec<CategoryId>,
    pub pass_id: Ulid,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    UpToDate { checksum: SyncChecksum },
    Push(PushPlan),
    Conflict { reason: String },
    Skipped { status: SyncStatus },
}

/// Per-(product, system) mutual exclusion inside one process.
#[derive(Debug, Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<(ProductId, SystemId), Arc<Mutex<()>>>>,
}

impl RecordLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for one pair. Different pairs never block each other.
    pub fn with_record<T>(
        &self,
        product_id: ProductId,
        system: SystemId,
        f: impl FnOnce() -> T,
    ) -> T {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry((product_id, system)).or_default())
        };
        let _guard = lock.lock();
        f()
    }
}

#[derive(Debug, Clone)]
pub struct SweepItem {
    pub product: Product,
    pub listing: SystemListing,
    pub record: SyncRecord,
}

#[derive(Debug, Clone)]
pub struct SweepEntry {
    pub record: SyncRecord,
    pub outcome: Result<ReconcileOutcome, SyncError>,
}

#[derive(Debug, Clone)]
pub struct SweepResult {
    pub pass_id: Ulid,
    /// In processing order: priority first, then product and system id.
    pub entries: Vec<SweepEntry>,
}

impl SweepResult {
    pub fn pushes(&self) -> impl Iterator<Item = &PushPlan> + '_ {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            Ok(ReconcileOutcome::Push(plan)) => Some(plan),
            _ => None,
        })
    }
}

pub struct Reconciler<D> {
    directory: D,
    config: SyncConfig,
    options: AssociationOptions,
    locks: RecordLocks,
}

impl<D: CategoryDirectory> Reconciler<D> {
    /// # Errors
    /// Returns [`SyncError::Config`] when `config` does not validate.
    pub fn new(directory: D, config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let options = config.association_options()?;
        Ok(Self { directory, config, options, locks: RecordLocks::new() })
    }

    #[must_use]
    pub fn directory(&self) -> &D {
        &self.directory
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn locks(&self) -> &RecordLocks {
        &self.locks
    }

    #[must_use]
    pub fn associations(
        &self,
        product: &Product,
        listing: &SystemListing,
        tree: Option<&CategoryTree>,
    ) -> AssociationPlan {
        resolve_associations(
            &listing.mapping,
            &product.categories,
            tree,
            &self.directory,
            listing.system,
            &self.options,
        )
    }

    /// # Errors
    /// Returns [`SyncError::Serialization`] if the projection cannot be encoded.
    pub fn checksum(
        &self,
        product: &Product,
        listing: &SystemListing,
        tree: Option<&CategoryTree>,
    ) -> Result<(AssociationPlan, SyncChecksum), SyncError> {
        let associations = self.associations(product, listing, tree);
        let checksum = calculate_checksum(&syncable_projection(product, listing, &associations))?;
        Ok((associations, checksum))
    }

    /// Decide whether the pair must be pushed and update `record` accordingly.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the product, listing and record do not
    /// describe the same pair, or a checksum or transition error.
    pub fn plan(
        &self,
        product: &Product,
        listing: &SystemListing,
        tree: Option<&CategoryTree>,
        record: &mut SyncRecord,
        pass_id: Ulid,
    ) -> Result<ReconcileOutcome, SyncError> {
        ensure_same_pair(product, listing, record)?;
        self.locks.with_record(record.product_id, record.system, || {
            self.plan_locked(product, listing, tree, record, pass_id)
        })
    }

    fn plan_locked(
        &self,
        product: &Product,
        listing: &SystemListing,
        tree: Option<&CategoryTree>,
        record: &mut SyncRecord,
        pass_id: Ulid,
    ) -> Result<ReconcileOutcome, SyncError> {
        if matches!(record.status, SyncStatus::Disabled | SyncStatus::Conflict) {
            return Ok(ReconcileOutcome::Skipped { status: record.status });
        }
        record.last_pass_id = Some(pass_id);

        let conflicts = detect_conflicts(&listing.mapping, &self.directory, listing.system);
        if let Some(reason) = conflict_reason(&conflicts) {
            record.mark_conflict(reason.clone());
            return Ok(ReconcileOutcome::Conflict { reason });
        }

        let (associations, checksum) = self.checksum(product, listing, tree)?;
        // Only a confirmed push reaches `synced`; pending and failed pairs are re-pushed.
        if record.status == SyncStatus::Synced && !record.needs_sync(&checksum) {
            return Ok(ReconcileOutcome::UpToDate { checksum });
        }

        record.mark_pending()?;
        Ok(ReconcileOutcome::Push(PushPlan {
            product_id: record.product_id,
            system: record.system,
            checksum,
            rule: associations.rule,
            associations: associations.payload(),
            default_category: associations.default_category,
            unresolved: associations.unresolved,
            pass_id,
        }))
    }

    /// # Errors
    /// Returns [`SyncError::NotPending`] unless the record is `pending`.
    pub fn confirm(
        &self,
        record: &mut SyncRecord,
        pushed: &PushPlan,
        now: OffsetDateTime,
    ) -> Result<(), SyncError> {
        self.locks.with_record(record.product_id, record.system, || {
            record.confirm_success(pushed.checksum.clone(), now)
        })
    }

    /// # Errors
    /// Returns [`SyncError::Transition`] unless the record is `pending` or `synced`.
    pub fn fail(
        &self,
        record: &mut SyncRecord,
        message: &str,
        now: OffsetDateTime,
    ) -> Result<(), SyncError> {
        self.locks.with_record(record.product_id, record.system, || {
            record.record_failure(message, now)
        })
    }

    /// Replace the listing's mapping with a manual selection.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the primary is outside the selection or
    /// the selection exceeds `max_selected`.
    pub fn assign(
        &self,
        listing: &mut SystemListing,
        selection: &[CategoryId],
        primary: Option<CategoryId>,
        now: OffsetDateTime,
    ) -> Result<Vec<CategoryId>, SyncError> {
        let record = from_selection(selection, primary, &self.directory, listing.system, now)?;
        record.validate(self.config.max_selected)?;
        let unresolved = unresolved_ids(&record);
        log_unresolved(listing, "assign", &unresolved);
        self.locks.with_record(listing.product_id, listing.system, || {
            listing.mapping = MappingValue::Canonical(record);
        });
        Ok(unresolved)
    }

    /// Replace the listing's mapping with ids reported by the downstream system.
    /// Returns the ids that could not be matched to a catalog category.
    pub fn pull(
        &self,
        listing: &mut SystemListing,
        external_ids: &[ExternalId],
        now: OffsetDateTime,
    ) -> Vec<ExternalId> {
        let filtered = self.config.filter_pulled(external_ids);
        let pulled = from_external_ids(&filtered, &self.directory, listing.system, now);
        if !pulled.unmatched.is_empty() {
            tracing::warn!(
                product_id = listing.product_id.0,
                system = listing.system.0,
                unmatched_count = pulled.unmatched.len(),
                unmatched = ?pulled.unmatched,
                "pulled external categories without catalog counterpart"
            );
        }
        let record = pulled.record.sanitize(self.config.max_selected);
        self.locks.with_record(listing.product_id, listing.system, || {
            listing.mapping = MappingValue::Canonical(record);
        });
        pulled.unmatched
    }

    /// Re-resolve the listing's selection against the directory.
    /// Returns the ids that are still unresolved; an empty mapping is left alone.
    pub fn refresh(&self, listing: &mut SystemListing, now: OffsetDateTime) -> Vec<CategoryId> {
        self.locks.with_record(listing.product_id, listing.system, || {
            let Some(record) = std::mem::take(&mut listing.mapping).into_record() else {
                return Vec::new();
            };
            let refreshed = converter::refresh(&record, &self.directory, listing.system, now);
            let unresolved = unresolved_ids(&refreshed);
            log_unresolved(listing, "refresh", &unresolved);
            listing.mapping = MappingValue::Canonical(refreshed);
            unresolved
        })
    }
}

impl<D: CategoryDirectory + Sync> Reconciler<D> {
    /// Plan a batch across worker threads. Items are ordered by priority and
    /// dealt round-robin to `sweep_workers` threads sharing this reconciler.
    #[must_use]
    pub fn sweep(&self, mut items: Vec<SweepItem>, tree: Option<&CategoryTree>) -> SweepResult {
        let pass_id = Ulid::new();
        items.sort_by_key(|item| (item.record.priority, item.record.product_id, item.record.system));

        let workers = self.config.sweep_workers.clamp(1, items.len().max(1));
        let mut buckets = (0..workers).map(|_| Vec::new()).collect::<Vec<_>>();
        for (index, item) in items.into_iter().enumerate() {
            if let Some(bucket) = buckets.get_mut(index % workers) {
                bucket.push((index, item));
            }
        }

        let mut done = std::thread::scope(|scope| {
            let handles = buckets
                .into_iter()
                .map(|bucket| {
                    scope.spawn(move || {
                        bucket
                            .into_iter()
                            .map(|(index, item)| (index, self.sweep_one(item, tree, pass_id)))
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .flat_map(|handle| match handle.join() {
                    Ok(entries) => entries,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect::<Vec<_>>()
        });
        done.sort_by_key(|(index, _)| *index);

        let result =
            SweepResult { pass_id, entries: done.into_iter().map(|(_, entry)| entry).collect() };
        tracing::info!(
            pass_id = %pass_id,
            items = result.entries.len(),
            pushes = result.pushes().count(),
            workers,
            "reconciliation sweep finished"
        );
        result
    }

    fn sweep_one(&self, item: SweepItem, tree: Option<&CategoryTree>, pass_id: Ulid) -> SweepEntry {
        let SweepItem { product, listing, mut record } = item;
        let outcome = self.plan(&product, &listing, tree, &mut record, pass_id);
        if let Err(err) = &outcome {
            tracing::warn!(
                product_id = record.product_id.0,
                system = record.system.0,
                error = %err,
                "reconciliation failed for pair"
            );
        }
        SweepEntry { record, outcome }
    }
}

fn ensure_same_pair(
    product: &Product,
    listing: &SystemListing,
    record: &SyncRecord,
) -> Result<(), SyncError> {
    if listing.product_id != product.id
        || record.product_id != product.id
        || record.system != listing.system
    {
        return Err(SyncError::Validation(format!(
            "product {}, listing ({}, {}) and sync record ({}, {}) MUST describe the same pair",
            product.id, listing.product_id, listing.system, record.product_id, record.system
        )));
    }
    Ok(())
}

fn log_unresolved(listing: &SystemListing, operation: &str, unresolved: &[CategoryId]) {
    if unresolved.is_empty() {
        return;
    }
    tracing::warn!(
        product_id = listing.product_id.0,
        system = listing.system.0,
        operation,
        unresolved_count = unresolved.len(),
        unresolved = ?unresolved,
        "selected categories not resolvable for system"
    );
}
