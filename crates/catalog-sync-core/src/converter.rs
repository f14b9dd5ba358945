//! Conversions between a UI selection, the canonical mapping record, and the flat
//! list of external ids that is transmitted downstream.
//!
//! Every function here is pure apart from directory lookups. Nothing is logged;
//! ids that fail to resolve are reported back to the caller instead.

use time::OffsetDateTime;

use crate::directory::CategoryDirectory;
use crate::mapping::{dedupe, MappingRecord, MappingSource, Mappings, Provenance, Selection};
use crate::{CategoryId, ExternalId, SyncError, SystemId};

/// Result of turning a downstream id list into a canonical record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledRecord {
    pub record: MappingRecord,
    /// External ids with no canonical counterpart, in input order.
    pub unmatched: Vec<ExternalId>,
}

/// Build a canonical record from a UI selection.
///
/// Ids the directory cannot resolve stay in `selected` but get no `mappings` entry.
/// Duplicate ids are collapsed, keeping the first occurrence.
///
/// # Errors
/// Returns [`SyncError::Validation`] when `primary` is given but not part of `selection`.
pub fn from_selection<D: CategoryDirectory + ?Sized>(
    selection: &[CategoryId],
    primary: Option<CategoryId>,
    directory: &D,
    system: SystemId,
    now: OffsetDateTime,
) -> Result<MappingRecord, SyncError> {
    let selected = dedupe(selection.to_vec());
    if let Some(primary) = primary {
        if !selected.contains(&primary) {
            return Err(SyncError::Validation(format!(
                "primary category {primary} MUST be part of the selection"
            )));
        }
    }

    let mappings = selected
        .iter()
        .filter_map(|category_id| {
            directory.resolve(*category_id, system).map(|external_id| (*category_id, Some(external_id)))
        })
        .collect::<Mappings>();

    Ok(MappingRecord {
        selected,
        primary,
        mappings,
        provenance: Provenance { last_updated: Some(now), source: MappingSource::Manual },
    })
}

/// Build a canonical record from ids reported by the downstream system.
///
/// The first id that reverse-resolves becomes the primary.
#[must_use]
pub fn from_external_ids<D: CategoryDirectory + ?Sized>(
    external_ids: &[ExternalId],
    directory: &D,
    system: SystemId,
    now: OffsetDateTime,
) -> PulledRecord {
    let mut selected = Vec::new();
    let mut mappings = Mappings::new();
    let mut unmatched = Vec::new();

    for external_id in dedupe(external_ids.to_vec()) {
        match directory.reverse_resolve(external_id, system) {
            Some(category_id) if !mappings.contains(category_id) => {
                selected.push(category_id);
                mappings.insert(category_id, Some(external_id));
            }
            Some(_) => {}
            None => unmatched.push(external_id),
        }
    }

    PulledRecord {
        record: MappingRecord {
            primary: selected.first().copied(),
            selected,
            mappings,
            provenance: Provenance { last_updated: Some(now), source: MappingSource::Pull },
        },
        unmatched,
    }
}

#[must_use]
pub fn to_selection(record: &MappingRecord) -> Selection {
    record.selection()
}

/// Resolved external ids in mapping iteration order; unresolved entries never appear.
#[must_use]
pub fn to_external_id_list(record: &MappingRecord) -> Vec<ExternalId> {
    record.mappings.resolved().collect()
}

#[must_use]
pub fn primary_external_id(record: &MappingRecord) -> Option<ExternalId> {
    record.primary.and_then(|primary| record.mappings.get(primary).flatten())
}

#[must_use]
pub fn has_any_resolved_mapping(record: &MappingRecord) -> bool {
    record.mappings.resolved().next().is_some()
}

/// Selected ids without a resolved external id, in selection order, followed by
/// unresolved mapping keys that are not selected.
#[must_use]
pub fn unresolved_ids(record: &MappingRecord) -> Vec<CategoryId> {
    let mut unresolved = record
        .selected
        .iter()
        .copied()
        .filter(|category_id| record.mappings.get(*category_id).flatten().is_none())
        .collect::<Vec<_>>();
    for (category_id, external_id) in record.mappings.iter() {
        if external_id.is_none() && !record.selected.contains(&category_id) {
            unresolved.push(category_id);
        }
    }
    unresolved
}

/// Unresolved mapping entries plus selected ids absent from `mappings`.
#[must_use]
pub fn count_unresolved(record: &MappingRecord) -> usize {
    let placeholders = record.mappings.iter().filter(|(_, external_id)| external_id.is_none()).count();
    let missing =
        record.selected.iter().filter(|category_id| !record.mappings.contains(**category_id)).count();
    placeholders + missing
}

/// Re-resolve the whole selection against the directory, replacing `mappings`.
///
/// Ids that still fail to resolve are kept as unresolved entries so they stay
/// visible to [`count_unresolved`].
#[must_use]
pub fn refresh<D: CategoryDirectory + ?Sized>(
    record: &MappingRecord,
    directory: &D,
    system: SystemId,
    now: OffsetDateTime,
) -> MappingRecord {
    let mappings = record
        .selected
        .iter()
        .map(|category_id| (*category_id, directory.resolve(*category_id, system)))
        .collect::<Mappings>();

    MappingRecord {
        selected: record.selected.clone(),
        primary: record.primary,
        mappings,
        provenance: Provenance { last_updated: Some(now), source: MappingSource::Refresh },
    }
}
