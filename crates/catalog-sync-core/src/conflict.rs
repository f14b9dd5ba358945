//! Structural mapping checks that put a Sync Record into `conflict`.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::directory::CategoryDirectory;
use crate::mapping::{MappingRecord, MappingValue};
use crate::{CategoryId, ExternalId, SystemId};

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingConflict {
    OrphanMapping {
        category_id: CategoryId,
    },
    PrimaryNotSelected {
        primary: CategoryId,
    },
    /// The directory says `external_id` belongs to another canonical category.
    CrossWired {
        category_id: CategoryId,
        external_id: ExternalId,
        owner: CategoryId,
    },
    DuplicateExternal {
        external_id: ExternalId,
        categories: Vec<CategoryId>,
    },
}

impl MappingConflict {
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::OrphanMapping { category_id } => {
                format!("mapping for category {category_id} is not part of the selection")
            }
            Self::PrimaryNotSelected { primary } => {
                format!("primary category {primary} is not part of the selection")
            }
            Self::CrossWired { category_id, external_id, owner } => format!(
                "category {category_id} maps to external {external_id}, which belongs to category {owner}"
            ),
            Self::DuplicateExternal { external_id, categories } => format!(
                "external {external_id} is mapped from several categories: {}",
                categories.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
            ),
        }
    }
}

/// Join reasons into one operator-facing message, `None` when there is nothing to report.
#[must_use]
pub fn conflict_reason(conflicts: &[MappingConflict]) -> Option<String> {
    if conflicts.is_empty() {
        return None;
    }
    Some(conflicts.iter().map(MappingConflict::reason).collect::<Vec<_>>().join("; "))
}

#[must_use]
pub fn detect_conflicts<D: CategoryDirectory + ?Sized>(
    value: &MappingValue,
    directory: &D,
    system: SystemId,
) -> Vec<MappingConflict> {
    match value {
        MappingValue::Canonical(record) => {
            let mut conflicts = selection_conflicts(record);
            conflicts.extend(mapping_conflicts(record, directory, system));
            conflicts
        }
        MappingValue::Legacy(legacy) => {
            mapping_conflicts(&legacy.clone().into_record(), directory, system)
        }
        MappingValue::Empty => Vec::new(),
    }
}

fn selection_conflicts(record: &MappingRecord) -> Vec<MappingConflict> {
    let mut conflicts = record
        .mappings
        .keys()
        .filter(|category_id| !record.selected.contains(category_id))
        .map(|category_id| MappingConflict::OrphanMapping { category_id })
        .collect::<Vec<_>>();
    if let Some(primary) = record.primary {
        if !record.selected.contains(&primary) {
            conflicts.push(MappingConflict::PrimaryNotSelected { primary });
        }
    }
    conflicts
}

fn mapping_conflicts<D: CategoryDirectory + ?Sized>(
    record: &MappingRecord,
    directory: &D,
    system: SystemId,
) -> Vec<MappingConflict> {
    let mut conflicts = Vec::new();
    let mut owners: BTreeMap<ExternalId, Vec<CategoryId>> = BTreeMap::new();

    for (category_id, external_id) in record.mappings.iter() {
        let Some(external_id) = external_id else {
            continue;
        };
        owners.entry(external_id).or_default().push(category_id);
        if let Some(owner) = directory.reverse_resolve(external_id, system) {
            if owner != category_id {
                conflicts.push(MappingConflict::CrossWired { category_id, external_id, owner });
            }
        }
    }

    conflicts.extend(owners.into_iter().filter(|(_, categories)| categories.len() > 1).map(
        |(external_id, categories)| MappingConflict::DuplicateExternal { external_id, categories },
    ));
    conflicts
}
