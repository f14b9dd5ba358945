//! Association builder: picks the external category ids to send for one
//! (product, system) pair through a fixed fallback ladder.
//!
//! Ladder, first applicable rule wins:
//! 1. canonical record with mappings: emit its resolved values as stored
//! 2. canonical record with a selection but no mappings: resolve the selection now
//! 3. legacy flat record: emit its resolved values
//! 4. no per-system record: resolve the catalog-wide categories
//! 5. nothing anywhere: emit the default root category
//!
//! Whenever a rule yields no emittable id the default root is emitted instead,
//! so a product never leaves with zero associations.

use serde::{Deserialize, Serialize};

use crate::converter::{primary_external_id, to_external_id_list, unresolved_ids};
use crate::directory::CategoryDirectory;
use crate::mapping::{dedupe, MappingValue};
use crate::product::CategoryTree;
use crate::{CategoryId, ExternalId, SystemId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LadderRule {
    PerSystemMappings,
    PerSystemSelection,
    LegacyMappings,
    CatalogWide,
    DefaultRoot,
}

impl LadderRule {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerSystemMappings => "per_system_mappings",
            Self::PerSystemSelection => "per_system_selection",
            Self::LegacyMappings => "legacy_mappings",
            Self::CatalogWide => "catalog_wide",
            Self::DefaultRoot => "default_root",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AssociationOptions {
    pub default_root: ExternalId,
    pub expand_ancestors: bool,
}

/// One entry of the outbound association payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryAssociation {
    pub id: ExternalId,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct AssociationPlan {
    pub rule: LadderRule,
    /// Ids to send, deduplicated, first occurrence wins.
    pub external_ids: Vec<ExternalId>,
    /// Canonical ids that were selected but could not be resolved.
    pub unresolved: Vec<CategoryId>,
    pub default_category: Option<ExternalId>,
    /// True when the default root replaced an empty result.
    pub used_default_root: bool,
}

impl AssociationPlan {
    #[must_use]
    pub fn payload(&self) -> Vec<CategoryAssociation> {
        self.external_ids.iter().map(|id| CategoryAssociation { id: *id }).collect()
    }
}

/// Which ladder rule applies, without touching the directory.
#[must_use]
pub fn select_rule(value: &MappingValue, catalog_categories: &[CategoryId]) -> LadderRule {
    match value {
        MappingValue::Canonical(record) if !record.mappings.is_empty() => {
            LadderRule::PerSystemMappings
        }
        MappingValue::Canonical(record) if !record.selected.is_empty() => {
            LadderRule::PerSystemSelection
        }
        MappingValue::Legacy(legacy) if !legacy.mappings.is_empty() => LadderRule::LegacyMappings,
        _ if !catalog_categories.is_empty() => LadderRule::CatalogWide,
        _ => LadderRule::DefaultRoot,
    }
}

/// Resolve the outbound category ids for one (product, system) pair.
///
/// `tree` is only consulted when ancestor expansion is enabled.
#[must_use]
pub fn resolve_associations<D: CategoryDirectory + ?Sized>(
    value: &MappingValue,
    catalog_categories: &[CategoryId],
    tree: Option<&CategoryTree>,
    directory: &D,
    system: SystemId,
    options: &AssociationOptions,
) -> AssociationPlan {
    let rule = select_rule(value, catalog_categories);

    let (external_ids, unresolved, preferred) = match (rule, value) {
        (LadderRule::PerSystemMappings, MappingValue::Canonical(record)) => {
            (to_external_id_list(record), unresolved_ids(record), primary_external_id(record))
        }
        (LadderRule::PerSystemSelection, MappingValue::Canonical(record)) => {
            let (resolved, unresolved) =
                resolve_now(&record.selected, tree, directory, system, options);
            let preferred = record.primary.and_then(|primary| directory.resolve(primary, system));
            (resolved, unresolved, preferred)
        }
        (LadderRule::LegacyMappings, MappingValue::Legacy(legacy)) => {
            let record = legacy.clone().into_record();
            (to_external_id_list(&record), unresolved_ids(&record), None)
        }
        (LadderRule::CatalogWide, _) => {
            let (resolved, unresolved) =
                resolve_now(catalog_categories, tree, directory, system, options);
            (resolved, unresolved, None)
        }
        _ => (Vec::new(), Vec::new(), None),
    };

    let mut external_ids = dedupe(external_ids);
    let used_default_root = external_ids.is_empty();
    if used_default_root {
        external_ids.push(options.default_root);
    }

    let default_category = preferred
        .filter(|preferred| external_ids.contains(preferred))
        .or_else(|| external_ids.first().copied());

    tracing::debug!(
        system = system.0,
        rule = rule.as_str(),
        emitted = external_ids.len(),
        used_default_root,
        "resolved category associations"
    );
    if !unresolved.is_empty() {
        tracing::warn!(
            system = system.0,
            rule = rule.as_str(),
            unresolved_count = unresolved.len(),
            unresolved = ?unresolved,
            "categories omitted from associations: not resolvable for system"
        );
    }

    AssociationPlan { rule, external_ids, unresolved, default_category, used_default_root }
}

fn resolve_now<D: CategoryDirectory + ?Sized>(
    ids: &[CategoryId],
    tree: Option<&CategoryTree>,
    directory: &D,
    system: SystemId,
    options: &AssociationOptions,
) -> (Vec<ExternalId>, Vec<CategoryId>) {
    let candidates = match tree {
        Some(tree) if options.expand_ancestors => tree.expand(ids),
        _ => dedupe(ids.to_vec()),
    };

    let mut resolved = Vec::new();
    let mut unresolved = Vec::new();
    for category_id in candidates {
        match directory.resolve(category_id, system) {
            Some(external_id) => resolved.push(external_id),
            None => unresolved.push(category_id),
        }
    }
    (resolved, unresolved)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::directory::tests::snapshot;
    use crate::mapping::parse_mapping_value;
    use crate::product::Category;
    use crate::SyncError;

    const SHOP: SystemId = SystemId(1);

    fn options() -> AssociationOptions {
        match ExternalId::new(2) {
            Some(default_root) => AssociationOptions { default_root, expand_ancestors: false },
            None => panic!("root id must be positive"),
        }
    }

    fn emitted(plan: &AssociationPlan) -> Vec<u64> {
        plan.external_ids.iter().map(|id| id.get()).collect()
    }

    fn value(raw: &serde_json::Value) -> MappingValue {
        match parse_mapping_value(raw) {
            Ok(value) => value,
            Err(err) => panic!("fixture mapping should parse: {err}"),
        }
    }

    fn catalog(raw: &[u64]) -> Vec<CategoryId> {
        raw.iter().copied().map(CategoryId).collect()
    }

    #[test]
    fn rule_one_uses_stored_mappings_without_directory() {
        let directory = snapshot(&[]);
        let mapping = value(&json!({
            "ui": {"selected": [100, 103, 104], "primary": 103},
            "mappings": {"100": 9, "103": 20, "104": 0}
        }));

        let plan =
            resolve_associations(&mapping, &catalog(&[100]), None, &directory, SHOP, &options());

        assert_eq!(plan.rule, LadderRule::PerSystemMappings);
        assert_eq!(emitted(&plan), vec![9, 20]);
        assert_eq!(plan.unresolved, catalog(&[104]));
        assert_eq!(plan.default_category.map(ExternalId::get), Some(20));
    }

    #[test]
    fn rule_two_resolves_selection_at_request_time() {
        let directory = snapshot(&[(1, 100, 9), (1, 103, 15)]);
        let mapping = value(&json!({"ui": {"selected": [103, 100, 555], "primary": 100}}));

        let plan = resolve_associations(&mapping, &[], None, &directory, SHOP, &options());

        assert_eq!(plan.rule, LadderRule::PerSystemSelection);
        assert_eq!(emitted(&plan), vec![15, 9]);
        assert_eq!(plan.unresolved, catalog(&[555]));
        assert_eq!(plan.default_category.map(ExternalId::get), Some(9));
    }

    #[test]
    fn rule_three_reads_legacy_flat_record() {
        let directory = snapshot(&[]);
        let mapping = value(&json!({"100": 9, "103": 15, "7": -1}));

        let plan = resolve_associations(&mapping, &[], None, &directory, SHOP, &options());

        assert_eq!(plan.rule, LadderRule::LegacyMappings);
        assert_eq!(emitted(&plan), vec![9, 15]);
        assert_eq!(plan.unresolved, catalog(&[7]));
        assert_eq!(plan.default_category.map(ExternalId::get), Some(9));
    }

    #[test]
    fn rule_four_falls_back_to_catalog_categories() {
        let directory = snapshot(&[(1, 100, 9), (1, 103, 15)]);

        let plan = resolve_associations(
            &MappingValue::Empty,
            &catalog(&[100, 103]),
            None,
            &directory,
            SHOP,
            &options(),
        );

        assert_eq!(plan.rule, LadderRule::CatalogWide);
        assert_eq!(
            serde_json::to_value(plan.payload()).ok(),
            Some(json!([{"id": 9}, {"id": 15}]))
        );
    }

    #[test]
    fn rule_five_emits_exactly_one_default_association() {
        let directory = snapshot(&[(1, 100, 9)]);

        let plan =
            resolve_associations(&MappingValue::Empty, &[], None, &directory, SHOP, &options());

        assert_eq!(plan.rule, LadderRule::DefaultRoot);
        assert_eq!(emitted(&plan), vec![2]);
        assert!(plan.used_default_root);
        assert_eq!(plan.default_category.map(ExternalId::get), Some(2));
    }

    #[test]
    fn blank_canonical_record_counts_as_no_record() {
        let mapping = value(&json!({"ui": {"selected": []}, "mappings": {}}));
        assert_eq!(select_rule(&mapping, &catalog(&[1])), LadderRule::CatalogWide);
        assert_eq!(select_rule(&mapping, &[]), LadderRule::DefaultRoot);
    }

    #[test]
    fn unresolvable_rule_result_is_replaced_by_default_root() {
        let directory = snapshot(&[]);
        let plan = resolve_associations(
            &MappingValue::Empty,
            &catalog(&[100, 103]),
            None,
            &directory,
            SHOP,
            &options(),
        );

        assert_eq!(plan.rule, LadderRule::CatalogWide);
        assert_eq!(emitted(&plan), vec![2]);
        assert!(plan.used_default_root);
        assert_eq!(plan.unresolved, catalog(&[100, 103]));
    }

    #[test]
    fn ancestors_are_resolved_when_expansion_is_enabled() -> Result<(), SyncError> {
        let directory = snapshot(&[(1, 10, 3), (1, 100, 9)]);
        let tree = CategoryTree::from_categories([
            Category { id: CategoryId(10), name: "Tools".to_string(), parent: None, depth: 0 },
            Category {
                id: CategoryId(100),
                name: "Drills".to_string(),
                parent: Some(CategoryId(10)),
                depth: 1,
            },
        ])?;
        let mut options = options();

        let flat = resolve_associations(
            &MappingValue::Empty,
            &catalog(&[100]),
            Some(&tree),
            &directory,
            SHOP,
            &options,
        );
        assert_eq!(emitted(&flat), vec![9]);

        options.expand_ancestors = true;
        let expanded = resolve_associations(
            &MappingValue::Empty,
            &catalog(&[100]),
            Some(&tree),
            &directory,
            SHOP,
            &options,
        );
        assert_eq!(emitted(&expanded), vec![9, 3]);
        Ok(())
    }

    #[test]
    fn legacy_and_canonical_records_emit_the_same_ids() {
        let directory = snapshot(&[]);
        let legacy = value(&json!({"100": 9, "103": 15}));
        let canonical = value(&json!({
            "ui": {"selected": [100, 103], "primary": null},
            "mappings": {"100": 9, "103": 15}
        }));

        let from_legacy = resolve_associations(&legacy, &[], None, &directory, SHOP, &options());
        let from_canonical =
            resolve_associations(&canonical, &[], None, &directory, SHOP, &options());

        assert_eq!(from_legacy.external_ids, from_canonical.external_ids);
    }
}
