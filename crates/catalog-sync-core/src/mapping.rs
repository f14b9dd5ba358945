//! Category mapping shapes and the single parser that classifies persisted values.
//!
//! A per-system category assignment is stored in one of three shapes: the
//! canonical record (`ui` + `mappings` + `metadata`), a legacy flat object
//! (`{"<canonical>": <external>}`), or nothing at all. [`parse_mapping_value`]
//! is the only place that sniffs the shape; everything downstream matches on
//! [`MappingValue`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::format_description::well_known::Rfc3339;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::{CategoryId, ExternalId, SyncError};

/// `YYYY-MM-DD HH:MM:SS` as written by SQL `datetime()`, read as UTC.
const SQL_DATETIME: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
const LEGACY_METADATA_KEYS: [&str; 2] = ["last_updated", "source"];

/// Ordered partial function canonical id -> external id.
///
/// `None` marks a selection that is known but not resolved yet. Keys are unique
/// and keep their insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mappings {
    entries: Vec<(CategoryId, Option<ExternalId>)>,
}

impl Mappings {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace in place; replacing keeps the original position.
    pub fn insert(&mut self, category_id: CategoryId, external_id: Option<ExternalId>) {
        if let Some(slot) = self.entries.iter_mut().find(|(key, _)| *key == category_id) {
            slot.1 = external_id;
        } else {
            self.entries.push((category_id, external_id));
        }
    }

    /// Outer `None`: no entry. Inner `None`: unresolved entry.
    #[must_use]
    pub fn get(&self, category_id: CategoryId) -> Option<Option<ExternalId>> {
        self.entries.iter().find(|(key, _)| *key == category_id).map(|(_, value)| *value)
    }

    #[must_use]
    pub fn contains(&self, category_id: CategoryId) -> bool {
        self.entries.iter().any(|(key, _)| *key == category_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CategoryId, Option<ExternalId>)> + '_ {
        self.entries.iter().copied()
    }

    pub fn keys(&self) -> impl Iterator<Item = CategoryId> + '_ {
        self.entries.iter().map(|(key, _)| *key)
    }

    /// Resolved external ids in iteration order.
    pub fn resolved(&self) -> impl Iterator<Item = ExternalId> + '_ {
        self.entries.iter().filter_map(|(_, value)| *value)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(CategoryId) -> bool) {
        self.entries.retain(|(key, _)| keep(*key));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(CategoryId, Option<ExternalId>)> for Mappings {
    fn from_iter<T: IntoIterator<Item = (CategoryId, Option<ExternalId>)>>(iter: T) -> Self {
        let mut mappings = Self::new();
        for (category_id, external_id) in iter {
            mappings.insert(category_id, external_id);
        }
        mappings
    }
}

/// UI-facing projection of a mapping record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Selection {
    pub selected: Vec<CategoryId>,
    pub primary: Option<CategoryId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MappingSource {
    Manual,
    Pull,
    Refresh,
    Empty,
}

impl MappingSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Pull => "pull",
            Self::Refresh => "refresh",
            Self::Empty => "empty",
        }
    }

    /// Parse a stored source tag, including the aliases older writers used.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" | "migration" | "migration_ui_format" | "migration_prestashop_format"
            | "unknown" => Some(Self::Manual),
            "pull" | "pulled-from-system" | "prestashop_direct" => Some(Self::Pull),
            "refresh" | "refreshed" | "sync" => Some(Self::Refresh),
            "empty" => Some(Self::Empty),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Provenance {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    pub source: MappingSource,
}

/// Canonical Mapping Record for one (product, downstream system) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRecord {
    pub selected: Vec<CategoryId>,
    pub primary: Option<CategoryId>,
    pub mappings: Mappings,
    pub provenance: Provenance,
}

impl MappingRecord {
    #[must_use]
    pub fn empty(now: OffsetDateTime) -> Self {
        Self {
            selected: Vec::new(),
            primary: None,
            mappings: Mappings::new(),
            provenance: Provenance { last_updated: Some(now), source: MappingSource::Empty },
        }
    }

    /// True when neither a selection nor a mapping is recorded.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.selected.is_empty() && self.mappings.is_empty()
    }

    /// Check the record's structural invariants.
    ///
    /// # Errors
    /// Returns [`SyncError::Validation`] when the selection has duplicates or exceeds
    /// `max_selected`, when `primary` is not selected, or when a mapping key is not selected.
    pub fn validate(&self, max_selected: usize) -> Result<(), SyncError> {
        let mut seen = BTreeSet::new();
        for category_id in &self.selected {
            if !seen.insert(*category_id) {
                return Err(SyncError::Validation(format!(
                    "selected category {category_id} MUST appear only once"
                )));
            }
        }

        if self.selected.len() > max_selected {
            return Err(SyncError::Validation(format!(
                "selected MUST contain at most {max_selected} categories (got {})",
                self.selected.len()
            )));
        }

        if let Some(primary) = self.primary {
            if !seen.contains(&primary) {
                return Err(SyncError::Validation(format!(
                    "primary category {primary} MUST be part of selected"
                )));
            }
        }

        if let Some(orphan) = self.mappings.keys().find(|key| !seen.contains(key)) {
            return Err(SyncError::Validation(format!(
                "mapping key {orphan} MUST be part of selected"
            )));
        }

        Ok(())
    }

    /// Repair a record so that [`MappingRecord::validate`] accepts it.
    #[must_use]
    pub fn sanitize(mut self, max_selected: usize) -> Self {
        self.selected = dedupe(self.selected);
        self.selected.truncate(max_selected);

        let selected: BTreeSet<CategoryId> = self.selected.iter().copied().collect();
        self.primary = match self.primary {
            Some(primary) if selected.contains(&primary) => Some(primary),
            _ => self.selected.first().copied(),
        };
        self.mappings.retain(|key| selected.contains(&key));
        self
    }

    #[must_use]
    pub fn selection(&self) -> Selection {
        Selection { selected: self.selected.clone(), primary: self.primary }
    }

    /// Render the persisted JSON form. Unresolved entries are written as `0`.
    #[must_use]
    pub fn to_persisted(&self) -> Value {
        let mut mappings = Map::new();
        for (category_id, external_id) in self.mappings.iter() {
            mappings.insert(
                category_id.to_string(),
                Value::from(external_id.map_or(0, ExternalId::get)),
            );
        }

        let last_updated = self
            .provenance
            .last_updated
            .and_then(|at| at.format(&Rfc3339).ok())
            .map_or(Value::Null, Value::String);

        serde_json::json!({
            "ui": {
                "selected": self.selected.iter().map(|id| id.0).collect::<Vec<_>>(),
                "primary": self.primary.map(|id| id.0),
            },
            "mappings": Value::Object(mappings),
            "metadata": {
                "last_updated": last_updated,
                "source": self.provenance.source.as_str(),
            },
        })
    }
}

/// Bare canonical id -> external id object without selection or provenance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyRecord {
    pub mappings: Mappings,
}

impl LegacyRecord {
    /// View the legacy object as a canonical record. The mapping keys become the
    /// selection so the record's invariants hold; no primary is inferred.
    #[must_use]
    pub fn into_record(self) -> MappingRecord {
        MappingRecord {
            selected: self.mappings.keys().collect(),
            primary: None,
            mappings: self.mappings,
            provenance: Provenance { last_updated: None, source: MappingSource::Empty },
        }
    }

    #[must_use]
    pub fn to_persisted(&self) -> Value {
        let mut object = Map::new();
        for (category_id, external_id) in self.mappings.iter() {
            object.insert(
                category_id.to_string(),
                Value::from(external_id.map_or(0, ExternalId::get)),
            );
        }
        Value::Object(object)
    }
}

/// Whatever mapping-shaped value is stored for a (product, system) pair.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MappingValue {
    Canonical(MappingRecord),
    Legacy(LegacyRecord),
    #[default]
    Empty,
}

impl MappingValue {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Canonical(_) => "canonical",
            Self::Legacy(_) => "legacy",
            Self::Empty => "empty",
        }
    }

    /// Canonical view of the value; legacy records are lifted, `Empty` yields `None`.
    #[must_use]
    pub fn into_record(self) -> Option<MappingRecord> {
        match self {
            Self::Canonical(record) => Some(record),
            Self::Legacy(legacy) => Some(legacy.into_record()),
            Self::Empty => None,
        }
    }

    #[must_use]
    pub fn to_persisted(&self) -> Option<Value> {
        match self {
            Self::Canonical(record) => Some(record.to_persisted()),
            Self::Legacy(legacy) => Some(legacy.to_persisted()),
            Self::Empty => None,
        }
    }
}

/// Classify a stored mapping value.
///
/// `null`, `""`, `[]` and `{}` are [`MappingValue::Empty`]. An object carrying a
/// top-level `mappings` key, a `ui` key, or bare `selected`/`primary` keys is
/// canonical; any other object is a legacy flat record. A JSON string is decoded
/// once more, since some writers double-encoded the column.
///
/// # Errors
/// Returns [`SyncError::Format`] when the value is not one of the accepted shapes or
/// contains ids that are not numeric.
pub fn parse_mapping_value(value: &Value) -> Result<MappingValue, SyncError> {
    match value {
        Value::Null => Ok(MappingValue::Empty),
        Value::Array(items) if items.is_empty() => Ok(MappingValue::Empty),
        Value::Object(object) if object.is_empty() => Ok(MappingValue::Empty),
        Value::Object(object) => {
            if object.contains_key("mappings") || object.contains_key("ui") {
                return parse_canonical(object).map(MappingValue::Canonical);
            }
            if object.contains_key("selected") || object.contains_key("primary") {
                let selection = parse_selection(object)?;
                return Ok(MappingValue::Canonical(MappingRecord {
                    selected: selection.selected,
                    primary: selection.primary,
                    mappings: Mappings::new(),
                    provenance: Provenance { last_updated: None, source: MappingSource::Manual },
                }));
            }
            parse_mappings_object(object, &LEGACY_METADATA_KEYS)
                .map(|mappings| MappingValue::Legacy(LegacyRecord { mappings }))
        }
        Value::String(raw) if raw.trim().is_empty() => Ok(MappingValue::Empty),
        Value::String(raw) => {
            let decoded: Value = serde_json::from_str(raw).map_err(|err| {
                SyncError::Format(format!("mapping value string is not JSON: {err}"))
            })?;
            if decoded.is_string() {
                return Err(SyncError::Format(
                    "mapping value MUST NOT be encoded more than twice".to_string(),
                ));
            }
            parse_mapping_value(&decoded)
        }
        other => Err(SyncError::Format(format!(
            "mapping value MUST be an object, got {}",
            json_type_name(other)
        ))),
    }
}

/// Parse a stored TEXT column holding a mapping value.
///
/// # Errors
/// Returns [`SyncError::Format`] when the text is not JSON or not an accepted shape.
pub fn parse_mapping_str(raw: &str) -> Result<MappingValue, SyncError> {
    if raw.trim().is_empty() {
        return Ok(MappingValue::Empty);
    }
    let value: Value = serde_json::from_str(raw)
        .map_err(|err| SyncError::Format(format!("mapping value is not JSON: {err}")))?;
    parse_mapping_value(&value)
}

fn parse_canonical(object: &Map<String, Value>) -> Result<MappingRecord, SyncError> {
    let selection = match object.get("ui") {
        None | Some(Value::Null) => Selection::default(),
        Some(Value::Array(items)) if items.is_empty() => Selection::default(),
        Some(Value::Object(ui)) => parse_selection(ui)?,
        Some(other) => {
            return Err(SyncError::Format(format!(
                "ui MUST be an object, got {}",
                json_type_name(other)
            )))
        }
    };

    let mappings = match object.get("mappings") {
        None | Some(Value::Null) => Mappings::new(),
        Some(Value::Array(items)) if items.is_empty() => Mappings::new(),
        Some(Value::Object(mappings)) => parse_mappings_object(mappings, &[])?,
        Some(other) => {
            return Err(SyncError::Format(format!(
                "mappings MUST be an object, got {}",
                json_type_name(other)
            )))
        }
    };

    let provenance = match object.get("metadata") {
        Some(Value::Object(metadata)) => Provenance {
            last_updated: metadata.get("last_updated").and_then(Value::as_str).and_then(parse_timestamp),
            source: metadata
                .get("source")
                .and_then(Value::as_str)
                .and_then(MappingSource::parse)
                .unwrap_or(MappingSource::Manual),
        },
        _ => Provenance { last_updated: None, source: MappingSource::Manual },
    };

    Ok(MappingRecord {
        selected: selection.selected,
        primary: selection.primary,
        mappings,
        provenance,
    })
}

fn parse_selection(object: &Map<String, Value>) -> Result<Selection, SyncError> {
    let selected = match object.get("selected") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            items.iter().map(|item| parse_category_id(item, "selected")).collect::<Result<_, _>>()?
        }
        Some(other) => {
            return Err(SyncError::Format(format!(
                "selected MUST be an array, got {}",
                json_type_name(other)
            )))
        }
    };

    let primary = match object.get("primary") {
        None | Some(Value::Null) => None,
        Some(value) => Some(parse_category_id(value, "primary")?),
    };

    Ok(Selection { selected, primary })
}

fn parse_mappings_object(
    object: &Map<String, Value>,
    skip_keys: &[&str],
) -> Result<Mappings, SyncError> {
    let mut mappings = Mappings::new();
    for (key, value) in object {
        if skip_keys.contains(&key.as_str()) {
            continue;
        }
        let category_id = key.trim().parse::<u64>().ok().filter(|id| *id > 0).ok_or_else(|| {
            SyncError::Format(format!("mapping key `{key}` is not a canonical category id"))
        })?;
        mappings.insert(CategoryId(category_id), parse_external_value(key, value)?);
    }
    Ok(mappings)
}

fn parse_external_value(key: &str, value: &Value) -> Result<Option<ExternalId>, SyncError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => {
            if let Some(raw) = number.as_i64() {
                return Ok(ExternalId::from_raw(raw));
            }
            number.as_u64().map(ExternalId::new).ok_or_else(|| {
                SyncError::Format(format!("mapping `{key}` MUST be an integer external id"))
            })
        }
        Value::String(raw) => raw.trim().parse::<i64>().map(ExternalId::from_raw).map_err(|_| {
            SyncError::Format(format!("mapping `{key}` MUST be an integer external id"))
        }),
        other => Err(SyncError::Format(format!(
            "mapping `{key}` MUST be an integer external id, got {}",
            json_type_name(other)
        ))),
    }
}

fn parse_category_id(value: &Value, field: &str) -> Result<CategoryId, SyncError> {
    let raw = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(raw) => raw.trim().parse::<u64>().ok(),
        _ => None,
    };
    raw.filter(|id| *id > 0).map(CategoryId).ok_or_else(|| {
        SyncError::Format(format!("{field} MUST contain positive category ids, got {value}"))
    })
}

fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    if let Ok(parsed) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(parsed);
    }
    PrimitiveDateTime::parse(raw, SQL_DATETIME).ok().map(PrimitiveDateTime::assume_utc)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn dedupe<T: Ord + Copy>(items: Vec<T>) -> Vec<T> {
    let mut seen = BTreeSet::new();
    items.into_iter().filter(|item| seen.insert(*item)).collect()
}
