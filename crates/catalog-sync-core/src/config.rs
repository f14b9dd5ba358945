//! Reconciliation settings loaded from YAML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::association::AssociationOptions;
use crate::{ExternalId, SyncError};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// External id emitted when a product has nothing else to send (default: 2).
    #[serde(default = "default_root_category")]
    pub default_root_category: u64,
    /// Upper bound on a record's `selected` length (default: 10).
    #[serde(default = "default_max_selected")]
    pub max_selected: usize,
    /// Downstream root ids skipped when categories are pulled (default: 1, 2).
    #[serde(default = "default_ignored_pull_ids")]
    pub ignored_pull_ids: Vec<u64>,
    /// Add canonical ancestors before resolving through the directory.
    #[serde(default)]
    pub expand_ancestors: bool,
    /// Worker threads for a batch sweep (default: 4).
    #[serde(default = "default_sweep_workers")]
    pub sweep_workers: usize,
}

fn default_root_category() -> u64 {
    2
}

fn default_max_selected() -> usize {
    10
}

fn default_ignored_pull_ids() -> Vec<u64> {
    vec![1, 2]
}

fn default_sweep_workers() -> usize {
    4
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_root_category: default_root_category(),
            max_selected: default_max_selected(),
            ignored_pull_ids: default_ignored_pull_ids(),
            expand_ancestors: false,
            sweep_workers: default_sweep_workers(),
        }
    }
}

impl SyncConfig {
    /// Read a YAML config file.
    ///
    /// # Errors
    /// Returns [`SyncError::Config`] when the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            SyncError::Config(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&content)
    }

    /// # Errors
    /// Returns [`SyncError::Config`] when the YAML is malformed or a value is out of range.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, SyncError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|err| SyncError::Config(format!("invalid config YAML: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`SyncError::Config`] for a zero root category, selection bound or worker count.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.default_root_category == 0 {
            return Err(SyncError::Config(
                "default_root_category MUST be greater than zero".to_string(),
            ));
        }
        if self.max_selected == 0 {
            return Err(SyncError::Config("max_selected MUST be at least 1".to_string()));
        }
        if self.sweep_workers == 0 {
            return Err(SyncError::Config("sweep_workers MUST be at least 1".to_string()));
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`SyncError::Config`] when `default_root_category` is zero.
    pub fn association_options(&self) -> Result<AssociationOptions, SyncError> {
        let default_root = ExternalId::new(self.default_root_category).ok_or_else(|| {
            SyncError::Config("default_root_category MUST be greater than zero".to_string())
        })?;
        Ok(AssociationOptions { default_root, expand_ancestors: self.expand_ancestors })
    }

    /// Drop downstream root ids that never map to a catalog category.
    #[must_use]
    pub fn filter_pulled(&self, external_ids: &[ExternalId]) -> Vec<ExternalId> {
        external_ids
            .iter()
            .copied()
            .filter(|external_id| !self.ignored_pull_ids.contains(&external_id.get()))
            .collect()
    }
}
