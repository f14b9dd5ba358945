//! Sync Record state machine for one (product, system) pair.
//!
//! The stored checksum only moves on a confirmed push, so a failed delivery keeps
//! `needs_sync` true and the next pass retries without extra bookkeeping.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::checksum::{needs_sync, SyncChecksum};
use crate::{ProductId, SyncError, SystemId};

pub const DEFAULT_PRIORITY: u8 = 5;
pub const LOWEST_PRIORITY: u8 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    NeverSynced,
    Pending,
    Synced,
    Error,
    Conflict,
    Disabled,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeverSynced => "never-synced",
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Error => "error",
            Self::Conflict => "conflict",
            Self::Disabled => "disabled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "never-synced" => Some(Self::NeverSynced),
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            "error" => Some(Self::Error),
            "conflict" => Some(Self::Conflict),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl Display for SyncStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SyncRecord {
    pub product_id: ProductId,
    pub system: SystemId,
    pub status: SyncStatus,
    pub checksum: Option<SyncChecksum>,
    pub last_error: Option<String>,
    pub conflict_reason: Option<String>,
    pub retry_count: u32,
    /// 1 is processed first, 10 last.
    pub priority: u8,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_success_at: Option<OffsetDateTime>,
    pub last_pass_id: Option<Ulid>,
}

impl SyncRecord {
    #[must_use]
    pub fn new(product_id: ProductId, system: SystemId) -> Self {
        Self {
            product_id,
            system,
            status: SyncStatus::NeverSynced,
            checksum: None,
            last_error: None,
            conflict_reason: None,
            retry_count: 0,
            priority: DEFAULT_PRIORITY,
            last_attempt_at: None,
            last_success_at: None,
            last_pass_id: None,
        }
    }

    #[must_use]
    pub fn needs_sync(&self, current: &SyncChecksum) -> bool {
        needs_sync(current, self.checksum.as_ref())
    }

    /// # Errors
    /// Returns [`SyncError::Validation`] unless `priority` is within 1..=10.
    pub fn set_priority(&mut self, priority: u8) -> Result<(), SyncError> {
        if !(1..=LOWEST_PRIORITY).contains(&priority) {
            return Err(SyncError::Validation(format!(
                "priority MUST be between 1 and {LOWEST_PRIORITY} (got {priority})"
            )));
        }
        self.priority = priority;
        Ok(())
    }

    /// A push is required. Idempotent while already pending.
    ///
    /// # Errors
    /// Returns [`SyncError::Transition`] from `conflict` or `disabled`.
    pub fn mark_pending(&mut self) -> Result<(), SyncError> {
        match self.status {
            SyncStatus::NeverSynced | SyncStatus::Synced | SyncStatus::Error => {
                self.transition(SyncStatus::Pending);
                Ok(())
            }
            SyncStatus::Pending => Ok(()),
            SyncStatus::Conflict | SyncStatus::Disabled => Err(self.invalid(SyncStatus::Pending)),
        }
    }

    /// Persist the pushed checksum after the downstream system confirmed delivery.
    ///
    /// # Errors
    /// Returns [`SyncError::NotPending`] unless the record is `pending`.
    pub fn confirm_success(
        &mut self,
        checksum: SyncChecksum,
        now: OffsetDateTime,
    ) -> Result<(), SyncError> {
        if self.status != SyncStatus::Pending {
            return Err(SyncError::NotPending { action: "confirm", status: self.status });
        }
        self.checksum = Some(checksum);
        self.retry_count = 0;
        self.last_error = None;
        self.last_attempt_at = Some(now);
        self.last_success_at = Some(now);
        self.transition(SyncStatus::Synced);
        Ok(())
    }

    /// Record a failed push. The stored checksum is left untouched.
    ///
    /// # Errors
    /// Returns [`SyncError::Transition`] unless the record is `pending` or `synced`.
    pub fn record_failure(
        &mut self,
        message: impl Into<String>,
        now: OffsetDateTime,
    ) -> Result<(), SyncError> {
        if !matches!(self.status, SyncStatus::Pending | SyncStatus::Synced) {
            return Err(self.invalid(SyncStatus::Error));
        }
        let message = message.into();
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_attempt_at = Some(now);
        tracing::warn!(
            product_id = self.product_id.0,
            system = self.system.0,
            retry_count = self.retry_count,
            error = %message,
            "push failed; checksum kept for retry"
        );
        self.last_error = Some(message);
        self.transition(SyncStatus::Error);
        Ok(())
    }

    /// Structural mapping problem; only an operator can clear it.
    pub fn mark_conflict(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(
            product_id = self.product_id.0,
            system = self.system.0,
            reason = %reason,
            "mapping conflict"
        );
        self.conflict_reason = Some(reason);
        self.transition(SyncStatus::Conflict);
    }

    /// # Errors
    /// Returns [`SyncError::Transition`] unless the record is in `conflict`.
    pub fn resolve_conflict(&mut self) -> Result<(), SyncError> {
        if self.status != SyncStatus::Conflict {
            return Err(self.invalid(SyncStatus::Pending));
        }
        self.conflict_reason = None;
        self.transition(SyncStatus::Pending);
        Ok(())
    }

    pub fn disable(&mut self) {
        self.transition(SyncStatus::Disabled);
    }

    /// Re-enable syncing: `pending` when a checksum exists, else `never-synced`.
    ///
    /// # Errors
    /// Returns [`SyncError::Transition`] unless the record is `disabled`.
    pub fn enable(&mut self) -> Result<(), SyncError> {
        let target =
            if self.checksum.is_some() { SyncStatus::Pending } else { SyncStatus::NeverSynced };
        if self.status != SyncStatus::Disabled {
            return Err(self.invalid(target));
        }
        self.transition(target);
        Ok(())
    }

    fn transition(&mut self, to: SyncStatus) {
        if self.status != to {
            tracing::info!(
                product_id = self.product_id.0,
                system = self.system.0,
                from = self.status.as_str(),
                to = to.as_str(),
                "sync status changed"
            );
        }
        self.status = to;
    }

    fn invalid(&self, to: SyncStatus) -> SyncError {
        SyncError::Transition { from: self.status, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(fill: char) -> SyncChecksum {
        match SyncChecksum::parse(&fill.to_string().repeat(64)) {
            Ok(checksum) => checksum,
            Err(err) => panic!("fixture digest should parse: {err}"),
        }
    }

    fn now() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::days(20_000)
    }

    fn record() -> SyncRecord {
        SyncRecord::new(ProductId(1), SystemId(1))
    }

    #[test]
    fn happy_path_persists_checksum_only_on_success() -> Result<(), SyncError> {
        let mut record = record();
        assert!(record.needs_sync(&digest('a')));

        record.mark_pending()?;
        assert_eq!(record.status, SyncStatus::Pending);
        record.confirm_success(digest('a'), now())?;
        assert_eq!(record.status, SyncStatus::Synced);
        assert!(!record.needs_sync(&digest('a')));
        assert!(record.needs_sync(&digest('b')));
        Ok(())
    }

    #[test]
    fn failure_keeps_old_checksum_and_counts_retries() -> Result<(), SyncError> {
        let mut record = record();
        record.mark_pending()?;
        record.confirm_success(digest('a'), now())?;

        record.mark_pending()?;
        record.record_failure("HTTP 500", now())?;
        assert_eq!(record.status, SyncStatus::Error);
        assert_eq!(record.checksum, Some(digest('a')));
        assert_eq!(record.retry_count, 1);
        assert!(record.needs_sync(&digest('b')));

        record.mark_pending()?;
        record.confirm_success(digest('b'), now())?;
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.last_error, None);
        Ok(())
    }

    #[test]
    fn conflict_requires_operator_resolution() -> Result<(), SyncError> {
        let mut record = record();
        record.mark_conflict("mapping 103 -> 20 belongs to category 104");
        assert!(matches!(
            record.mark_pending(),
            Err(SyncError::Transition { from: SyncStatus::Conflict, to: SyncStatus::Pending })
        ));

        record.resolve_conflict()?;
        assert_eq!(record.status, SyncStatus::Pending);
        assert_eq!(record.conflict_reason, None);
        assert!(record.resolve_conflict().is_err());
        Ok(())
    }

    #[test]
    fn disable_and_enable_round_trip() -> Result<(), SyncError> {
        let mut record = record();
        record.disable();
        assert!(record.mark_pending().is_err());
        record.enable()?;
        assert_eq!(record.status, SyncStatus::NeverSynced);

        record.mark_pending()?;
        record.confirm_success(digest('c'), now())?;
        record.disable();
        record.enable()?;
        assert_eq!(record.status, SyncStatus::Pending);
        assert!(record.enable().is_err());
        Ok(())
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        let mut record = record();
        assert_eq!(
            record.confirm_success(digest('a'), now()),
            Err(SyncError::NotPending { action: "confirm", status: SyncStatus::NeverSynced })
        );
        assert!(record.record_failure("boom", now()).is_err());
        assert!(record.set_priority(0).is_err());
        assert!(record.set_priority(11).is_err());
        assert_eq!(record.set_priority(1), Ok(()));
    }

    #[test]
    fn status_strings_round_trip() -> Result<(), serde_json::Error> {
        for status in [
            SyncStatus::NeverSynced,
            SyncStatus::Pending,
            SyncStatus::Synced,
            SyncStatus::Error,
            SyncStatus::Conflict,
            SyncStatus::Disabled,
        ] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
            assert_eq!(serde_json::to_value(status)?, serde_json::json!(status.as_str()));
        }
        Ok(())
    }
}
