use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use catalog_sync_core::{
    AssociationPlan, Category, CategoryId, CategoryTree, DirectoryEntry, DirectorySnapshot,
    ExternalId, MappingValue, Product, ProductId, ReconcileOutcome, Reconciler, SweepItem,
    SyncChecksum, SyncConfig, SyncError, SyncRecord, SyncStatus, SystemId, SystemListing,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS categories (
  category_id INTEGER PRIMARY KEY CHECK (category_id > 0),
  name TEXT NOT NULL,
  parent_id INTEGER CHECK (parent_id IS NULL OR parent_id <> category_id),
  depth INTEGER NOT NULL DEFAULT 0 CHECK (depth >= 0)
);

CREATE TABLE IF NOT EXISTS category_directory (
  system_id INTEGER NOT NULL,
  category_id INTEGER NOT NULL CHECK (category_id > 0),
  external_id INTEGER NOT NULL CHECK (external_id > 0),
  updated_at TEXT NOT NULL,
  PRIMARY KEY (system_id, category_id),
  UNIQUE (system_id, external_id)
);

CREATE TABLE IF NOT EXISTS products (
  product_id INTEGER PRIMARY KEY,
  sku TEXT NOT NULL UNIQUE,
  product_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS system_listings (
  product_id INTEGER NOT NULL,
  system_id INTEGER NOT NULL,
  listing_json TEXT NOT NULL,
  category_mappings TEXT,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (product_id, system_id),
  FOREIGN KEY (product_id) REFERENCES products(product_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS sync_records (
  product_id INTEGER NOT NULL,
  system_id INTEGER NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('never-synced','pending','synced','error','conflict','disabled')),
  checksum TEXT CHECK (checksum IS NULL OR length(checksum) = 64),
  last_error TEXT,
  conflict_reason TEXT,
  last_attempt_at TEXT,
  last_success_at TEXT,
  last_pass_id TEXT,
  PRIMARY KEY (product_id, system_id),
  FOREIGN KEY (product_id, system_id) REFERENCES system_listings(product_id, system_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_system_listings_system ON system_listings(system_id);
CREATE INDEX IF NOT EXISTS idx_sync_records_status ON sync_records(system_id, status);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE sync_records ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0);
ALTER TABLE sync_records ADD COLUMN priority INTEGER NOT NULL DEFAULT 5 CHECK (priority BETWEEN 1 AND 10);
CREATE INDEX IF NOT EXISTS idx_sync_records_priority ON sync_records(system_id, priority);
";

const SYNC_RECORD_COLUMNS: &str = "product_id, system_id, status, checksum, last_error, conflict_reason,
     retry_count, priority, last_attempt_at, last_success_at, last_pass_id";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub unparseable_mappings: Vec<String>,
    pub schema_status: SchemaStatus,
}

/// Result of a mapping write for one (product, system) pair.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MappingUpdate {
    pub product_id: ProductId,
    pub system: SystemId,
    /// Persisted form of the stored mapping record.
    pub mapping: Value,
    pub unresolved: Vec<CategoryId>,
    pub unmatched: Vec<ExternalId>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    pub record: SyncRecord,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SweepOutcome {
    pub product_id: ProductId,
    pub system: SystemId,
    pub status: SyncStatus,
    pub outcome: Option<ReconcileOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SweepSummary {
    pub pass_id: Ulid,
    pub system: SystemId,
    pub pushes: usize,
    pub outcomes: Vec<SweepOutcome>,
}

impl SqliteStore {
    /// Open a SQLite-backed catalog sync store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "sync_records")? {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "sync_records", "retry_count")? {
            // Tables already carry the v2 columns but migration rows are missing.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        record_schema_version(&self.conn, 1)?;
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "sync_records", "retry_count")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to add retry and priority columns")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        tracing::info!(version = 2, "applied schema migration");
        Ok(())
    }

    /// Replace or add directory entries in one transaction.
    ///
    /// # Errors
    /// Returns an error when an entry conflicts with the existing directory or a write fails.
    pub fn import_directory(&mut self, entries: &[DirectoryEntry], now: OffsetDateTime) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start directory import transaction")?;
        let updated_at = rfc3339(now)?;

        for entry in entries {
            tx.execute(
                "DELETE FROM category_directory
                 WHERE system_id = ?1 AND external_id = ?2 AND category_id <> ?3",
                params![sql_id(entry.system.0)?, sql_id(entry.external_id.get())?, sql_id(entry.category_id.0)?],
            )
            .context("failed to release reassigned external id")?;
            tx.execute(
                "INSERT INTO category_directory(system_id, category_id, external_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(system_id, category_id)
                 DO UPDATE SET external_id = excluded.external_id, updated_at = excluded.updated_at",
                params![
                    sql_id(entry.system.0)?,
                    sql_id(entry.category_id.0)?,
                    sql_id(entry.external_id.get())?,
                    updated_at,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to store directory entry {} -> {} for system {}",
                    entry.category_id, entry.external_id, entry.system
                )
            })?;
        }

        load_directory(&tx)?;
        tx.commit().context("failed to commit directory import")?;
        tracing::info!(entries = entries.len(), "imported category directory entries");
        Ok(entries.len())
    }

    /// Load the full directory as an immutable snapshot.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or form an ambiguous directory.
    pub fn load_directory(&self) -> Result<DirectorySnapshot> {
        load_directory(&self.conn)
    }

    /// # Errors
    /// Returns an error when the category row cannot be written.
    pub fn upsert_category(&mut self, category: &Category) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO categories(category_id, name, parent_id, depth) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(category_id)
                 DO UPDATE SET name = excluded.name, parent_id = excluded.parent_id, depth = excluded.depth",
                params![
                    sql_id(category.id.0)?,
                    category.name,
                    category.parent.map(|parent| sql_id(parent.0)).transpose()?,
                    i64::from(category.depth),
                ],
            )
            .with_context(|| format!("failed to store category {}", category.id))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when category rows cannot be read.
    pub fn load_category_tree(&self) -> Result<CategoryTree> {
        load_category_tree(&self.conn)
    }

    /// # Errors
    /// Returns an error when the product cannot be serialized or written.
    pub fn upsert_product(&mut self, product: &Product, now: OffsetDateTime) -> Result<()> {
        if product.sku.trim().is_empty() {
            return Err(anyhow!("product {} sku MUST be non-empty", product.id));
        }
        let product_json =
            serde_json::to_string(product).context("failed to serialize product")?;
        self.conn
            .execute(
                "INSERT INTO products(product_id, sku, product_json, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(product_id)
                 DO UPDATE SET sku = excluded.sku, product_json = excluded.product_json, updated_at = excluded.updated_at",
                params![sql_id(product.id.0)?, product.sku, product_json, rfc3339(now)?],
            )
            .with_context(|| format!("failed to store product {}", product.id))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_product(&self, product_id: ProductId) -> Result<Option<Product>> {
        load_product(&self.conn, product_id)
    }

    /// Store a listing document. An existing mapping record is left untouched; a new
    /// listing stores the mapping it carries.
    ///
    /// # Errors
    /// Returns an error when the product does not exist or the write fails.
    pub fn upsert_listing(&mut self, listing: &SystemListing, now: OffsetDateTime) -> Result<()> {
        let listing_json =
            serde_json::to_string(listing).context("failed to serialize listing")?;
        let mapping = persisted_mapping(&listing.mapping)?;
        self.conn
            .execute(
                "INSERT INTO system_listings(product_id, system_id, listing_json, category_mappings, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(product_id, system_id)
                 DO UPDATE SET listing_json = excluded.listing_json, updated_at = excluded.updated_at",
                params![
                    sql_id(listing.product_id.0)?,
                    sql_id(listing.system.0)?,
                    listing_json,
                    mapping,
                    rfc3339(now)?,
                ],
            )
            .with_context(|| {
                format!("failed to store listing ({}, {})", listing.product_id, listing.system)
            })?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the row cannot be read or its mapping column cannot be parsed.
    pub fn get_listing(
        &self,
        product_id: ProductId,
        system: SystemId,
    ) -> Result<Option<SystemListing>> {
        load_listing(&self.conn, product_id, system)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or a mapping column cannot be parsed.
    pub fn list_listings(&self, system: SystemId) -> Result<Vec<SystemListing>> {
        let mut stmt = self.conn.prepare(
            "SELECT product_id FROM system_listings WHERE system_id = ?1 ORDER BY product_id ASC",
        )?;
        let product_ids = stmt
            .query_map(params![sql_id(system.0)?], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut listings = Vec::with_capacity(product_ids.len());
        for raw in product_ids {
            let product_id = ProductId(id_from_sql(raw)?);
            if let Some(listing) = load_listing(&self.conn, product_id, system)? {
                listings.push(listing);
            }
        }
        Ok(listings)
    }

    /// Remove a product's relationship to a system together with its mapping
    /// record and sync record.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_listing(&mut self, product_id: ProductId, system: SystemId) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM system_listings WHERE product_id = ?1 AND system_id = ?2",
                params![sql_id(product_id.0)?, sql_id(system.0)?],
            )
            .with_context(|| format!("failed to delete listing ({product_id}, {system})"))?;
        Ok(deleted > 0)
    }

    /// Store a manual category selection as the listing's mapping record.
    ///
    /// # Errors
    /// Returns an error when the listing does not exist or the selection is invalid.
    pub fn assign_mapping(
        &mut self,
        product_id: ProductId,
        system: SystemId,
        selection: &[CategoryId],
        primary: Option<CategoryId>,
        config: &SyncConfig,
        now: OffsetDateTime,
    ) -> Result<MappingUpdate> {
        self.update_mapping(product_id, system, config, |reconciler, listing| {
            let unresolved = reconciler.assign(listing, selection, primary, now)?;
            Ok((unresolved, Vec::new()))
        })
    }

    /// Store categories reported by the downstream system as the listing's mapping record.
    ///
    /// # Errors
    /// Returns an error when the listing does not exist or a write fails.
    pub fn pull_mapping(
        &mut self,
        product_id: ProductId,
        system: SystemId,
        external_ids: &[ExternalId],
        config: &SyncConfig,
        now: OffsetDateTime,
    ) -> Result<MappingUpdate> {
        self.update_mapping(product_id, system, config, |reconciler, listing| {
            let unmatched = reconciler.pull(listing, external_ids, now);
            Ok((Vec::new(), unmatched))
        })
    }

    /// Re-resolve the listing's selection against the current directory.
    ///
    /// # Errors
    /// Returns an error when the listing does not exist or a write fails.
    pub fn refresh_mapping(
        &mut self,
        product_id: ProductId,
        system: SystemId,
        config: &SyncConfig,
        now: OffsetDateTime,
    ) -> Result<MappingUpdate> {
        self.update_mapping(product_id, system, config, |reconciler, listing| {
            Ok((reconciler.refresh(listing, now), Vec::new()))
        })
    }

    fn update_mapping(
        &mut self,
        product_id: ProductId,
        system: SystemId,
        config: &SyncConfig,
        apply: impl FnOnce(
            &Reconciler<DirectorySnapshot>,
            &mut SystemListing,
        ) -> Result<(Vec<CategoryId>, Vec<ExternalId>), SyncError>,
    ) -> Result<MappingUpdate> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start mapping transaction")?;

        let mut listing = load_listing(&tx, product_id, system)?
            .ok_or_else(|| anyhow!("listing ({product_id}, {system}) does not exist"))?;
        let reconciler = Reconciler::new(load_directory(&tx)?, config.clone())?;
        let (unresolved, unmatched) = apply(&reconciler, &mut listing)?;

        tx.execute(
            "UPDATE system_listings SET category_mappings = ?3, updated_at = ?4
             WHERE product_id = ?1 AND system_id = ?2",
            params![
                sql_id(product_id.0)?,
                sql_id(system.0)?,
                persisted_mapping(&listing.mapping)?,
                now_rfc3339()?,
            ],
        )
        .context("failed to store mapping record")?;
        tx.commit().context("failed to commit mapping transaction")?;

        Ok(MappingUpdate {
            product_id,
            system,
            mapping: listing.mapping.to_persisted().unwrap_or(Value::Null),
            unresolved,
            unmatched,
        })
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_sync_record(
        &self,
        product_id: ProductId,
        system: SystemId,
    ) -> Result<Option<SyncRecord>> {
        load_sync_record(&self.conn, product_id, system)
    }

    /// Current associations and checksum for a pair, without touching its sync record.
    ///
    /// # Errors
    /// Returns an error when the pair does not exist or the checksum cannot be computed.
    pub fn checksum(
        &self,
        product_id: ProductId,
        system: SystemId,
        config: &SyncConfig,
    ) -> Result<(AssociationPlan, SyncChecksum)> {
        let (product, listing) = load_pair(&self.conn, product_id, system)?;
        let tree = load_category_tree(&self.conn)?;
        let reconciler = Reconciler::new(load_directory(&self.conn)?, config.clone())?;
        Ok(reconciler.checksum(&product, &listing, Some(&tree))?)
    }

    /// Run the read-compare-decide sequence for one pair inside one transaction.
    ///
    /// # Errors
    /// Returns an error when the pair does not exist or a read, transition or write fails.
    pub fn reconcile_one(
        &mut self,
        product_id: ProductId,
        system: SystemId,
        config: &SyncConfig,
        pass_id: Ulid,
    ) -> Result<ReconcileReport> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start reconcile transaction")?;

        let (product, listing) = load_pair(&tx, product_id, system)?;
        let tree = load_category_tree(&tx)?;
        let reconciler = Reconciler::new(load_directory(&tx)?, config.clone())?;
        let mut record = load_sync_record(&tx, product_id, system)?
            .unwrap_or_else(|| SyncRecord::new(product_id, system));

        let outcome = reconciler.plan(&product, &listing, Some(&tree), &mut record, pass_id)?;
        save_sync_record(&tx, &record)?;
        tx.commit().context("failed to commit reconcile transaction")?;

        Ok(ReconcileReport { outcome, record })
    }

    /// Plan every listing of one system in a single transaction, fanning the
    /// planning work out over `config.sweep_workers` threads.
    ///
    /// # Errors
    /// Returns an error when rows cannot be loaded or sync records cannot be written.
    pub fn sweep_system(&mut self, system: SystemId, config: &SyncConfig) -> Result<SweepSummary> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start sweep transaction")?;

        let tree = load_category_tree(&tx)?;
        let reconciler = Reconciler::new(load_directory(&tx)?, config.clone())?;
        let items = load_sweep_items(&tx, system)?;
        let result = reconciler.sweep(items, Some(&tree));

        let mut outcomes = Vec::with_capacity(result.entries.len());
        for entry in &result.entries {
            save_sync_record(&tx, &entry.record)?;
            outcomes.push(SweepOutcome {
                product_id: entry.record.product_id,
                system: entry.record.system,
                status: entry.record.status,
                outcome: entry.outcome.as_ref().ok().cloned(),
                error: entry.outcome.as_ref().err().map(ToString::to_string),
            });
        }
        tx.commit().context("failed to commit sweep transaction")?;

        Ok(SweepSummary {
            pass_id: result.pass_id,
            system,
            pushes: result.pushes().count(),
            outcomes,
        })
    }

    /// Persist the checksum of a push the downstream system confirmed.
    ///
    /// # Errors
    /// Returns an error when the record does not exist or is not `pending`.
    pub fn confirm_push(
        &mut self,
        product_id: ProductId,
        system: SystemId,
        checksum: &SyncChecksum,
        now: OffsetDateTime,
    ) -> Result<SyncRecord> {
        self.update_sync_record(product_id, system, |record| {
            record.confirm_success(checksum.clone(), now)
        })
    }

    /// Record a failed push; the stored checksum is kept so the next pass retries.
    ///
    /// # Errors
    /// Returns an error when the record does not exist or cannot fail from its status.
    pub fn fail_push(
        &mut self,
        product_id: ProductId,
        system: SystemId,
        message: &str,
        now: OffsetDateTime,
    ) -> Result<SyncRecord> {
        self.update_sync_record(product_id, system, |record| record.record_failure(message, now))
    }

    /// # Errors
    /// Returns an error when the listing does not exist or the write fails.
    pub fn disable_sync(&mut self, product_id: ProductId, system: SystemId) -> Result<SyncRecord> {
        self.update_sync_record(product_id, system, |record| {
            record.disable();
            Ok(())
        })
    }

    /// # Errors
    /// Returns an error when the record is not `disabled` or the write fails.
    pub fn enable_sync(&mut self, product_id: ProductId, system: SystemId) -> Result<SyncRecord> {
        self.update_sync_record(product_id, system, SyncRecord::enable)
    }

    /// # Errors
    /// Returns an error when the record is not in `conflict` or the write fails.
    pub fn resolve_conflict(
        &mut self,
        product_id: ProductId,
        system: SystemId,
    ) -> Result<SyncRecord> {
        self.update_sync_record(product_id, system, SyncRecord::resolve_conflict)
    }

    /// # Errors
    /// Returns an error when `priority` is outside 1..=10 or the write fails.
    pub fn set_priority(
        &mut self,
        product_id: ProductId,
        system: SystemId,
        priority: u8,
    ) -> Result<SyncRecord> {
        self.update_sync_record(product_id, system, |record| record.set_priority(priority))
    }

    fn update_sync_record(
        &mut self,
        product_id: ProductId,
        system: SystemId,
        apply: impl FnOnce(&mut SyncRecord) -> Result<(), SyncError>,
    ) -> Result<SyncRecord> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start sync record transaction")?;

        if load_listing(&tx, product_id, system)?.is_none() {
            return Err(anyhow!("listing ({product_id}, {system}) does not exist"));
        }
        let mut record = load_sync_record(&tx, product_id, system)?
            .unwrap_or_else(|| SyncRecord::new(product_id, system));
        apply(&mut record)?;
        save_sync_record(&tx, &record)?;
        tx.commit().context("failed to commit sync record transaction")?;
        Ok(record)
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_sync_records(&self, system: SystemId) -> Result<Vec<SyncRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SYNC_RECORD_COLUMNS} FROM sync_records
             WHERE system_id = ?1
             ORDER BY priority ASC, product_id ASC"
        ))?;
        let mut rows = stmt.query(params![sql_id(system.0)?])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(sync_record_from_row(row)?);
        }
        Ok(records)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Replace the main database with a backup file, then bring it to the latest schema.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails or migration fails.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, mapping parse and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT product_id, system_id, category_mappings FROM system_listings
             WHERE category_mappings IS NOT NULL
             ORDER BY product_id ASC, system_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut unparseable_mappings = Vec::new();
        while let Some(row) = rows.next()? {
            let product_id: i64 = row.get(0)?;
            let system_id: i64 = row.get(1)?;
            let raw: String = row.get(2)?;
            if let Err(err) = catalog_sync_core::parse_mapping_str(&raw) {
                unparseable_mappings.push(format!("({product_id}, {system_id}): {err}"));
            }
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            unparseable_mappings,
            schema_status,
        })
    }
}

fn load_directory(conn: &Connection) -> Result<DirectorySnapshot> {
    let mut stmt = conn.prepare(
        "SELECT system_id, category_id, external_id FROM category_directory
         ORDER BY system_id ASC, category_id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        let external_raw: i64 = row.get(2)?;
        let external_id = ExternalId::from_raw(external_raw)
            .ok_or_else(|| anyhow!("directory external id MUST be positive, got {external_raw}"))?;
        entries.push(DirectoryEntry {
            system: SystemId(id_from_sql(row.get(0)?)?),
            category_id: CategoryId(id_from_sql(row.get(1)?)?),
            external_id,
        });
    }
    DirectorySnapshot::from_entries(entries).context("category directory is inconsistent")
}

fn load_category_tree(conn: &Connection) -> Result<CategoryTree> {
    let mut stmt = conn.prepare(
        "SELECT category_id, name, parent_id, depth FROM categories ORDER BY category_id ASC",
    )?;
    let mut rows = stmt.query([])?;
    let mut categories = Vec::new();
    while let Some(row) = rows.next()? {
        let parent: Option<i64> = row.get(2)?;
        let depth: i64 = row.get(3)?;
        categories.push(Category {
            id: CategoryId(id_from_sql(row.get(0)?)?),
            name: row.get(1)?,
            parent: parent.map(id_from_sql).transpose()?.map(CategoryId),
            depth: u32::try_from(depth).context("category depth out of range")?,
        });
    }
    CategoryTree::from_categories(categories).context("category tree is inconsistent")
}

fn load_product(conn: &Connection, product_id: ProductId) -> Result<Option<Product>> {
    let raw = conn
        .query_row(
            "SELECT product_json FROM products WHERE product_id = ?1",
            params![sql_id(product_id.0)?],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .with_context(|| format!("failed to load product {product_id}"))?;
    raw.map(|raw| {
        serde_json::from_str(&raw).with_context(|| format!("failed to decode product {product_id}"))
    })
    .transpose()
}

fn load_listing(
    conn: &Connection,
    product_id: ProductId,
    system: SystemId,
) -> Result<Option<SystemListing>> {
    let row = conn
        .query_row(
            "SELECT listing_json, category_mappings FROM system_listings
             WHERE product_id = ?1 AND system_id = ?2",
            params![sql_id(product_id.0)?, sql_id(system.0)?],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()
        .with_context(|| format!("failed to load listing ({product_id}, {system})"))?;

    let Some((listing_json, mappings)) = row else {
        return Ok(None);
    };
    let mut listing: SystemListing = serde_json::from_str(&listing_json)
        .with_context(|| format!("failed to decode listing ({product_id}, {system})"))?;
    listing.mapping = match mappings {
        Some(raw) => catalog_sync_core::parse_mapping_str(&raw).with_context(|| {
            format!("failed to parse category mappings of ({product_id}, {system})")
        })?,
        None => MappingValue::Empty,
    };
    Ok(Some(listing))
}

fn load_pair(
    conn: &Connection,
    product_id: ProductId,
    system: SystemId,
) -> Result<(Product, SystemListing)> {
    let product = load_product(conn, product_id)?
        .ok_or_else(|| anyhow!("product {product_id} does not exist"))?;
    let listing = load_listing(conn, product_id, system)?
        .ok_or_else(|| anyhow!("listing ({product_id}, {system}) does not exist"))?;
    Ok((product, listing))
}

fn load_sweep_items(conn: &Connection, system: SystemId) -> Result<Vec<SweepItem>> {
    let mut stmt = conn.prepare(
        "SELECT product_id FROM system_listings WHERE system_id = ?1 ORDER BY product_id ASC",
    )?;
    let product_ids = stmt
        .query_map(params![sql_id(system.0)?], |row| row.get::<_, i64>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut items = Vec::with_capacity(product_ids.len());
    for raw in product_ids {
        let product_id = ProductId(id_from_sql(raw)?);
        let (product, listing) = load_pair(conn, product_id, system)?;
        let record = load_sync_record(conn, product_id, system)?
            .unwrap_or_else(|| SyncRecord::new(product_id, system));
        items.push(SweepItem { product, listing, record });
    }
    Ok(items)
}

fn load_sync_record(
    conn: &Connection,
    product_id: ProductId,
    system: SystemId,
) -> Result<Option<SyncRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SYNC_RECORD_COLUMNS} FROM sync_records WHERE product_id = ?1 AND system_id = ?2"
    ))?;
    let mut rows = stmt.query(params![sql_id(product_id.0)?, sql_id(system.0)?])?;
    rows.next()?.map(sync_record_from_row).transpose()
}

fn sync_record_from_row(row: &rusqlite::Row<'_>) -> Result<SyncRecord> {
    let status_raw: String = row.get(2)?;
    let checksum_raw: Option<String> = row.get(3)?;
    let retry_count: i64 = row.get(6)?;
    let priority: i64 = row.get(7)?;
    let last_attempt_at: Option<String> = row.get(8)?;
    let last_success_at: Option<String> = row.get(9)?;
    let last_pass_id: Option<String> = row.get(10)?;

    Ok(SyncRecord {
        product_id: ProductId(id_from_sql(row.get(0)?)?),
        system: SystemId(id_from_sql(row.get(1)?)?),
        status: SyncStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown sync status: {status_raw}"))?,
        checksum: checksum_raw.as_deref().map(SyncChecksum::parse).transpose()?,
        last_error: row.get(4)?,
        conflict_reason: row.get(5)?,
        retry_count: u32::try_from(retry_count).context("retry_count out of range")?,
        priority: u8::try_from(priority).context("priority out of range")?,
        last_attempt_at: last_attempt_at.as_deref().map(parse_rfc3339).transpose()?,
        last_success_at: last_success_at.as_deref().map(parse_rfc3339).transpose()?,
        last_pass_id: last_pass_id
            .as_deref()
            .map(|raw| Ulid::from_string(raw).with_context(|| format!("invalid pass id: {raw}")))
            .transpose()?,
    })
}

fn save_sync_record(conn: &Connection, record: &SyncRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO sync_records({SYNC_RECORD_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(product_id, system_id) DO UPDATE SET
               status = excluded.status,
               checksum = excluded.checksum,
               last_error = excluded.last_error,
               conflict_reason = excluded.conflict_reason,
               retry_count = excluded.retry_count,
               priority = excluded.priority,
               last_attempt_at = excluded.last_attempt_at,
               last_success_at = excluded.last_success_at,
               last_pass_id = excluded.last_pass_id"
        ),
        params![
            sql_id(record.product_id.0)?,
            sql_id(record.system.0)?,
            record.status.as_str(),
            record.checksum.as_ref().map(SyncChecksum::as_str),
            record.last_error,
            record.conflict_reason,
            i64::from(record.retry_count),
            i64::from(record.priority),
            record.last_attempt_at.map(rfc3339).transpose()?,
            record.last_success_at.map(rfc3339).transpose()?,
            record.last_pass_id.map(|pass_id| pass_id.to_string()),
        ],
    )
    .with_context(|| {
        format!("failed to store sync record ({}, {})", record.product_id, record.system)
    })?;
    Ok(())
}

fn persisted_mapping(mapping: &MappingValue) -> Result<Option<String>> {
    mapping
        .to_persisted()
        .map(|value| serde_json::to_string(&value).context("failed to serialize mapping record"))
        .transpose()
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "sync_records")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "sync_records", "retry_count")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn sql_id(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("id {value} does not fit a sqlite integer"))
}

fn id_from_sql(value: i64) -> Result<u64> {
    u64::try_from(value).with_context(|| format!("stored id {value} MUST be non-negative"))
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
