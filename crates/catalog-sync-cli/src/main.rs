use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use catalog_sync_core::converter::unresolved_ids;
use catalog_sync_core::{
    parse_mapping_str, Category, CategoryId, DirectoryEntry, ExternalId, Product, ProductId,
    SyncChecksum, SyncConfig, SyncRecord, SystemId, SystemListing,
};
use catalog_sync_store_sqlite::SqliteStore;
use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "catsync")]
#[command(about = "Catalog category mapping and sync-checksum reconciliation")]
struct Cli {
    #[arg(long, default_value = "./catalog_sync.sqlite3")]
    db: PathBuf,

    /// YAML sync configuration; defaults apply when the file does not exist.
    #[arg(long, default_value = "./catsync.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Directory {
        #[command(subcommand)]
        command: Box<DirectoryCommand>,
    },
    Category {
        #[command(subcommand)]
        command: Box<CategoryCommand>,
    },
    Product {
        #[command(subcommand)]
        command: Box<ProductCommand>,
    },
    Listing {
        #[command(subcommand)]
        command: Box<ListingCommand>,
    },
    Mapping {
        #[command(subcommand)]
        command: Box<MappingCommand>,
    },
    Sync {
        #[command(subcommand)]
        command: Box<SyncCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum DirectoryCommand {
    /// Import a JSON array of `{system, category_id, external_id}` entries.
    Import(InputFileArgs),
    Set(DirectorySetArgs),
    Show(DirectoryShowArgs),
}

#[derive(Debug, Args)]
struct InputFileArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct DirectorySetArgs {
    #[arg(long)]
    system: u64,
    #[arg(long)]
    category: u64,
    #[arg(long)]
    external: i64,
}

#[derive(Debug, Args)]
struct DirectoryShowArgs {
    #[arg(long)]
    system: Option<u64>,
}

#[derive(Debug, Subcommand)]
enum CategoryCommand {
    Put(CategoryPutArgs),
    /// Import a JSON array of categories.
    Import(InputFileArgs),
    List,
}

#[derive(Debug, Args)]
struct CategoryPutArgs {
    #[arg(long)]
    id: u64,
    #[arg(long)]
    name: String,
    #[arg(long)]
    parent: Option<u64>,
    #[arg(long, default_value_t = 0)]
    depth: u32,
}

#[derive(Debug, Subcommand)]
enum ProductCommand {
    /// Store a product document read from a JSON file.
    Put(InputFileArgs),
    Show(ProductArgs),
}

#[derive(Debug, Args)]
struct ProductArgs {
    #[arg(long)]
    product: u64,
}

#[derive(Debug, Subcommand)]
enum ListingCommand {
    Put(ListingPutArgs),
    Show(PairArgs),
    List(SystemArgs),
    Delete(PairArgs),
}

#[derive(Debug, Args)]
struct PairArgs {
    #[arg(long)]
    product: u64,
    #[arg(long)]
    system: u64,
}

#[derive(Debug, Args)]
struct SystemArgs {
    #[arg(long)]
    system: u64,
}

#[derive(Debug, Args)]
struct ListingPutArgs {
    #[command(flatten)]
    pair: PairArgs,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    short_description: Option<String>,
    #[arg(long)]
    long_description: Option<String>,
    #[arg(long)]
    tax_rate_bp: Option<u32>,
    #[arg(long = "warehouse")]
    warehouses: Vec<String>,
    /// Raw persisted mapping value stored when the listing is first created.
    #[arg(long)]
    mapping_json: Option<String>,
}

#[derive(Debug, Subcommand)]
enum MappingCommand {
    Assign(MappingAssignArgs),
    Pull(MappingPullArgs),
    Refresh(PairArgs),
    Show(PairArgs),
}

#[derive(Debug, Args)]
struct MappingAssignArgs {
    #[command(flatten)]
    pair: PairArgs,
    #[arg(long = "category")]
    categories: Vec<u64>,
    #[arg(long)]
    primary: Option<u64>,
}

#[derive(Debug, Args)]
struct MappingPullArgs {
    #[command(flatten)]
    pair: PairArgs,
    #[arg(long = "external")]
    externals: Vec<i64>,
}

#[derive(Debug, Subcommand)]
enum SyncCommand {
    Plan(PairArgs),
    Sweep(SystemArgs),
    Confirm(SyncConfirmArgs),
    Fail(SyncFailArgs),
    Checksum(PairArgs),
    Status(PairArgs),
    List(SystemArgs),
    Disable(PairArgs),
    Enable(PairArgs),
    ResolveConflict(PairArgs),
    Priority(SyncPriorityArgs),
}

#[derive(Debug, Args)]
struct SyncConfirmArgs {
    #[command(flatten)]
    pair: PairArgs,
    #[arg(long)]
    checksum: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct SyncFailArgs {
    #[command(flatten)]
    pair: PairArgs,
    #[arg(long)]
    message: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
struct SyncPriorityArgs {
    #[command(flatten)]
    pair: PairArgs,
    #[arg(long)]
    value: u8,
}

impl PairArgs {
    fn ids(&self) -> (ProductId, SystemId) {
        (ProductId(self.product), SystemId(self.system))
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Directory { command } => run_directory(*command, &mut store),
        Command::Category { command } => run_category(*command, &mut store),
        Command::Product { command } => run_product(*command, &mut store),
        Command::Listing { command } => run_listing(*command, &mut store),
        Command::Mapping { command } => {
            let config = load_config(&cli.config)?;
            run_mapping(*command, &mut store, &config)
        }
        Command::Sync { command } => {
            let config = load_config(&cli.config)?;
            run_sync(*command, &mut store, &config)
        }
    }
}

fn load_config(path: &Path) -> Result<SyncConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found; using defaults");
        return Ok(SyncConfig::default());
    }
    SyncConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_directory(command: DirectoryCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        DirectoryCommand::Import(args) => {
            let entries: Vec<DirectoryEntry> = read_json_input(&args.input)?;
            let imported = store.import_directory(&entries, OffsetDateTime::now_utc())?;
            emit_json(serde_json::json!({
                "imported": imported,
                "directory_size": store.load_directory()?.len()
            }))
        }
        DirectoryCommand::Set(args) => {
            let entry = DirectoryEntry {
                system: SystemId(args.system),
                category_id: CategoryId(args.category),
                external_id: parse_external_id(args.external)?,
            };
            store.import_directory(&[entry], OffsetDateTime::now_utc())?;
            emit_json(serde_json::json!({ "entry": entry }))
        }
        DirectoryCommand::Show(args) => {
            let directory = store.load_directory()?;
            let entries = directory
                .entries()
                .filter(|entry| match args.system {
                    Some(system) => entry.system == SystemId(system),
                    None => true,
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({ "entries": entries }))
        }
    }
}

fn run_category(command: CategoryCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        CategoryCommand::Put(args) => {
            let category = Category {
                id: CategoryId(args.id),
                name: args.name,
                parent: args.parent.map(CategoryId),
                depth: args.depth,
            };
            store.upsert_category(&category)?;
            emit_json(serde_json::to_value(&category).context("failed to serialize category")?)
        }
        CategoryCommand::Import(args) => {
            let categories: Vec<Category> = read_json_input(&args.input)?;
            for category in &categories {
                store.upsert_category(category)?;
            }
            emit_json(serde_json::json!({
                "imported": categories.len(),
                "tree_size": store.load_category_tree()?.len()
            }))
        }
        CategoryCommand::List => {
            let tree = store.load_category_tree()?;
            let categories = tree.categories().collect::<Vec<_>>();
            emit_json(serde_json::json!({ "categories": categories }))
        }
    }
}

fn run_product(command: ProductCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        ProductCommand::Put(args) => {
            let product: Product = read_json_input(&args.input)?;
            store.upsert_product(&product, OffsetDateTime::now_utc())?;
            emit_json(serde_json::to_value(&product).context("failed to serialize product")?)
        }
        ProductCommand::Show(args) => {
            let product = store
                .get_product(ProductId(args.product))?
                .ok_or_else(|| anyhow!("product {} does not exist", args.product))?;
            emit_json(serde_json::to_value(&product).context("failed to serialize product")?)
        }
    }
}

fn run_listing(command: ListingCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        ListingCommand::Put(args) => {
            let (product_id, system) = args.pair.ids();
            if store.get_product(product_id)?.is_none() {
                return Err(anyhow!("product {product_id} does not exist"));
            }
            let mut listing = SystemListing::new(product_id, system);
            listing.name = args.name;
            listing.short_description = args.short_description;
            listing.long_description = args.long_description;
            listing.tax_rate_bp = args.tax_rate_bp;
            listing.warehouses = (!args.warehouses.is_empty()).then_some(args.warehouses);
            if let Some(raw) = args.mapping_json.as_deref() {
                listing.mapping =
                    parse_mapping_str(raw).context("failed to parse --mapping-json")?;
            }
            store.upsert_listing(&listing, OffsetDateTime::now_utc())?;
            let stored = require_listing(store, product_id, system)?;
            emit_json(listing_json(&stored)?)
        }
        ListingCommand::Show(args) => {
            let (product_id, system) = args.ids();
            let listing = require_listing(store, product_id, system)?;
            emit_json(listing_json(&listing)?)
        }
        ListingCommand::List(args) => {
            let listings = store
                .list_listings(SystemId(args.system))?
                .iter()
                .map(listing_json)
                .collect::<Result<Vec<_>>>()?;
            emit_json(serde_json::json!({ "listings": listings }))
        }
        ListingCommand::Delete(args) => {
            let (product_id, system) = args.ids();
            let deleted = store.delete_listing(product_id, system)?;
            emit_json(serde_json::json!({
                "product_id": product_id,
                "system": system,
                "deleted": deleted
            }))
        }
    }
}

fn run_mapping(command: MappingCommand, store: &mut SqliteStore, config: &SyncConfig) -> Result<()> {
    store.migrate()?;
    let now = OffsetDateTime::now_utc();
    let update = match command {
        MappingCommand::Assign(args) => {
            let (product_id, system) = args.pair.ids();
            let selection = args.categories.into_iter().map(CategoryId).collect::<Vec<_>>();
            store.assign_mapping(
                product_id,
                system,
                &selection,
                args.primary.map(CategoryId),
                config,
                now,
            )?
        }
        MappingCommand::Pull(args) => {
            let (product_id, system) = args.pair.ids();
            let external_ids = args
                .externals
                .into_iter()
                .map(parse_external_id)
                .collect::<Result<Vec<_>>>()?;
            store.pull_mapping(product_id, system, &external_ids, config, now)?
        }
        MappingCommand::Refresh(args) => {
            let (product_id, system) = args.ids();
            store.refresh_mapping(product_id, system, config, now)?
        }
        MappingCommand::Show(args) => {
            let (product_id, system) = args.ids();
            let listing = require_listing(store, product_id, system)?;
            let kind = listing.mapping.kind();
            let mapping = listing.mapping.to_persisted();
            let unresolved = listing
                .mapping
                .into_record()
                .map(|record| unresolved_ids(&record))
                .unwrap_or_default();
            return emit_json(serde_json::json!({
                "product_id": product_id,
                "system": system,
                "kind": kind,
                "mapping": mapping,
                "unresolved": unresolved
            }));
        }
    };
    emit_json(serde_json::to_value(&update).context("failed to serialize mapping update")?)
}

fn run_sync(command: SyncCommand, store: &mut SqliteStore, config: &SyncConfig) -> Result<()> {
    store.migrate()?;
    match command {
        SyncCommand::Plan(args) => {
            let (product_id, system) = args.ids();
            let report = store.reconcile_one(product_id, system, config, Ulid::new())?;
            emit_json(serde_json::to_value(&report).context("failed to serialize reconcile report")?)
        }
        SyncCommand::Sweep(args) => {
            let summary = store.sweep_system(SystemId(args.system), config)?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize sweep summary")?)
        }
        SyncCommand::Confirm(args) => {
            let (product_id, system) = args.pair.ids();
            let checksum = SyncChecksum::parse(&args.checksum)?;
            let at = parse_optional_rfc3339(args.at.as_deref())?;
            emit_record(&store.confirm_push(product_id, system, &checksum, at)?)
        }
        SyncCommand::Fail(args) => {
            let (product_id, system) = args.pair.ids();
            let at = parse_optional_rfc3339(args.at.as_deref())?;
            emit_record(&store.fail_push(product_id, system, &args.message, at)?)
        }
        SyncCommand::Checksum(args) => {
            let (product_id, system) = args.ids();
            let (plan, checksum) = store.checksum(product_id, system, config)?;
            let stored = store
                .get_sync_record(product_id, system)?
                .unwrap_or_else(|| SyncRecord::new(product_id, system));
            emit_json(serde_json::json!({
                "product_id": product_id,
                "system": system,
                "checksum": checksum,
                "stored_checksum": stored.checksum,
                "needs_sync": stored.needs_sync(&checksum),
                "associations": plan
            }))
        }
        SyncCommand::Status(args) => {
            let (product_id, system) = args.ids();
            require_listing(store, product_id, system)?;
            let record = store
                .get_sync_record(product_id, system)?
                .unwrap_or_else(|| SyncRecord::new(product_id, system));
            emit_record(&record)
        }
        SyncCommand::List(args) => {
            let records = store.list_sync_records(SystemId(args.system))?;
            emit_json(serde_json::json!({ "records": records }))
        }
        SyncCommand::Disable(args) => {
            let (product_id, system) = args.ids();
            emit_record(&store.disable_sync(product_id, system)?)
        }
        SyncCommand::Enable(args) => {
            let (product_id, system) = args.ids();
            emit_record(&store.enable_sync(product_id, system)?)
        }
        SyncCommand::ResolveConflict(args) => {
            let (product_id, system) = args.ids();
            emit_record(&store.resolve_conflict(product_id, system)?)
        }
        SyncCommand::Priority(args) => {
            let (product_id, system) = args.pair.ids();
            emit_record(&store.set_priority(product_id, system, args.value)?)
        }
    }
}

fn emit_record(record: &SyncRecord) -> Result<()> {
    emit_json(serde_json::json!({
        "record": serde_json::to_value(record).context("failed to serialize sync record")?
    }))
}

fn require_listing(
    store: &SqliteStore,
    product_id: ProductId,
    system: SystemId,
) -> Result<SystemListing> {
    store
        .get_listing(product_id, system)?
        .ok_or_else(|| anyhow!("listing ({product_id}, {system}) does not exist"))
}

fn listing_json(listing: &SystemListing) -> Result<Value> {
    let mut value = serde_json::to_value(listing).context("failed to serialize listing")?;
    if let Value::Object(object) = &mut value {
        object.insert("mapping_kind".to_string(), Value::from(listing.mapping.kind()));
        object.insert(
            "mapping".to_string(),
            listing.mapping.to_persisted().unwrap_or(Value::Null),
        );
    }
    Ok(value)
}

fn read_json_input<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read input file {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse input file {}", path.display()))
}

fn parse_external_id(raw: i64) -> Result<ExternalId> {
    ExternalId::from_raw(raw).ok_or_else(|| anyhow!("external id MUST be positive (received: {raw})"))
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<OffsetDateTime> {
    match value {
        Some(raw) => parse_rfc3339(raw),
        None => Ok(OffsetDateTime::now_utc()),
    }
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
