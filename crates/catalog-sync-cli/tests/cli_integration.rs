use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::{json, Value};

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_catsync<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_catsync"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute catsync binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_catsync(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "catsync command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn run_failure<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_catsync(args);
    assert!(
        !output.status.success(),
        "command should fail but succeeded:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn write_json_file(path: &Path, value: &Value) {
    fs::write(path, value.to_string())
        .unwrap_or_else(|err| panic!("failed to write JSON file {}: {err}", path.display()));
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_dir = repo_root().join("contracts/v1/schemas");
    let schema_json = read_json_file(&schema_dir.join(schema_file));

    let mut options = JSONSchema::options();
    let entries = fs::read_dir(&schema_dir)
        .unwrap_or_else(|err| panic!("failed to list schema dir {}: {err}", schema_dir.display()));
    for entry in entries {
        let path = entry.unwrap_or_else(|err| panic!("failed to read schema entry: {err}")).path();
        let document = read_json_file(&path);
        if let Some(id) = document.get("$id").and_then(Value::as_str) {
            options.with_document(id.to_string(), document.clone());
        }
    }

    let compiled = options
        .compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {schema_file}: {err}"));
    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

struct Sandbox {
    dir: PathBuf,
    db: PathBuf,
    config: PathBuf,
}

impl Sandbox {
    fn new(prefix: &str) -> Self {
        let dir = unique_temp_dir(prefix);
        Self { db: dir.join("catalog.sqlite3"), config: dir.join("catsync.yaml"), dir }
    }

    fn args<'a>(&'a self, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec!["--db", path_str(&self.db), "--config", path_str(&self.config)];
        args.extend_from_slice(rest);
        args
    }

    fn json(&self, rest: &[&str]) -> Value {
        run_json(self.args(rest))
    }

    fn fails(&self, rest: &[&str]) -> String {
        run_failure(self.args(rest))
    }

    fn file(&self, name: &str, value: &Value) -> PathBuf {
        let path = self.dir.join(name);
        write_json_file(&path, value);
        path
    }

    /// Directory for system 1 (100 -> 9, 103 -> 15), a two-level tree and product 1.
    fn seed(&self) {
        let directory = self.file(
            "directory.json",
            &json!([
                {"system": 1, "category_id": 100, "external_id": 9},
                {"system": 1, "category_id": 103, "external_id": 15}
            ]),
        );
        let imported = self.json(&["directory", "import", "--in", path_str(&directory)]);
        assert_eq!(as_i64(&imported, "imported"), 2);

        let categories = self.file(
            "categories.json",
            &json!([
                {"id": 100, "name": "Bikes", "parent": null, "depth": 0},
                {"id": 103, "name": "Road bikes", "parent": 100, "depth": 1}
            ]),
        );
        self.json(&["category", "import", "--in", path_str(&categories)]);

        self.put_product(1, &[100, 103]);
        self.json(&["listing", "put", "--product", "1", "--system", "1"]);
    }

    fn put_product(&self, id: u64, categories: &[u64]) {
        let product = self.file(
            &format!("product-{id}.json"),
            &json!({
                "id": id,
                "sku": format!("SKU-{id}"),
                "name": format!("Product {id}"),
                "weight_grams": 1200,
                "tax_rate_bp": 2300,
                "categories": categories,
                "prices": [{"tier": "retail", "net_minor": 10000, "gross_minor": 12300}],
                "stock": [{"warehouse": "main", "quantity": 4}]
            }),
        );
        self.json(&["product", "put", "--in", path_str(&product)]);
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

#[test]
fn db_commands_cover_migrate_integrity_backup_restore() {
    let sandbox = Sandbox::new("catsync-cli-db");
    let backup_file = sandbox.dir.join("backup.sqlite3");

    let schema_before = sandbox.json(&["db", "schema-version"]);
    validate_schema("db-schema-version.response.schema.json", &schema_before);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);

    let dry_run = sandbox.json(&["db", "migrate", "--dry-run"]);
    validate_schema("db-migrate.response.schema.json", &dry_run);
    assert_eq!(
        dry_run
            .get("would_apply_versions")
            .and_then(Value::as_array)
            .map(std::vec::Vec::len)
            .unwrap_or_default(),
        2
    );

    let migrate = sandbox.json(&["db", "migrate"]);
    validate_schema("db-migrate.response.schema.json", &migrate);
    assert_eq!(as_i64(&migrate, "after_version"), 2);

    sandbox.seed();

    let integrity = sandbox.json(&["db", "integrity-check"]);
    assert!(integrity.get("quick_check_ok").and_then(Value::as_bool).unwrap_or(false));
    assert_eq!(integrity["unparseable_mappings"], json!([]));

    let backup = sandbox.json(&["db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(Path::new(as_str(&backup, "backup_path")).exists());

    sandbox.json(&["listing", "delete", "--product", "1", "--system", "1"]);
    sandbox.fails(&["listing", "show", "--product", "1", "--system", "1"]);

    let restore = sandbox.json(&["db", "restore", "--in", path_str(&backup_file)]);
    assert_eq!(as_i64(&restore, "current_version"), 2);
    let listing = sandbox.json(&["listing", "show", "--product", "1", "--system", "1"]);
    assert_eq!(as_str(&listing, "mapping_kind"), "empty");
}

#[test]
fn reconcile_confirm_and_drift_follow_sync_checksum() {
    let sandbox = Sandbox::new("catsync-cli-reconcile");
    sandbox.seed();

    let checksum = sandbox.json(&["sync", "checksum", "--product", "1", "--system", "1"]);
    validate_schema("sync-checksum.response.schema.json", &checksum);
    assert_eq!(checksum["needs_sync"], json!(true));
    assert_eq!(checksum["associations"]["rule"], json!("catalog_wide"));
    assert_eq!(checksum["associations"]["external_ids"], json!([9, 15]));

    let planned = sandbox.json(&["sync", "plan", "--product", "1", "--system", "1"]);
    validate_schema("reconcile-report.response.schema.json", &planned);
    assert_eq!(planned["outcome"]["outcome"], json!("push"));
    assert_eq!(planned["record"]["status"], json!("pending"));
    let digest = as_str(&planned["outcome"], "checksum").to_string();
    assert_eq!(digest, as_str(&checksum, "checksum"));

    let confirmed = sandbox.json(&[
        "sync",
        "confirm",
        "--product",
        "1",
        "--system",
        "1",
        "--checksum",
        &digest,
        "--at",
        "2026-10-01T08:00:00Z",
    ]);
    validate_schema("sync-record.response.schema.json", &confirmed);
    assert_eq!(confirmed["record"]["status"], json!("synced"));
    assert_eq!(confirmed["record"]["last_success_at"], json!("2026-10-01T08:00:00Z"));

    let settled = sandbox.json(&["sync", "plan", "--product", "1", "--system", "1"]);
    validate_schema("reconcile-report.response.schema.json", &settled);
    assert_eq!(settled["outcome"]["outcome"], json!("up_to_date"));

    sandbox.put_product(1, &[100]);
    let drifted = sandbox.json(&["sync", "plan", "--product", "1", "--system", "1"]);
    assert_eq!(drifted["outcome"]["outcome"], json!("push"));
    assert_ne!(as_str(&drifted["outcome"], "checksum"), digest);

    let failed = sandbox.json(&[
        "sync",
        "fail",
        "--product",
        "1",
        "--system",
        "1",
        "--message",
        "HTTP 503 from shop",
    ]);
    validate_schema("sync-record.response.schema.json", &failed);
    assert_eq!(failed["record"]["status"], json!("error"));
    assert_eq!(failed["record"]["retry_count"], json!(1));
    assert_eq!(failed["record"]["checksum"], json!(digest));

    let retried = sandbox.json(&["sync", "plan", "--product", "1", "--system", "1"]);
    assert_eq!(retried["outcome"]["outcome"], json!("push"));

    sandbox.fails(&["sync", "confirm", "--product", "1", "--system", "1", "--checksum", "abc"]);
    sandbox.fails(&[
        "sync",
        "confirm",
        "--product",
        "1",
        "--system",
        "1",
        "--checksum",
        &digest,
        "--at",
        "2026-10-01T08:00:00+02:00",
    ]);
}

#[test]
fn mapping_commands_assign_refresh_pull_and_show() {
    let sandbox = Sandbox::new("catsync-cli-mapping");
    sandbox.seed();

    let assigned = sandbox.json(&[
        "mapping",
        "assign",
        "--product",
        "1",
        "--system",
        "1",
        "--category",
        "100",
        "--category",
        "200",
        "--category",
        "100",
        "--primary",
        "100",
    ]);
    validate_schema("mapping-update.response.schema.json", &assigned);
    assert_eq!(assigned["unresolved"], json!([200]));
    assert_eq!(assigned["mapping"]["ui"]["selected"], json!([100, 200]));
    assert_eq!(assigned["mapping"]["mappings"], json!({"100": 9}));

    let planned = sandbox.json(&["sync", "plan", "--product", "1", "--system", "1"]);
    assert_eq!(planned["outcome"]["rule"], json!("per_system_mappings"));
    assert_eq!(planned["outcome"]["associations"], json!([{"id": 9}]));

    sandbox.json(&["directory", "set", "--system", "1", "--category", "200", "--external", "40"]);
    let refreshed = sandbox.json(&["mapping", "refresh", "--product", "1", "--system", "1"]);
    validate_schema("mapping-update.response.schema.json", &refreshed);
    assert_eq!(refreshed["unresolved"], json!([]));
    assert_eq!(refreshed["mapping"]["mappings"], json!({"100": 9, "200": 40}));
    assert_eq!(refreshed["mapping"]["metadata"]["source"], json!("refresh"));

    let pulled = sandbox.json(&[
        "mapping", "pull", "--product", "1", "--system", "1", "--external", "2", "--external",
        "15", "--external", "77",
    ]);
    validate_schema("mapping-update.response.schema.json", &pulled);
    assert_eq!(pulled["unmatched"], json!([77]));
    assert_eq!(pulled["mapping"]["ui"], json!({"selected": [103], "primary": 103}));

    let shown = sandbox.json(&["mapping", "show", "--product", "1", "--system", "1"]);
    assert_eq!(as_str(&shown, "kind"), "canonical");
    validate_schema("mapping-record.schema.json", &shown["mapping"]);

    let stderr = sandbox.fails(&[
        "mapping",
        "assign",
        "--product",
        "1",
        "--system",
        "1",
        "--category",
        "100",
        "--primary",
        "103",
    ]);
    assert!(stderr.contains("primary category 103"));
    sandbox.fails(&["mapping", "pull", "--product", "1", "--system", "1", "--external", "0"]);
}

#[test]
fn legacy_mapping_and_conflict_resolution() {
    let sandbox = Sandbox::new("catsync-cli-conflict");
    sandbox.seed();
    sandbox.json(&["directory", "set", "--system", "1", "--category", "104", "--external", "20"]);

    sandbox.put_product(2, &[100]);
    let listing = sandbox.json(&[
        "listing",
        "put",
        "--product",
        "2",
        "--system",
        "1",
        "--mapping-json",
        r#"{"100": 9, "103": 15}"#,
    ]);
    assert_eq!(as_str(&listing, "mapping_kind"), "legacy");
    let legacy = sandbox.json(&["sync", "plan", "--product", "2", "--system", "1"]);
    assert_eq!(legacy["outcome"]["rule"], json!("legacy_mappings"));

    sandbox.put_product(3, &[100]);
    sandbox.json(&[
        "listing",
        "put",
        "--product",
        "3",
        "--system",
        "1",
        "--mapping-json",
        r#"{"ui": {"selected": [100, 103], "primary": 100}, "mappings": {"100": 9, "103": 20}}"#,
    ]);

    let conflicted = sandbox.json(&["sync", "plan", "--product", "3", "--system", "1"]);
    validate_schema("reconcile-report.response.schema.json", &conflicted);
    assert_eq!(conflicted["outcome"]["outcome"], json!("conflict"));
    assert!(as_str(&conflicted["outcome"], "reason").contains("belongs to category 104"));

    let skipped = sandbox.json(&["sync", "plan", "--product", "3", "--system", "1"]);
    assert_eq!(skipped["outcome"], json!({"outcome": "skipped", "status": "conflict"}));

    sandbox.json(&[
        "mapping", "assign", "--product", "3", "--system", "1", "--category", "100",
        "--category", "103",
    ]);
    let resolved = sandbox.json(&["sync", "resolve-conflict", "--product", "3", "--system", "1"]);
    validate_schema("sync-record.response.schema.json", &resolved);
    assert_eq!(resolved["record"]["status"], json!("pending"));
    assert_eq!(resolved["record"]["conflict_reason"], Value::Null);

    let planned = sandbox.json(&["sync", "plan", "--product", "3", "--system", "1"]);
    assert_eq!(planned["outcome"]["associations"], json!([{"id": 9}, {"id": 15}]));
    sandbox.fails(&["sync", "resolve-conflict", "--product", "3", "--system", "1"]);
}

#[test]
fn sweep_honours_priority_disable_and_config() {
    let sandbox = Sandbox::new("catsync-cli-sweep");
    fs::write(&sandbox.config, "default_root_category: 7\nsweep_workers: 2\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    sandbox.seed();

    for id in 2..=4 {
        sandbox.put_product(id, &[]);
        sandbox.json(&["listing", "put", "--product", &id.to_string(), "--system", "1"]);
    }
    let prioritised =
        sandbox.json(&["sync", "priority", "--product", "4", "--system", "1", "--value", "1"]);
    assert_eq!(prioritised["record"]["priority"], json!(1));
    sandbox.fails(&["sync", "priority", "--product", "4", "--system", "1", "--value", "11"]);

    let disabled = sandbox.json(&["sync", "disable", "--product", "3", "--system", "1"]);
    assert_eq!(disabled["record"]["status"], json!("disabled"));

    let summary = sandbox.json(&["sync", "sweep", "--system", "1"]);
    validate_schema("sweep-summary.response.schema.json", &summary);
    assert_eq!(as_i64(&summary, "pushes"), 3);
    let outcomes =
        summary["outcomes"].as_array().unwrap_or_else(|| panic!("outcomes array: {summary}"));
    assert_eq!(outcomes.len(), 4);
    assert_eq!(outcomes[0]["product_id"], json!(4));
    assert_eq!(outcomes[0]["outcome"]["associations"], json!([{"id": 7}]));
    assert_eq!(outcomes[0]["outcome"]["rule"], json!("default_root"));
    assert!(outcomes
        .iter()
        .any(|entry| entry["outcome"] == json!({"outcome": "skipped", "status": "disabled"})));

    let enabled = sandbox.json(&["sync", "enable", "--product", "3", "--system", "1"]);
    assert_eq!(enabled["record"]["status"], json!("never-synced"));

    let status = sandbox.json(&["sync", "status", "--product", "2", "--system", "1"]);
    validate_schema("sync-record.response.schema.json", &status);
    assert_eq!(status["record"]["status"], json!("pending"));
    assert_eq!(
        status["record"]["last_pass_id"].as_str(),
        summary["pass_id"].as_str()
    );

    let listed = sandbox.json(&["sync", "list", "--system", "1"]);
    assert_eq!(listed["records"].as_array().map(Vec::len), Some(4));

    fs::write(&sandbox.config, "max_selected: 0\n")
        .unwrap_or_else(|err| panic!("failed to write config: {err}"));
    sandbox.fails(&["sync", "sweep", "--system", "1"]);
}
