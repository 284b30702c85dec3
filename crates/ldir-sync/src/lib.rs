//! Reconciliation pipeline: table registry, per-record reconciler, paginated runner and run reports.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ldir_core::{Listing, ListingUpdate, TargetField};
use ldir_extract::extract;
use ldir_storage::{
    HttpClientConfig, LinkChecker, LinkProbe, ListingStore, MemoryStore, RecordFilter, SupabaseConfig,
    SupabaseStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ldir-sync";

/// Errors listed in full in the console summary; the rest are counted.
pub const SUMMARY_ERROR_LIMIT: usize = 10;

const USER_AGENT: &str = concat!("ldir-populate/", env!("CARGO_PKG_VERSION"));
const STORE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value {value:?} for {var}")]
    InvalidVar { var: &'static str, value: String },
    #[error("table {table}: unknown field {field:?}")]
    UnknownField { table: String, field: String },
    #[error("table {0} is not in the registry")]
    UnknownTable(String),
}

/// Database credentials. Both are required before any record is touched.
#[derive(Clone)]
pub struct Credentials {
    pub supabase_url: String,
    pub service_role_key: String,
}

impl Credentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |var: &'static str| {
            get(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::MissingVar(var))
        };
        Ok(Self {
            supabase_url: required("SUPABASE_URL")?,
            service_role_key: required("SUPABASE_SERVICE_ROLE_KEY")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub logs_dir: PathBuf,
    pub report_prefix: String,
    pub page_size: usize,
    pub min_confidence: f64,
    pub check_links: bool,
    pub http_timeout_secs: u64,
    pub workspace_root: PathBuf,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("./logs"),
            report_prefix: "populate".to_string(),
            page_size: 1000,
            min_confidence: 0.5,
            check_links: false,
            http_timeout_secs: 10,
            workspace_root: PathBuf::from("."),
        }
    }
}

fn parse_var<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar { var, value }),
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let page_size: usize = parse_var(&get, "LDIR_PAGE_SIZE", defaults.page_size)?;
        if page_size == 0 {
            return Err(ConfigError::InvalidVar {
                var: "LDIR_PAGE_SIZE",
                value: "0".to_string(),
            });
        }
        let min_confidence: f64 = parse_var(&get, "LDIR_MIN_CONFIDENCE", defaults.min_confidence)?;
        if !(0.0..=1.0).contains(&min_confidence) {
            return Err(ConfigError::InvalidVar {
                var: "LDIR_MIN_CONFIDENCE",
                value: min_confidence.to_string(),
            });
        }
        Ok(Self {
            logs_dir: get("LDIR_LOGS_DIR").map(PathBuf::from).unwrap_or(defaults.logs_dir),
            report_prefix: get("LDIR_REPORT_PREFIX").unwrap_or(defaults.report_prefix),
            page_size,
            min_confidence,
            check_links: get("LDIR_CHECK_LINKS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.check_links),
            http_timeout_secs: parse_var(&get, "LDIR_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            workspace_root: get("LDIR_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Rows where any enabled column is null.
    #[default]
    NullFields,
    /// Every row; fine for the smaller tables.
    FullScan,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableRegistry {
    pub tables: Vec<TableConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub table: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub filter_mode: FilterMode,
    pub fields: Vec<String>,
}

impl TableConfig {
    pub fn target_fields(&self) -> Result<Vec<TargetField>, ConfigError> {
        self.fields
            .iter()
            .map(|name| {
                TargetField::from_column(name).ok_or_else(|| ConfigError::UnknownField {
                    table: self.table.clone(),
                    field: name.clone(),
                })
            })
            .collect()
    }

    pub fn record_filter(&self, fields: &[TargetField]) -> RecordFilter {
        match self.filter_mode {
            FilterMode::NullFields => RecordFilter::AnyNull(fields.to_vec()),
            FilterMode::FullScan => RecordFilter::All,
        }
    }
}

impl TableRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: TableRegistry = serde_yaml::from_str(text).context("parsing table registry")?;
        for table in &registry.tables {
            table.target_fields()?;
        }
        Ok(registry)
    }

    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("tables.yaml");
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Every enabled table, or just `only` (enabled or not) when given.
    pub fn select(&self, only: Option<&str>) -> Result<Vec<&TableConfig>, ConfigError> {
        match only {
            Some(name) => self
                .tables
                .iter()
                .find(|t| t.table == name)
                .map(|t| vec![t])
                .ok_or_else(|| ConfigError::UnknownTable(name.to_string())),
            None => Ok(self.tables.iter().filter(|t| t.enabled).collect()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FieldStats {
    pub updated: usize,
    pub already_populated: usize,
    pub no_data: usize,
    pub rejected: usize,
    pub low_confidence: usize,
    pub unreachable: usize,
    /// Staged on a record whose update call failed.
    pub failed: usize,
}

/// Failure of one record's update. Recorded and skipped; never aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{name} ({id}): {message}")]
pub struct RecordError {
    pub id: Uuid,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Updated { fields: Vec<TargetField> },
    /// Would have been updated; persistence was suppressed.
    DryRun { fields: Vec<TargetField> },
    Unchanged,
}

/// Accumulated for one table run and returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub records_seen: usize,
    pub records_updated: usize,
    pub records_unchanged: usize,
    pub records_failed: usize,
    pub fields: BTreeMap<TargetField, FieldStats>,
    pub errors: Vec<RecordError>,
}

impl RunStats {
    pub fn field(&self, field: TargetField) -> FieldStats {
        self.fields.get(&field).cloned().unwrap_or_default()
    }

    fn field_mut(&mut self, field: TargetField) -> &mut FieldStats {
        self.fields.entry(field).or_default()
    }

    pub fn record(&mut self, outcome: Result<RecordOutcome, RecordError>) {
        self.records_seen += 1;
        match outcome {
            Ok(RecordOutcome::Updated { .. }) | Ok(RecordOutcome::DryRun { .. }) => self.records_updated += 1,
            Ok(RecordOutcome::Unchanged) => self.records_unchanged += 1,
            Err(err) => {
                self.records_failed += 1;
                self.errors.push(err);
            }
        }
    }

    /// Percentage of records processed without a failed update.
    pub fn success_rate(&self) -> f64 {
        if self.records_seen == 0 {
            return 100.0;
        }
        (self.records_seen - self.records_failed) as f64 * 100.0 / self.records_seen as f64
    }
}

/// Fills the empty output columns of a single listing.
pub struct Reconciler {
    store: Arc<dyn ListingStore>,
    link_probe: Option<Arc<dyn LinkProbe>>,
    min_confidence: f64,
    dry_run: bool,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ListingStore>, min_confidence: f64, dry_run: bool) -> Self {
        Self {
            store,
            link_probe: None,
            min_confidence,
            dry_run,
        }
    }

    pub fn with_link_probe(mut self, probe: Arc<dyn LinkProbe>) -> Self {
        self.link_probe = Some(probe);
        self
    }

    /// Stages every extractable empty field, then commits them in one partial update.
    pub async fn reconcile(
        &self,
        table: &str,
        fields: &[TargetField],
        listing: &Listing,
        stats: &mut RunStats,
    ) -> Result<RecordOutcome, RecordError> {
        let mut update = ListingUpdate::new();

        for &field in fields {
            if listing.is_populated(field) {
                stats.field_mut(field).already_populated += 1;
                continue;
            }

            let extraction = extract(listing, field, self.min_confidence);
            let entry = stats.field_mut(field);
            entry.rejected += extraction.rejected;
            entry.low_confidence += extraction.low_confidence;
            let Some(result) = extraction.result else {
                entry.no_data += 1;
                continue;
            };

            if field == TargetField::Website {
                if let (Some(probe), Some(url)) = (&self.link_probe, result.value.as_text()) {
                    if !probe.is_reachable(url).await {
                        warn!(listing = %listing.name, url, "website unreachable; not staged");
                        stats.field_mut(field).unreachable += 1;
                        continue;
                    }
                }
            }

            info!(
                listing = %listing.name,
                field = %field,
                value = %result.value,
                source = %result.source,
                confidence = result.confidence,
                "staged field"
            );
            update.stage(field, result.value);
        }

        if update.is_empty() {
            return Ok(RecordOutcome::Unchanged);
        }
        let staged = update.fields();

        if self.dry_run {
            info!(
                listing = %listing.name,
                fields = update.len(),
                update = %update.to_json(),
                "dry run: update not persisted"
            );
            for field in &staged {
                stats.field_mut(*field).updated += 1;
            }
            return Ok(RecordOutcome::DryRun { fields: staged });
        }

        match self.store.update_fields(table, listing.id, &update).await {
            Ok(()) => {
                for field in &staged {
                    stats.field_mut(*field).updated += 1;
                }
                Ok(RecordOutcome::Updated { fields: staged })
            }
            Err(err) => {
                for field in &staged {
                    stats.field_mut(*field).failed += 1;
                }
                warn!(listing = %listing.name, error = %err, "update failed; continuing");
                Err(RecordError {
                    id: listing.id,
                    name: listing.name.clone(),
                    message: err.to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub table: String,
    pub display_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub filter_mode: FilterMode,
    pub fields: Vec<TargetField>,
    pub stats: RunStats,
    #[serde(skip)]
    pub report_path: Option<PathBuf>,
}

/// Walks a table one record at a time and writes a JSON report at the end.
pub struct Runner {
    store: Arc<dyn ListingStore>,
    reconciler: Reconciler,
    page_size: usize,
    logs_dir: PathBuf,
    report_prefix: String,
    dry_run: bool,
}

impl Runner {
    pub fn new(store: Arc<dyn ListingStore>, config: &ReconcileConfig, dry_run: bool) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone(), config.min_confidence, dry_run),
            store,
            page_size: config.page_size.max(1),
            logs_dir: config.logs_dir.clone(),
            report_prefix: config.report_prefix.clone(),
            dry_run,
        }
    }

    pub fn with_link_probe(mut self, probe: Arc<dyn LinkProbe>) -> Self {
        self.reconciler = self.reconciler.with_link_probe(probe);
        self
    }

    /// Every page is read before any update so offsets stay stable while updated rows leave the filter.
    pub async fn fetch_candidates(&self, table: &str, filter: &RecordFilter) -> Result<Vec<Listing>> {
        let mut rows = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .store
                .fetch_page(table, filter, offset, self.page_size)
                .await
                .with_context(|| format!("fetching {table} rows at offset {offset}"))?;
            // The server may cap a page below `page_size`; only an empty page ends the scan.
            if page.is_empty() {
                break;
            }
            offset += page.len();
            rows.extend(page);
        }
        Ok(rows)
    }

    pub async fn run_table(&self, table: &TableConfig) -> Result<RunReport> {
        let span = info_span!("reconcile_table", table = %table.table, dry_run = self.dry_run);
        self.run_table_inner(table).instrument(span).await
    }

    async fn run_table_inner(&self, table: &TableConfig) -> Result<RunReport> {
        let started_at = Utc::now();
        let fields = table.target_fields()?;
        let filter = table.record_filter(&fields);
        let listings = self.fetch_candidates(&table.table, &filter).await?;
        info!(records = listings.len(), fields = fields.len(), "fetched records needing reconciliation");

        let mut stats = RunStats::default();
        for listing in &listings {
            let outcome = self
                .reconciler
                .reconcile(&table.table, &fields, listing, &mut stats)
                .await;
            stats.record(outcome);
        }

        let mut report = RunReport {
            run_id: Uuid::new_v4(),
            table: table.table.clone(),
            display_name: table.display_name.clone(),
            started_at,
            finished_at: Utc::now(),
            dry_run: self.dry_run,
            filter_mode: table.filter_mode,
            fields,
            stats,
            report_path: None,
        };
        let path = write_report(&self.logs_dir, &self.report_prefix, &report).await?;
        info!(
            processed = report.stats.records_seen,
            updated = report.stats.records_updated,
            failed = report.stats.records_failed,
            report = %path.display(),
            "table run complete"
        );
        report.report_path = Some(path);
        Ok(report)
    }
}

pub fn report_file_name(prefix: &str, table: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}-{}.json", prefix, table, at.format("%Y%m%d_%H%M%S"))
}

pub async fn write_report(logs_dir: &Path, prefix: &str, report: &RunReport) -> Result<PathBuf> {
    fs::create_dir_all(logs_dir)
        .await
        .with_context(|| format!("creating {}", logs_dir.display()))?;
    let path = logs_dir.join(report_file_name(prefix, &report.table, report.finished_at));
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Human-readable end-of-run summary.
pub fn render_summary(report: &RunReport) -> String {
    let stats = &report.stats;
    let mut lines = vec![
        format!(
            "== {} ({}){} ==",
            report.display_name,
            report.table,
            if report.dry_run { " [dry run]" } else { "" }
        ),
        format!(
            "processed: {}  updated: {}  unchanged: {}  failed: {}  success rate: {:.1}%",
            stats.records_seen,
            stats.records_updated,
            stats.records_unchanged,
            stats.records_failed,
            stats.success_rate()
        ),
        "fields:".to_string(),
    ];
    for field in &report.fields {
        let f = stats.field(*field);
        lines.push(format!(
            "  {:<14} updated {:>5}  already populated {:>5}  no data {:>5}  rejected {:>5}  low confidence {:>4}  unreachable {:>4}  failed {:>4}",
            field.column(),
            f.updated,
            f.already_populated,
            f.no_data,
            f.rejected,
            f.low_confidence,
            f.unreachable,
            f.failed
        ));
    }
    if !stats.errors.is_empty() {
        lines.push(format!("errors ({}):", stats.errors.len()));
        for err in stats.errors.iter().take(SUMMARY_ERROR_LIMIT) {
            lines.push(format!("  - {err}"));
        }
        if stats.errors.len() > SUMMARY_ERROR_LIMIT {
            lines.push(format!("  ... and {} more", stats.errors.len() - SUMMARY_ERROR_LIMIT));
        }
    }
    if let Some(path) = &report.report_path {
        lines.push(format!("report: {}", path.display()));
    }
    lines.join("\n")
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub table: Option<String>,
    /// Read records from a fixture file into memory instead of the database.
    pub fixtures: Option<PathBuf>,
}

/// Startup problems (config, credentials, registry, initial fetch) return `Err` before or
/// instead of processing; per-record failures only show up in the reports.
pub async fn run_from_env(options: RunOptions) -> Result<Vec<RunReport>> {
    let config = ReconcileConfig::from_env()?;
    let registry = TableRegistry::load(&config.workspace_root)?;
    let tables = registry.select(options.table.as_deref())?;

    let store: Arc<dyn ListingStore> = match &options.fixtures {
        Some(path) => {
            let store = MemoryStore::new();
            let count = store.load_fixture_file(path).await?;
            info!(records = count, fixtures = %path.display(), "loaded fixture records");
            Arc::new(store)
        }
        None => {
            let credentials = Credentials::from_env()?;
            Arc::new(SupabaseStore::new(SupabaseConfig {
                base_url: credentials.supabase_url,
                service_role_key: credentials.service_role_key,
                http: HttpClientConfig {
                    timeout: Duration::from_secs(STORE_TIMEOUT_SECS),
                    user_agent: Some(USER_AGENT.to_string()),
                },
            })?)
        }
    };

    let mut runner = Runner::new(store, &config, options.dry_run);
    if config.check_links {
        let checker = LinkChecker::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(USER_AGENT.to_string()),
        })?;
        runner = runner.with_link_probe(Arc::new(checker));
    }

    let mut reports = Vec::with_capacity(tables.len());
    for table in tables {
        reports.push(runner.run_table(table).await?);
    }
    Ok(reports)
}
