//! Sync pipeline orchestration: collect, merge, persist, report.

pub mod merge;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use autosales_adapters::{adapter_for_source, collect_brand, AdapterContext, BrandConfig};
use autosales_core::Cadence;
use autosales_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, TableStore};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use merge::{aggregate, merge, Cell, MergeStats};

pub const CRATE_NAME: &str = "autosales-sync";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("sources.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub cadence: Cadence,
    pub endpoint: String,
    /// Destination table, relative to the workspace root.
    pub output: PathBuf,
    pub first_period: NaiveDate,
    #[serde(default)]
    pub brands: Vec<BrandConfig>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_delay_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub fallback_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: std::env::var("AUTOSALES_WORKSPACE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            user_agent: std::env::var("AUTOSALES_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env_number("AUTOSALES_HTTP_TIMEOUT_SECS").unwrap_or(20),
            request_delay_ms: env_number("AUTOSALES_REQUEST_DELAY_MS").unwrap_or(1500),
            max_retries: env_number("AUTOSALES_MAX_RETRIES").unwrap_or(3),
            retry_delay_ms: env_number("AUTOSALES_RETRY_DELAY_MS").unwrap_or(2000),
            fallback_dir: std::env::var("AUTOSALES_FALLBACK_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            scheduler_enabled: std::env::var("AUTOSALES_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("AUTOSALES_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let retry_delay = Duration::from_millis(self.retry_delay_ms);
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            request_delay: Duration::from_millis(self.request_delay_ms),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: retry_delay,
                max_delay: retry_delay,
            },
        }
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRequest {
    pub brand: String,
    pub period: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRunSummary {
    pub source_id: String,
    pub cadence: Cadence,
    pub status: SourceStatus,
    pub periods_requested: usize,
    pub brands_requested: usize,
    pub brands_with_data: usize,
    pub fetched_requests: usize,
    pub skipped_requests: Vec<SkippedRequest>,
    pub records: usize,
    pub merged_rows: usize,
    pub new_rows: usize,
    pub overridden_cells: usize,
    pub output: Option<String>,
    pub used_fallback: bool,
    pub content_hash: Option<String>,
    pub error: Option<String>,
}

impl SourceRunSummary {
    fn failed(source: &SourceConfig, err: &anyhow::Error) -> Self {
        Self {
            source_id: source.source_id.clone(),
            cadence: source.cadence,
            status: SourceStatus::Failed,
            periods_requested: 0,
            brands_requested: source.brands.len(),
            brands_with_data: 0,
            fetched_requests: 0,
            skipped_requests: Vec::new(),
            records: 0,
            merged_rows: 0,
            new_rows: 0,
            overridden_cells: 0,
            output: None,
            used_fallback: false,
            content_hash: None,
            error: Some(format!("{err:#}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceRunSummary>,
    pub report_path: String,
}

impl SyncRunSummary {
    pub fn failed_sources(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| s.status == SourceStatus::Failed)
            .map(|s| s.source_id.as_str())
            .collect()
    }

    /// Turns a run with failed sources into an error for the caller's exit code.
    pub fn into_result(self) -> Result<Self> {
        let failed = self.failed_sources();
        if !failed.is_empty() {
            bail!(
                "sync run {} failed for: {} (see {})",
                self.run_id,
                failed.join(", "),
                self.report_path
            );
        }
        Ok(self)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    store: TableStore,
    today: Option<NaiveDate>,
    running: AtomicBool,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())?;
        let store = TableStore::new(config.fallback_dir.clone());
        Ok(Self {
            config,
            http,
            store,
            today: None,
            running: AtomicBool::new(false),
        })
    }

    /// Pins the date used to decide which periods to request.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_sources(None).await
    }

    /// Syncs every enabled source, or only `only` when given. A failing
    /// source is recorded in the summary and does not stop the others.
    pub async fn run_sources(&self, only: Option<&str>) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = SourceRegistry::from_workspace_root(&self.config.workspace_root)?;

        let selected: Vec<&SourceConfig> = match only {
            Some(id) => vec![registry
                .source(id)
                .with_context(|| format!("unknown source `{id}` in sources.yaml"))?],
            None => registry.sources.iter().filter(|s| s.enabled).collect(),
        };

        let mut sources = Vec::with_capacity(selected.len());
        for source in selected {
            let span = info_span!("sync_source", %run_id, source_id = %source.source_id);
            let summary = match self.sync_source(run_id, source).instrument(span).await {
                Ok(summary) => summary,
                Err(err) => {
                    error!(
                        source_id = %source.source_id,
                        error = %format!("{err:#}"),
                        "source sync failed"
                    );
                    SourceRunSummary::failed(source, &err)
                }
            };
            sources.push(summary);
        }

        let finished_at = Utc::now();
        let reports_dir = self.config.workspace_root.join("reports").join(run_id.to_string());
        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            sources,
            report_path: reports_dir.join("run_summary.json").display().to_string(),
        };
        self.write_reports(&reports_dir, &mut summary).await?;
        Ok(summary)
    }

    /// Runs unless another run on this pipeline is still in flight.
    pub async fn run_guarded(&self) -> Option<Result<SyncRunSummary>> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("previous sync still running; tick skipped");
            return None;
        }
        let result = self.run_once().await;
        self.running.store(false, Ordering::SeqCst);
        Some(result)
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_guarded().await {
                    Some(Ok(summary)) => {
                        let failed = summary.failed_sources();
                        if failed.is_empty() {
                            info!(run_id = %summary.run_id, "scheduled sync completed");
                        } else {
                            warn!(
                                run_id = %summary.run_id,
                                failed = ?failed,
                                "scheduled sync finished with failures"
                            );
                        }
                    }
                    Some(Err(err)) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                    None => {}
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn sync_source(&self, run_id: Uuid, source: &SourceConfig) -> Result<SourceRunSummary> {
        let adapter = adapter_for_source(&source.source_id, &source.endpoint)
            .with_context(|| format!("no adapter registered for {}", source.source_id))?;
        if adapter.cadence() != source.cadence {
            bail!(
                "source {} is configured as {} but its adapter is {}",
                source.source_id,
                source.cadence,
                adapter.cadence()
            );
        }

        let today = self.today.unwrap_or_else(|| Local::now().date_naive());
        let periods = source.cadence.periods_until(source.first_period, today);
        info!(
            periods = periods.len(),
            brands = source.brands.len(),
            "collecting"
        );

        let ctx = AdapterContext { run_id };
        let mut harvests = Vec::with_capacity(source.brands.len());
        for brand in &source.brands {
            harvests.push(collect_brand(&self.http, adapter.as_ref(), &ctx, brand, &periods).await);
        }

        let fresh = merge::aggregate(source.cadence, &harvests)
            .context("aggregating collected records")?;
        let destination = self.config.workspace_root.join(&source.output);
        let prior = self
            .store
            .load(&destination, source.cadence)
            .await
            .with_context(|| format!("loading prior table {}", destination.display()))?;
        let (merged, stats) = merge::merge(prior.as_ref(), fresh)
            .with_context(|| format!("merging into {}", destination.display()))?;
        let outcome = self.store.persist(&merged, &destination).await?;

        info!(
            rows = stats.merged_rows,
            new_rows = stats.new_rows,
            overridden_cells = stats.overridden_cells,
            output = %outcome.path.display(),
            fallback = outcome.used_fallback,
            "table persisted"
        );

        let skipped_requests: Vec<SkippedRequest> = harvests
            .iter()
            .flat_map(|h| {
                h.skipped_periods.iter().map(|s| SkippedRequest {
                    brand: h.brand.name.clone(),
                    period: s.period.clone(),
                    reason: s.reason.clone(),
                })
            })
            .collect();

        Ok(SourceRunSummary {
            source_id: source.source_id.clone(),
            cadence: source.cadence,
            status: SourceStatus::Completed,
            periods_requested: periods.len(),
            brands_requested: source.brands.len(),
            brands_with_data: merge::harvested_brands(&harvests).len(),
            fetched_requests: harvests.iter().map(|h| h.fetched_periods.len()).sum(),
            skipped_requests,
            records: harvests.iter().map(|h| h.records.len()).sum(),
            merged_rows: stats.merged_rows,
            new_rows: stats.new_rows,
            overridden_cells: stats.overridden_cells,
            output: Some(outcome.path.display().to_string()),
            used_fallback: outcome.used_fallback,
            content_hash: Some(outcome.content_hash),
            error: None,
        })
    }

    async fn write_reports(&self, reports_dir: &Path, summary: &mut SyncRunSummary) -> Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let json = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        let path = reports_dir.join("run_summary.json");
        fs::write(&path, json)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        summary.report_path = path.display().to_string();
        Ok(())
    }
}

pub async fn run_sync_once_from_env(only: Option<&str>) -> Result<SyncRunSummary> {
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;
    pipeline.run_sources(only).await
}

/// Runs the cron scheduler until Ctrl-C.
pub async fn run_scheduler_from_env() -> Result<()> {
    let mut config = SyncConfig::from_env();
    config.scheduler_enabled = true;
    let pipeline = Arc::new(SyncPipeline::new(config)?);
    let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %pipeline.config().sync_cron, "scheduler started");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}

/// Markdown digest of the most recent run summaries, newest first.
pub fn report_recent_runs(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut summaries = Vec::new();
    if reports_root.exists() {
        for entry in std::fs::read_dir(&reports_root)
            .with_context(|| format!("reading {}", reports_root.display()))?
        {
            let entry = entry.with_context(|| format!("reading {}", reports_root.display()))?;
            let path = entry.path().join("run_summary.json");
            if !path.is_file() {
                continue;
            }
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let summary: SyncRunSummary = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            summaries.push(summary);
        }
    }
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Auto Sales Sync Report".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No sync runs recorded yet.".to_string());
    }
    for summary in summaries.iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at.format("%Y-%m-%d %H:%M:%S UTC")));
        lines.push(format!(
            "- duration: {}s",
            (summary.finished_at - summary.started_at).num_seconds()
        ));
        for source in &summary.sources {
            let status = match source.status {
                SourceStatus::Completed => "completed",
                SourceStatus::Failed => "FAILED",
            };
            lines.push(format!(
                "- {} ({}): {status}, {} rows ({} new), {} cells updated, {} requests skipped",
                source.source_id,
                source.cadence,
                source.merged_rows,
                source.new_rows,
                source.overridden_cells,
                source.skipped_requests.len()
            ));
            if let Some(output) = &source.output {
                let note = if source.used_fallback { " (fallback)" } else { "" };
                lines.push(format!("  - output: `{output}`{note}"));
            }
            if let Some(err) = &source.error {
                lines.push(format!("  - error: {err}"));
            }
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use autosales_core::{SeriesKey, WideTable};
    use autosales_storage::testing::serve_canned;
    use tempfile::tempdir;

    fn test_config(root: &Path) -> SyncConfig {
        SyncConfig {
            workspace_root: root.to_path_buf(),
            user_agent: "autosales-test".into(),
            http_timeout_secs: 5,
            request_delay_ms: 1,
            max_retries: 0,
            retry_delay_ms: 1,
            fallback_dir: None,
            scheduler_enabled: false,
            sync_cron: "0 0 6 * * *".into(),
        }
    }

    fn write_registry(root: &Path, endpoint: &str) {
        let yaml = format!(
            r#"sources:
  - source_id: dongchedi
    display_name: Dongchedi monthly
    enabled: true
    cadence: monthly
    endpoint: "{endpoint}"
    output: data/monthly.csv
    first_period: 2024-02-01
    brands:
      - {{ name: BrandA, id: 1 }}
  - source_id: autohome
    display_name: Autohome weekly
    enabled: false
    cadence: weekly
    endpoint: "{endpoint}"
    output: data/weekly.parquet
    first_period: 2025-01-01
    brands: []
"#
        );
        std::fs::write(root.join("sources.yaml"), yaml).unwrap();
    }

    fn month(label: &str) -> autosales_core::PeriodKey {
        Cadence::Monthly.parse_label(label).unwrap()
    }

    #[tokio::test]
    async fn run_updates_existing_table_and_writes_report() {
        let dir = tempdir().unwrap();
        let body = |count: u32| {
            format!(
                r#"{{"data":{{"list":[{{"brand_name":"BrandA","series_name":"ModelX","price":"100000","count":{count}}}]}}}}"#
            )
        };
        let (endpoint, hits) = serve_canned(vec![(200, body(65)), (200, body(70))])
            .await
            .unwrap();
        write_registry(dir.path(), &endpoint);

        let x = SeriesKey::new("BrandA", "ModelX", "100000");
        let mut prior = WideTable::new(Cadence::Monthly);
        prior.set_value(x.clone(), month("202401"), 50.0).unwrap();
        prior.set_value(x.clone(), month("202402"), 60.0).unwrap();
        let store = TableStore::default();
        let dest = dir.path().join("data/monthly.csv");
        store.persist(&prior, &dest).await.unwrap();

        let pipeline = SyncPipeline::new(test_config(dir.path()))
            .unwrap()
            .with_today(NaiveDate::from_ymd_opt(2024, 4, 15).unwrap());
        let summary = pipeline.run_once().await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(summary.sources.len(), 1);
        let source = &summary.sources[0];
        assert_eq!(source.status, SourceStatus::Completed);
        assert_eq!(source.periods_requested, 2);
        assert_eq!(source.overridden_cells, 1);

        let merged = store.load(&dest, Cadence::Monthly).await.unwrap().unwrap();
        let row: Vec<f64> = merged.row(&x).unwrap().values().copied().collect();
        assert_eq!(row, vec![50.0, 65.0, 70.0]);

        assert!(Path::new(&summary.report_path).exists());
        let digest = report_recent_runs(5, Some(dir.path().to_path_buf())).unwrap();
        assert!(digest.contains(&summary.run_id.to_string()));
        assert!(digest.contains("dongchedi (monthly): completed"));
    }

    #[tokio::test]
    async fn corrupt_prior_table_fails_the_source_without_overwriting() {
        let dir = tempdir().unwrap();
        let (endpoint, _hits) = serve_canned(vec![
            (200, r#"{"data":{"list":[]}}"#.to_string()),
            (200, r#"{"data":{"list":[]}}"#.to_string()),
        ])
        .await
        .unwrap();
        write_registry(dir.path(), &endpoint);
        let dest = dir.path().join("data/monthly.csv");
        std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
        std::fs::write(&dest, "model,price,202401\nX,1,2\n").unwrap();

        let pipeline = SyncPipeline::new(test_config(dir.path()))
            .unwrap()
            .with_today(NaiveDate::from_ymd_opt(2024, 4, 15).unwrap());
        let summary = pipeline.run_once().await.unwrap();

        assert_eq!(summary.failed_sources(), vec!["dongchedi"]);
        assert!(summary.sources[0].error.as_deref().unwrap().contains("loading prior table"));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "model,price,202401\nX,1,2\n");
        assert!(summary.into_result().is_err());
    }

    #[tokio::test]
    async fn unknown_source_filter_is_an_error() {
        let dir = tempdir().unwrap();
        write_registry(dir.path(), "http://127.0.0.1:9/rank");
        let pipeline = SyncPipeline::new(test_config(dir.path())).unwrap();
        assert!(pipeline.run_sources(Some("nope")).await.is_err());
    }

    #[tokio::test]
    async fn guarded_run_skips_while_busy() {
        let dir = tempdir().unwrap();
        write_registry(dir.path(), "http://127.0.0.1:9/rank");
        let pipeline = SyncPipeline::new(test_config(dir.path())).unwrap();
        pipeline.running.store(true, Ordering::SeqCst);
        assert!(pipeline.run_guarded().await.is_none());
    }

    #[test]
    fn registry_parses_brand_tables() {
        let dir = tempdir().unwrap();
        write_registry(dir.path(), "http://localhost/rank");
        let registry = SourceRegistry::from_workspace_root(dir.path()).unwrap();
        let monthly = registry.source("dongchedi").unwrap();
        assert_eq!(monthly.cadence, Cadence::Monthly);
        assert_eq!(monthly.brands, vec![BrandConfig::new("BrandA", 1)]);
        assert_eq!(monthly.output, PathBuf::from("data/monthly.csv"));
        assert!(!registry.source("autohome").unwrap().enabled);
    }

    #[test]
    fn shipped_registry_matches_adapters() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let registry = SourceRegistry::from_workspace_root(&root).unwrap();
        for source in &registry.sources {
            let adapter = adapter_for_source(&source.source_id, &source.endpoint).unwrap();
            assert_eq!(adapter.cadence(), source.cadence);
            assert!(!source.brands.is_empty());
        }
        let monthly = registry.source("dongchedi").unwrap();
        assert_eq!(monthly.first_period, NaiveDate::from_ymd_opt(2022, 2, 1).unwrap());
        assert_eq!(monthly.brands.len(), 15);
        assert_eq!(registry.source("autohome").unwrap().brands.len(), 14);
    }

    #[test]
    fn backoff_uses_fixed_retry_delay() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let http = config.http_client_config();
        assert_eq!(http.backoff.delay_for_attempt(0), http.backoff.delay_for_attempt(3));
        assert_eq!(http.request_delay, Duration::from_millis(1));
    }

    #[test]
    fn empty_report_directory_renders_placeholder() {
        let dir = tempdir().unwrap();
        let digest = report_recent_runs(3, Some(dir.path().to_path_buf())).unwrap();
        assert!(digest.contains("No sync runs recorded yet."));
    }
}
