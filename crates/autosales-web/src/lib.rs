//! Axum + Askama sales dashboard over the persisted wide tables.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use askama::Template;
use autosales_core::analytics::{self, GrowthPoint, PivotTable, Point, YOY_LAG};
use autosales_core::{reshape, Cadence, LongRecord, LongRelation, PeriodKey};
use autosales_storage::codec;
use autosales_sync::{SourceConfig, SourceRegistry};
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "autosales-web";

const SYNC_HINT: &str = "Run `autosales-cli sync` to collect data, then reload this page.";

pub struct AppState {
    pub workspace_root: PathBuf,
    pub cache: DatasetCache,
}

impl AppState {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            cache: DatasetCache::default(),
        }
    }

    fn registry(&self) -> anyhow::Result<SourceRegistry> {
        SourceRegistry::from_workspace_root(&self.workspace_root)
    }

    /// The first configured dataset of `cadence`, reshaped to long form.
    async fn dataset(&self, cadence: Cadence) -> anyhow::Result<Dataset> {
        let source = self
            .registry()?
            .sources
            .into_iter()
            .find(|s| s.cadence == cadence)
            .with_context(|| format!("no {cadence} source configured in sources.yaml"))?;
        let relation = self
            .cache
            .load(&self.workspace_root.join(&source.output), cadence)
            .await?;
        Ok(Dataset { source, relation })
    }
}

struct Dataset {
    source: SourceConfig,
    relation: Arc<LongRelation>,
}

impl Dataset {
    fn ensure_brand(&self, brand: &str) -> Result<(), ViewError> {
        if self.relation.records.iter().any(|r| r.brand == brand) {
            Ok(())
        } else {
            Err(ViewError::NotFound(format!(
                "brand `{brand}` has no data in {}",
                self.source.display_name
            )))
        }
    }
}

/// Long relations keyed by table path. An entry is reused until the file's
/// modification time changes.
#[derive(Debug, Default)]
pub struct DatasetCache {
    entries: Mutex<HashMap<PathBuf, CachedDataset>>,
}

#[derive(Debug)]
struct CachedDataset {
    modified: SystemTime,
    relation: Arc<LongRelation>,
}

impl DatasetCache {
    pub async fn load(&self, path: &Path, cadence: Cadence) -> anyhow::Result<Arc<LongRelation>> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("no dataset at {}", path.display()))?;
        let modified = metadata
            .modified()
            .with_context(|| format!("reading modification time of {}", path.display()))?;

        if let Some(entry) = self.entries.lock().await.get(path) {
            if entry.modified == modified && entry.relation.cadence == cadence {
                return Ok(Arc::clone(&entry.relation));
            }
        }

        let owned = path.to_path_buf();
        let table = tokio::task::spawn_blocking(move || codec::read_table(&owned, cadence))
            .await
            .context("table reader task panicked")??;
        let relation = Arc::new(reshape(&table));
        info!(
            path = %path.display(),
            rows = table.len(),
            periods = table.period_count(),
            "dataset loaded"
        );
        self.entries.lock().await.insert(
            path.to_path_buf(),
            CachedDataset {
                modified,
                relation: Arc::clone(&relation),
            },
        );
        Ok(relation)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ViewQuery {
    pub brand: Option<String>,
    pub brands: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

impl ViewQuery {
    fn brand_list(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.brands
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty() && seen.insert(b.to_string()))
            .map(str::to_string)
            .collect()
    }

    fn required_brand(&self) -> Result<&str, ViewError> {
        self.brand
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ViewError::BadRequest("query parameter `brand` is required".into()))
    }

    fn range(&self) -> Result<(Option<NaiveDate>, Option<NaiveDate>), ViewError> {
        Ok((parse_date("from", &self.from)?, parse_date("to", &self.to)?))
    }

    fn range_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(from) = self.from.as_deref().filter(|v| !v.is_empty()) {
            params.push(("from", from.to_string()));
        }
        if let Some(to) = self.to.as_deref().filter(|v| !v.is_empty()) {
            params.push(("to", to.to_string()));
        }
        params
    }
}

fn parse_date(name: &str, value: &Option<String>) -> Result<Option<NaiveDate>, ViewError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(v) => NaiveDate::parse_from_str(v, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| {
                ViewError::BadRequest(format!("`{name}` must be a YYYY-MM-DD date, got `{v}`"))
            }),
    }
}

#[derive(Debug)]
pub enum ViewError {
    Unavailable(anyhow::Error),
    BadRequest(String),
    NotFound(String),
}

impl From<anyhow::Error> for ViewError {
    fn from(err: anyhow::Error) -> Self {
        ViewError::Unavailable(err)
    }
}

impl ViewError {
    fn status(&self) -> StatusCode {
        match self {
            ViewError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ViewError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ViewError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn message(&self) -> String {
        match self {
            ViewError::Unavailable(err) => format!("{err:#}"),
            ViewError::BadRequest(msg) | ViewError::NotFound(msg) => msg.clone(),
        }
    }

    fn into_json(self) -> Response {
        (self.status(), Json(json!({ "error": self.message() }))).into_response()
    }
}

impl IntoResponse for ViewError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ViewError::Unavailable(err) = &self {
            warn!(error = %format!("{err:#}"), "dataset unavailable");
        }
        let (heading, hint) = match &self {
            ViewError::Unavailable(_) => ("Data unavailable", SYNC_HINT),
            ViewError::BadRequest(_) => {
                ("Invalid request", "Check the query parameters and try again.")
            }
            ViewError::NotFound(_) => ("Not found", "Pick a brand from the overview page."),
        };
        let tpl = ErrorTemplate {
            title: heading.to_string(),
            message: self.message(),
            hint: hint.to_string(),
        };
        match tpl.render() {
            Ok(html) => (status, Html(html)).into_response(),
            Err(err) => server_error(anyhow::anyhow!(err.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableView {
    pub headers: Vec<String>,
    pub rows: Vec<TableRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRow {
    pub label: String,
    pub cells: Vec<String>,
    pub emphasis: bool,
}

#[derive(Debug, Clone)]
struct BrandLink {
    name: String,
    href: String,
}

#[derive(Debug, Clone)]
struct DatasetSummary {
    display_name: String,
    source_id: String,
    cadence: String,
    output: String,
    rows: usize,
    first_period: String,
    last_period: String,
    brands: Vec<BrandLink>,
    has_error: bool,
    error: String,
}

impl DatasetSummary {
    fn loaded(source: &SourceConfig, relation: &LongRelation) -> Self {
        let (first, last) = relation
            .period_bounds()
            .map(|(a, b)| (period_heading(&a), period_heading(&b)))
            .unwrap_or_default();
        let base = match source.cadence {
            Cadence::Monthly => "/brands/",
            Cadence::Weekly => "/weekly/",
        };
        Self {
            display_name: source.display_name.clone(),
            source_id: source.source_id.clone(),
            cadence: source.cadence.to_string(),
            output: source.output.display().to_string(),
            rows: relation.row_count(),
            first_period: first,
            last_period: last,
            brands: relation
                .brands()
                .into_iter()
                .map(|name| BrandLink {
                    href: format!("{base}{}", encode_component(&name)),
                    name,
                })
                .collect(),
            has_error: false,
            error: String::new(),
        }
    }

    fn failed(source: &SourceConfig, err: &anyhow::Error) -> Self {
        Self {
            display_name: source.display_name.clone(),
            source_id: source.source_id.clone(),
            cadence: source.cadence.to_string(),
            output: source.output.display().to_string(),
            rows: 0,
            first_period: String::new(),
            last_period: String::new(),
            brands: Vec::new(),
            has_error: true,
            error: format!("{err:#}"),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    title: String,
    datasets: Vec<DatasetSummary>,
    hint: String,
}

#[derive(Template)]
#[template(path = "brand.html")]
struct BrandTemplate {
    title: String,
    brand: String,
    from: String,
    to: String,
    chart_url: String,
    table: TableView,
}

#[derive(Template)]
#[template(path = "totals.html")]
struct TotalsTemplate {
    title: String,
    selected: String,
    available: String,
    chart_url: String,
    table: TableView,
}

#[derive(Template)]
#[template(path = "compare.html")]
struct CompareTemplate {
    title: String,
    selected: String,
    available: String,
    has_warning: bool,
    warning: String,
    chart_url: String,
    table: TableView,
}

#[derive(Template)]
#[template(path = "weekly.html")]
struct WeeklyTemplate {
    title: String,
    brand: String,
    trend_chart_url: String,
    share_chart_url: String,
    shares: Vec<TableRow>,
    table: TableView,
}

#[derive(Template)]
#[template(path = "error.html")]
struct ErrorTemplate {
    title: String,
    message: String,
    hint: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/brands/{brand}", get(brand_handler))
        .route("/totals", get(totals_handler))
        .route("/compare", get(compare_handler))
        .route("/weekly/{brand}", get(weekly_handler))
        .route("/charts/{view}", get(chart_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("AUTOSALES_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let root = std::env::var("AUTOSALES_WORKSPACE").unwrap_or_else(|_| ".".to_string());
    let state = AppState::new(root);
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding dashboard port {port}"))?;
    info!(port, "dashboard listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Result<Response, ViewError> {
    let registry = state.registry()?;
    let mut datasets = Vec::with_capacity(registry.sources.len());
    for source in &registry.sources {
        let path = state.workspace_root.join(&source.output);
        let summary = match state.cache.load(&path, source.cadence).await {
            Ok(relation) => DatasetSummary::loaded(source, &relation),
            Err(err) => {
                warn!(
                    source_id = %source.source_id,
                    error = %format!("{err:#}"),
                    "dataset unavailable"
                );
                DatasetSummary::failed(source, &err)
            }
        };
        datasets.push(summary);
    }
    Ok(render_html(IndexTemplate {
        title: "Auto Sales Overview".into(),
        datasets,
        hint: SYNC_HINT.into(),
    }))
}

async fn brand_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(brand): AxumPath<String>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ViewError> {
    let (from, to) = query.range()?;
    let dataset = state.dataset(Cadence::Monthly).await?;
    dataset.ensure_brand(&brand)?;

    let records = analytics::filter_range(&dataset.relation.records, from, to);
    let pivot = PivotTable::build(&analytics::series_by_model(&records, &brand));
    let mut params = vec![("brand", brand.clone())];
    params.extend(query.range_params());

    Ok(render_html(BrandTemplate {
        title: format!("{brand}: monthly sales by model"),
        from: query.from.clone().unwrap_or_default(),
        to: query.to.clone().unwrap_or_default(),
        chart_url: chart_url("brand-models", &params),
        table: pivot_table_view("Model", &pivot),
        brand,
    }))
}

async fn totals_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ViewError> {
    let (from, to) = query.range()?;
    let dataset = state.dataset(Cadence::Monthly).await?;
    let brands = query.brand_list();

    let mut params = Vec::new();
    if !brands.is_empty() {
        params.push(("brands", brands.join(",")));
    }
    params.extend(query.range_params());

    Ok(render_html(TotalsTemplate {
        title: "Brand totals".into(),
        selected: brands.join(","),
        available: dataset.relation.brands().join(", "),
        chart_url: chart_url("totals", &params),
        table: totals_table(&dataset.relation.records, &brands, from, to),
    }))
}

async fn compare_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ViewError> {
    let (from, to) = query.range()?;
    let dataset = state.dataset(Cadence::Monthly).await?;
    let brands = query.brand_list();
    let available = dataset.relation.brands().join(", ");

    if brands.len() < 2 {
        return Ok(render_html(CompareTemplate {
            title: "Brand comparison".into(),
            selected: brands.join(","),
            available,
            has_warning: true,
            warning: "Select at least two brands to compare.".into(),
            chart_url: String::new(),
            table: TableView {
                headers: Vec::new(),
                rows: Vec::new(),
            },
        }));
    }

    let growth = growth_by_brand(&dataset.relation.records, &brands, from, to);
    let mut params = vec![("brands", brands.join(","))];
    params.extend(query.range_params());

    Ok(render_html(CompareTemplate {
        title: "Brand comparison".into(),
        selected: brands.join(","),
        available,
        has_warning: false,
        warning: String::new(),
        chart_url: chart_url("compare", &params),
        table: compare_table(&growth),
    }))
}

async fn weekly_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(brand): AxumPath<String>,
    Query(query): Query<ViewQuery>,
) -> Result<Response, ViewError> {
    let (from, to) = query.range()?;
    let dataset = state.dataset(Cadence::Weekly).await?;
    dataset.ensure_brand(&brand)?;

    let records = analytics::filter_range(&dataset.relation.records, from, to);
    let series = analytics::series_by_model(&records, &brand);
    let shares = analytics::overall_shares(&series);
    let share_rows = series
        .iter()
        .map(|(model, points)| TableRow {
            label: model.clone(),
            cells: vec![
                format_count(points.iter().map(|p| p.value).sum()),
                format_percent(shares.get(model).copied().flatten()),
            ],
            emphasis: false,
        })
        .collect();

    let mut params = vec![("brand", brand.clone())];
    params.extend(query.range_params());

    Ok(render_html(WeeklyTemplate {
        title: format!("{brand}: weekly sales by model"),
        trend_chart_url: chart_url("weekly-models", &params),
        share_chart_url: chart_url("weekly-share", &params),
        shares: share_rows,
        table: pivot_table_view("Model", &PivotTable::build(&series)),
        brand,
    }))
}

async fn chart_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(view): AxumPath<String>,
    Query(query): Query<ViewQuery>,
) -> Response {
    match build_chart(&state, &view, &query).await {
        Ok(figure) => Json(figure).into_response(),
        Err(err) => err.into_json(),
    }
}

async fn build_chart(
    state: &AppState,
    view: &str,
    query: &ViewQuery,
) -> Result<JsonValue, ViewError> {
    let (from, to) = query.range()?;
    match view {
        "brand-models" | "weekly-models" => {
            let brand = query.required_brand()?;
            let cadence = if view == "brand-models" {
                Cadence::Monthly
            } else {
                Cadence::Weekly
            };
            let dataset = state.dataset(cadence).await?;
            dataset.ensure_brand(brand)?;
            let records = analytics::filter_range(&dataset.relation.records, from, to);
            Ok(models_figure(
                &format!("{brand} {cadence} sales by model"),
                &analytics::series_by_model(&records, brand),
            ))
        }
        "totals" => {
            let dataset = state.dataset(Cadence::Monthly).await?;
            Ok(totals_figure(&dataset.relation.records, &query.brand_list(), from, to))
        }
        "compare" => {
            let brands = query.brand_list();
            if brands.len() < 2 {
                return Err(ViewError::BadRequest("select at least two brands to compare".into()));
            }
            let dataset = state.dataset(Cadence::Monthly).await?;
            Ok(compare_figure(&growth_by_brand(&dataset.relation.records, &brands, from, to)))
        }
        "weekly-share" => {
            let brand = query.required_brand()?;
            let dataset = state.dataset(Cadence::Weekly).await?;
            dataset.ensure_brand(brand)?;
            let records = analytics::filter_range(&dataset.relation.records, from, to);
            Ok(share_figure(
                &format!("{brand} model share"),
                &analytics::series_by_model(&records, brand),
            ))
        }
        other => Err(ViewError::NotFound(format!("unknown chart `{other}`"))),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

/// `1234.4` → `1,234`.
pub fn format_count(value: f64) -> String {
    let rounded = value.round();
    let digits = format!("{:.0}", rounded.abs());
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if rounded < 0.0 {
        out.push('-');
    }
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `12.345` → `12.3%`; undefined ratios render empty.
pub fn format_percent(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.1}%")).unwrap_or_default()
}

pub fn period_heading(period: &PeriodKey) -> String {
    match period.cadence() {
        Cadence::Monthly => period.date().format("%Y-%m").to_string(),
        Cadence::Weekly => {
            format!("W{:02} {}", period.iso_week(), period.date().format("%Y-%m-%d"))
        }
    }
}

fn encode_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~' | b',') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn chart_url(view: &str, params: &[(&str, String)]) -> String {
    if params.is_empty() {
        return format!("/charts/{view}");
    }
    let query = params
        .iter()
        .map(|(k, v)| format!("{k}={}", encode_component(v)))
        .collect::<Vec<_>>()
        .join("&");
    format!("/charts/{view}?{query}")
}

fn pivot_table_view(row_header: &str, pivot: &PivotTable) -> TableView {
    let mut headers = vec![row_header.to_string()];
    headers.extend(pivot.periods.iter().map(period_heading));
    let render = |row: &analytics::PivotRow, emphasis: bool| TableRow {
        label: row.label.clone(),
        cells: row
            .cells
            .iter()
            .map(|c| c.map(format_count).unwrap_or_default())
            .collect(),
        emphasis,
    };
    let mut rows: Vec<TableRow> = pivot.rows.iter().map(|r| render(r, false)).collect();
    rows.push(render(&pivot.total, true));
    TableView { headers, rows }
}

/// Brand × period pivot over `[from, to]` with a total row and the total's
/// year-over-year growth. Growth is taken over the whole history.
fn totals_table(
    records: &[LongRecord],
    brands: &[String],
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> TableView {
    let window = analytics::filter_range(records, from, to);
    let pivot = PivotTable::build(&analytics::series_by_brand(&window, brands));
    let growth: BTreeMap<PeriodKey, Option<f64>> = total_growth(records, brands, from, to)
        .into_iter()
        .map(|g| (g.period, g.growth))
        .collect();
    let mut table = pivot_table_view("Brand", &pivot);
    table.rows.push(TableRow {
        label: "YoY growth".into(),
        cells: pivot
            .periods
            .iter()
            .map(|p| format_percent(growth.get(p).copied().flatten()))
            .collect(),
        emphasis: false,
    });
    table
}

fn total_growth(
    records: &[LongRecord],
    brands: &[String],
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Vec<GrowthPoint> {
    let totals = analytics::totals_by_period(records, brands);
    analytics::yoy_growth_in_range(&totals, YOY_LAG, from, to)
}

/// Per-brand growth over the full series, restricted to `[from, to]`.
fn growth_by_brand(
    records: &[LongRecord],
    brands: &[String],
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> BTreeMap<String, Vec<GrowthPoint>> {
    analytics::series_by_brand(records, brands)
        .into_iter()
        .map(|(brand, points)| {
            let growth = analytics::yoy_growth_in_range(&points, YOY_LAG, from, to);
            (brand, growth)
        })
        .filter(|(_, growth)| !growth.is_empty())
        .collect()
}

/// Newest period first; each brand contributes a volume and a growth column.
fn compare_table(growth: &BTreeMap<String, Vec<GrowthPoint>>) -> TableView {
    let mut headers = vec!["Period".to_string()];
    for brand in growth.keys() {
        headers.push(format!("{brand} sales"));
        headers.push(format!("{brand} YoY"));
    }

    let lookup: BTreeMap<&String, BTreeMap<PeriodKey, &GrowthPoint>> = growth
        .iter()
        .map(|(brand, points)| (brand, points.iter().map(|g| (g.period, g)).collect()))
        .collect();
    let periods: BTreeSet<PeriodKey> = growth
        .values()
        .flat_map(|points| points.iter().map(|g| g.period))
        .collect();

    let rows = periods
        .iter()
        .rev()
        .map(|period| {
            let mut cells = Vec::with_capacity(growth.len() * 2);
            for points in lookup.values() {
                match points.get(period) {
                    Some(g) => {
                        cells.push(format_count(g.value));
                        cells.push(format_percent(g.growth));
                    }
                    None => {
                        cells.push(String::new());
                        cells.push(String::new());
                    }
                }
            }
            TableRow {
                label: period_heading(period),
                cells,
                emphasis: false,
            }
        })
        .collect();

    TableView { headers, rows }
}

fn x_values<'a>(periods: impl Iterator<Item = &'a PeriodKey>) -> Vec<String> {
    periods.map(|p| p.date().to_string()).collect()
}

fn base_layout(title: &str) -> JsonValue {
    json!({
        "title": title,
        "hovermode": "x unified",
        "paper_bgcolor": "#ffffff",
        "plot_bgcolor": "#f8fafc"
    })
}

fn models_figure(title: &str, series: &BTreeMap<String, Vec<Point>>) -> JsonValue {
    let data: Vec<JsonValue> = series
        .iter()
        .map(|(model, points)| {
            json!({
                "type": "scatter",
                "mode": "lines+markers",
                "name": model,
                "x": x_values(points.iter().map(|p| &p.period)),
                "y": points.iter().map(|p| p.value).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({ "data": data, "layout": base_layout(title) })
}

fn growth_trace(name: &str, growth: &[GrowthPoint]) -> JsonValue {
    json!({
        "type": "scatter",
        "mode": "lines+markers",
        "name": name,
        "x": x_values(growth.iter().map(|g| &g.period)),
        "y": growth.iter().map(|g| g.growth).collect::<Vec<_>>(),
        "yaxis": "y2",
    })
}

fn dual_axis_layout(title: &str, barmode: &str) -> JsonValue {
    let mut layout = base_layout(title);
    layout["barmode"] = json!(barmode);
    layout["yaxis"] = json!({ "title": "Sales" });
    layout["yaxis2"] = json!({ "title": "YoY growth (%)", "overlaying": "y", "side": "right" });
    layout
}

/// Stacked brand bars plus the combined total's growth on a second axis.
/// Each bar's hover text is the brand's share of that period.
fn totals_figure(
    records: &[LongRecord],
    brands: &[String],
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> JsonValue {
    let window = analytics::filter_range(records, from, to);
    let by_period = analytics::totals_by_period_and_brand(&window, brands);
    let shares = analytics::shares_by_period(&by_period);
    let members: BTreeSet<&String> = by_period.values().flat_map(|m| m.keys()).collect();

    let mut data: Vec<JsonValue> = members
        .into_iter()
        .map(|brand| {
            let y: Vec<f64> = by_period
                .values()
                .map(|m| m.get(brand).copied().unwrap_or(0.0))
                .collect();
            let text: Vec<String> = shares
                .values()
                .map(|m| format_percent(m.get(brand).copied().flatten()))
                .collect();
            json!({
                "type": "bar",
                "name": brand,
                "x": x_values(by_period.keys()),
                "y": y,
                "hovertext": text,
            })
        })
        .collect();
    let growth = total_growth(records, brands, from, to);
    data.push(growth_trace("Total YoY growth", &growth));
    json!({ "data": data, "layout": dual_axis_layout("Monthly sales by brand", "stack") })
}

fn compare_figure(growth: &BTreeMap<String, Vec<GrowthPoint>>) -> JsonValue {
    let mut data = Vec::with_capacity(growth.len() * 2);
    for (brand, points) in growth {
        data.push(json!({
            "type": "bar",
            "name": format!("{brand} sales"),
            "x": x_values(points.iter().map(|g| &g.period)),
            "y": points.iter().map(|g| g.value).collect::<Vec<_>>(),
            "text": points.iter().map(|g| format_count(g.value)).collect::<Vec<_>>(),
        }));
    }
    for (brand, points) in growth {
        data.push(growth_trace(&format!("{brand} YoY"), points));
    }
    json!({ "data": data, "layout": dual_axis_layout("Brand comparison", "group") })
}

fn share_figure(title: &str, series: &BTreeMap<String, Vec<Point>>) -> JsonValue {
    let shares = analytics::overall_shares(series);
    let labels: Vec<&String> = series.keys().collect();
    let values: Vec<f64> = series
        .values()
        .map(|points| points.iter().map(|p| p.value).sum())
        .collect();
    let text: Vec<String> = labels
        .iter()
        .map(|l| format_percent(shares.get(*l).copied().flatten()))
        .collect();
    json!({
        "data": [{
            "type": "pie",
            "labels": labels,
            "values": values,
            "text": text,
            "textinfo": "label+text",
            "hole": 0.3,
        }],
        "layout": { "title": title, "paper_bgcolor": "#ffffff" }
    })
}
