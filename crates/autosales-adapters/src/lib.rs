//! Ranking-source adapter contracts + the monthly and weekly adapters.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use autosales_core::{Cadence, PeriodKey, SalesRecord, SeriesKey};
use autosales_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "autosales-adapters";

pub const DONGCHEDI_SOURCE_ID: &str = "dongchedi";
pub const AUTOHOME_SOURCE_ID: &str = "autohome";

pub const DONGCHEDI_ENDPOINT: &str = "https://www.dongchedi.com/motor/pc/car/rank_data";
pub const AUTOHOME_ENDPOINT: &str =
    "https://cars.app.autohome.com.cn/carext/recrank/all/getrecranklistpageresult2";

/// One entry of a source's hand-maintained brand-id lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrandConfig {
    pub name: String,
    pub id: u32,
}

impl BrandConfig {
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

/// A fully described GET: endpoint plus ordered query pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
}

impl SourceRequest {
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed {source_id} response for {period}: {reason}")]
    Malformed {
        source_id: &'static str,
        period: String,
        reason: String,
    },
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn cadence(&self) -> Cadence;

    fn request_for(&self, brand: &BrandConfig, period: PeriodKey) -> SourceRequest;

    fn parse_response(
        &self,
        brand: &BrandConfig,
        period: PeriodKey,
        body: &[u8],
    ) -> Result<Vec<SalesRecord>, AdapterError>;

    async fn fetch_period(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        brand: &BrandConfig,
        period: PeriodKey,
    ) -> Result<Vec<SalesRecord>, AdapterError> {
        let request = self.request_for(brand, period);
        let response = http
            .fetch_bytes(ctx.run_id, self.source_id(), &request.url, &request.query)
            .await?;
        self.parse_response(brand, period, &response.body)
    }
}

/// Monthly new-energy sales ranking, one request per (brand, month).
#[derive(Debug, Clone)]
pub struct DongchediAdapter {
    endpoint: String,
}

impl DongchediAdapter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for DongchediAdapter {
    fn default() -> Self {
        Self::new(DONGCHEDI_ENDPOINT)
    }
}

#[async_trait]
impl SourceAdapter for DongchediAdapter {
    fn source_id(&self) -> &'static str {
        DONGCHEDI_SOURCE_ID
    }

    fn cadence(&self) -> Cadence {
        Cadence::Monthly
    }

    fn request_for(&self, brand: &BrandConfig, period: PeriodKey) -> SourceRequest {
        SourceRequest {
            url: self.endpoint.clone(),
            query: pairs(&[
                ("brand_id", brand.id.to_string()),
                ("month", period.label()),
                ("rank_data_type", "11".to_string()),
                ("new_energy_type", "1,2,3".to_string()),
            ]),
        }
    }

    fn parse_response(
        &self,
        brand: &BrandConfig,
        period: PeriodKey,
        body: &[u8],
    ) -> Result<Vec<SalesRecord>, AdapterError> {
        let items = ranking_list(self.source_id(), period, body, "data")?;
        Ok(items
            .iter()
            .filter_map(|item| {
                let brand_name = text_field(item, "brand_name")
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| brand.name.clone());
                record_from_item(
                    self.source_id(),
                    period,
                    brand_name,
                    item,
                    ["series_name", "price", "count"],
                )
            })
            .collect())
    }
}

/// Weekly recommended-ranking list, one request per (brand, week).
#[derive(Debug, Clone)]
pub struct AutohomeAdapter {
    endpoint: String,
}

impl AutohomeAdapter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

impl Default for AutohomeAdapter {
    fn default() -> Self {
        Self::new(AUTOHOME_ENDPOINT)
    }
}

#[async_trait]
impl SourceAdapter for AutohomeAdapter {
    fn source_id(&self) -> &'static str {
        AUTOHOME_SOURCE_ID
    }

    fn cadence(&self) -> Cadence {
        Cadence::Weekly
    }

    fn request_for(&self, brand: &BrandConfig, period: PeriodKey) -> SourceRequest {
        SourceRequest {
            url: self.endpoint.clone(),
            query: pairs(&[
                ("from", "28".to_string()),
                ("pm", "2".to_string()),
                ("pluginversion", "11.65.0".to_string()),
                ("model", "1".to_string()),
                ("channel", "0".to_string()),
                ("pageindex", "1".to_string()),
                ("pagesize", "50".to_string()),
                ("typeid", "1".to_string()),
                ("subranktypeid", "2".to_string()),
                ("levelid", "0".to_string()),
                ("price", "0-9000".to_string()),
                ("brandid", brand.id.to_string()),
                ("week", period.label()),
            ]),
        }
    }

    fn parse_response(
        &self,
        brand: &BrandConfig,
        period: PeriodKey,
        body: &[u8],
    ) -> Result<Vec<SalesRecord>, AdapterError> {
        let items = ranking_list(self.source_id(), period, body, "result")?;
        Ok(items
            .iter()
            .filter_map(|item| {
                record_from_item(
                    self.source_id(),
                    period,
                    brand.name.clone(),
                    item,
                    ["seriesname", "priceinfo", "salecount"],
                )
            })
            .collect())
    }
}

pub fn adapter_for_source(source_id: &str, endpoint: &str) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        DONGCHEDI_SOURCE_ID => Some(Box::new(DongchediAdapter::new(endpoint))),
        AUTOHOME_SOURCE_ID => Some(Box::new(AutohomeAdapter::new(endpoint))),
        _ => None,
    }
}

fn pairs(items: &[(&str, String)]) -> Vec<(String, String)> {
    items
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// Pulls `<container>.list` out of a ranking response body.
fn ranking_list(
    source_id: &'static str,
    period: PeriodKey,
    body: &[u8],
    container: &str,
) -> Result<Vec<JsonValue>, AdapterError> {
    let malformed = |reason: String| AdapterError::Malformed {
        source_id,
        period: period.label(),
        reason,
    };
    let json: JsonValue =
        serde_json::from_slice(body).map_err(|e| malformed(format!("invalid json: {e}")))?;
    match json.pointer(&format!("/{container}/list")) {
        Some(JsonValue::Array(items)) => Ok(items.clone()),
        Some(JsonValue::Null) => Ok(Vec::new()),
        Some(_) => Err(malformed(format!("`{container}.list` is not an array"))),
        None => Err(malformed(format!("missing `{container}.list`"))),
    }
}

fn record_from_item(
    source_id: &'static str,
    period: PeriodKey,
    brand_name: String,
    item: &JsonValue,
    [model_field, price_field, count_field]: [&str; 3],
) -> Option<SalesRecord> {
    let model = text_field(item, model_field).unwrap_or_default();
    let price = text_field(item, price_field).unwrap_or_default();
    let value = match item.get(count_field) {
        None | Some(JsonValue::Null) => 0.0,
        Some(raw) => match number_value(raw) {
            Some(v) => v,
            None => {
                warn!(
                    source_id,
                    period = %period,
                    model = %model,
                    count = %raw,
                    "unreadable sales count; item skipped"
                );
                return None;
            }
        },
    };
    Some(SalesRecord {
        key: SeriesKey::new(brand_name, model, price),
        period,
        value,
    })
}

fn text_field(item: &JsonValue, field: &str) -> Option<String> {
    match item.get(field)? {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number_value(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) if s.trim().is_empty() => Some(0.0),
        JsonValue::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedPeriod {
    pub period: String,
    pub reason: String,
}

/// Everything one brand's collection produced. Skipped periods are kept
/// apart from fetched ones so the merge can leave their history untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct BrandHarvest {
    pub brand: BrandConfig,
    pub fetched_periods: Vec<PeriodKey>,
    pub skipped_periods: Vec<SkippedPeriod>,
    pub records: Vec<SalesRecord>,
}

/// Requests every period for one brand, one at a time and in order. A
/// failed or malformed period is logged and skipped; the brand carries on.
pub async fn collect_brand(
    http: &HttpFetcher,
    adapter: &dyn SourceAdapter,
    ctx: &AdapterContext,
    brand: &BrandConfig,
    periods: &[PeriodKey],
) -> BrandHarvest {
    let mut harvest = BrandHarvest {
        brand: brand.clone(),
        fetched_periods: Vec::with_capacity(periods.len()),
        skipped_periods: Vec::new(),
        records: Vec::new(),
    };

    for period in periods {
        match adapter.fetch_period(http, ctx, brand, *period).await {
            Ok(records) => {
                info!(
                    source_id = adapter.source_id(),
                    brand = %brand.name,
                    period = %period,
                    records = records.len(),
                    "period collected"
                );
                harvest.fetched_periods.push(*period);
                harvest.records.extend(records);
            }
            Err(err) => {
                warn!(
                    source_id = adapter.source_id(),
                    brand = %brand.name,
                    period = %period,
                    error = %err,
                    "period skipped"
                );
                harvest.skipped_periods.push(SkippedPeriod {
                    period: period.label(),
                    reason: err.to_string(),
                });
            }
        }
    }

    harvest
}

/// Reads a captured response body from disk.
pub fn load_fixture(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).with_context(|| format!("reading fixture {}", path.display()))
}
