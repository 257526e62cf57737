//! Read-only derivations over the long relation: time series, per-period
//! aggregation, year-over-year growth, share of total and pivot tables.
//!
//! Undefined ratios are `None`, never an error and never zero.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::{LongRecord, PeriodKey};

/// Positional lag used for year-over-year growth. Applied identically to
/// monthly and weekly datasets; on weekly data this compares against the
/// value twelve weeks earlier.
pub const YOY_LAG: usize = 12;

pub const TOTAL_LABEL: &str = "Total";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub period: PeriodKey,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthPoint {
    pub period: PeriodKey,
    pub value: f64,
    pub lagged: Option<f64>,
    pub growth: Option<f64>,
}

/// Whether the period's date falls inside `[from, to]`.
pub fn in_range(period: &PeriodKey, from: Option<NaiveDate>, to: Option<NaiveDate>) -> bool {
    from.map_or(true, |f| period.date() >= f) && to.map_or(true, |t| period.date() <= t)
}

/// Keeps records whose period date falls inside `[from, to]`.
pub fn filter_range(
    records: &[LongRecord],
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Vec<LongRecord> {
    records
        .iter()
        .filter(|r| in_range(&r.period, from, to))
        .cloned()
        .collect()
}

fn selected(brands: &[String], brand: &str) -> bool {
    brands.is_empty() || brands.iter().any(|b| b == brand)
}

fn into_series(
    grouped: BTreeMap<String, BTreeMap<PeriodKey, f64>>,
) -> BTreeMap<String, Vec<Point>> {
    grouped
        .into_iter()
        .map(|(label, cells)| {
            let points = cells
                .into_iter()
                .map(|(period, value)| Point { period, value })
                .collect();
            (label, points)
        })
        .collect()
}

/// One series per brand (summed over models). An empty `brands` slice
/// selects every brand.
pub fn series_by_brand(records: &[LongRecord], brands: &[String]) -> BTreeMap<String, Vec<Point>> {
    let mut grouped: BTreeMap<String, BTreeMap<PeriodKey, f64>> = BTreeMap::new();
    for r in records.iter().filter(|r| selected(brands, &r.brand)) {
        *grouped
            .entry(r.brand.clone())
            .or_default()
            .entry(r.period)
            .or_insert(0.0) += r.value;
    }
    into_series(grouped)
}

/// One series per model of `brand`.
pub fn series_by_model(records: &[LongRecord], brand: &str) -> BTreeMap<String, Vec<Point>> {
    let mut grouped: BTreeMap<String, BTreeMap<PeriodKey, f64>> = BTreeMap::new();
    for r in records.iter().filter(|r| r.brand == brand) {
        *grouped
            .entry(r.model.clone())
            .or_default()
            .entry(r.period)
            .or_insert(0.0) += r.value;
    }
    into_series(grouped)
}

/// Sum over the selected brands per period, ascending.
pub fn totals_by_period(records: &[LongRecord], brands: &[String]) -> Vec<Point> {
    let mut totals: BTreeMap<PeriodKey, f64> = BTreeMap::new();
    for r in records.iter().filter(|r| selected(brands, &r.brand)) {
        *totals.entry(r.period).or_insert(0.0) += r.value;
    }
    totals
        .into_iter()
        .map(|(period, value)| Point { period, value })
        .collect()
}

/// Per period, the sum of each selected brand.
pub fn totals_by_period_and_brand(
    records: &[LongRecord],
    brands: &[String],
) -> BTreeMap<PeriodKey, BTreeMap<String, f64>> {
    let mut out: BTreeMap<PeriodKey, BTreeMap<String, f64>> = BTreeMap::new();
    for r in records.iter().filter(|r| selected(brands, &r.brand)) {
        *out.entry(r.period)
            .or_default()
            .entry(r.brand.clone())
            .or_insert(0.0) += r.value;
    }
    out
}

/// Growth of each point against the point `lag` positions earlier, in
/// percent. `None` when there is no such point or its value is zero.
pub fn yoy_growth(series: &[Point], lag: usize) -> Vec<GrowthPoint> {
    series
        .iter()
        .enumerate()
        .map(|(idx, point)| {
            let lagged = idx
                .checked_sub(lag)
                .filter(|_| lag > 0)
                .and_then(|i| series.get(i))
                .map(|p| p.value);
            let growth = lagged
                .filter(|base| *base != 0.0)
                .map(|base| (point.value - base) / base * 100.0);
            GrowthPoint {
                period: point.period,
                value: point.value,
                lagged,
                growth,
            }
        })
        .collect()
}

/// Growth over the whole `series`, keeping only the points inside
/// `[from, to]`. Lagged values may come from before `from`.
pub fn yoy_growth_in_range(
    series: &[Point],
    lag: usize,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Vec<GrowthPoint> {
    yoy_growth(series, lag)
        .into_iter()
        .filter(|g| in_range(&g.period, from, to))
        .collect()
}

/// Share of each member in its period's total, in percent. `None` when the
/// period total is zero.
pub fn shares_by_period(
    table: &BTreeMap<PeriodKey, BTreeMap<String, f64>>,
) -> BTreeMap<PeriodKey, BTreeMap<String, Option<f64>>> {
    table
        .iter()
        .map(|(period, members)| {
            let total: f64 = members.values().sum();
            let shares = members
                .iter()
                .map(|(label, value)| (label.clone(), share(*value, total)))
                .collect();
            (*period, shares)
        })
        .collect()
}

/// Share of each series in the grand total over the whole window.
pub fn overall_shares(series: &BTreeMap<String, Vec<Point>>) -> BTreeMap<String, Option<f64>> {
    let sums: BTreeMap<&String, f64> = series
        .iter()
        .map(|(label, points)| (label, points.iter().map(|p| p.value).sum()))
        .collect();
    let total: f64 = sums.values().sum();
    sums.into_iter()
        .map(|(label, value)| (label.clone(), share(value, total)))
        .collect()
}

fn share(value: f64, total: f64) -> Option<f64> {
    (total != 0.0).then(|| value / total * 100.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PivotRow {
    pub label: String,
    pub cells: Vec<Option<f64>>,
}

/// Label × period matrix with a trailing column-sum row.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotTable {
    pub periods: Vec<PeriodKey>,
    pub rows: Vec<PivotRow>,
    pub total: PivotRow,
}

impl PivotTable {
    pub fn build(series: &BTreeMap<String, Vec<Point>>) -> Self {
        let periods: Vec<PeriodKey> = series
            .values()
            .flat_map(|points| points.iter().map(|p| p.period))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let rows: Vec<PivotRow> = series
            .iter()
            .map(|(label, points)| {
                let by_period: BTreeMap<PeriodKey, f64> =
                    points.iter().map(|p| (p.period, p.value)).collect();
                PivotRow {
                    label: label.clone(),
                    cells: periods.iter().map(|p| by_period.get(p).copied()).collect(),
                }
            })
            .collect();

        let total = PivotRow {
            label: TOTAL_LABEL.to_string(),
            cells: (0..periods.len())
                .map(|idx| Some(rows.iter().filter_map(|row| row.cells[idx]).sum()))
                .collect(),
        };

        Self {
            periods,
            rows,
            total,
        }
    }
}
