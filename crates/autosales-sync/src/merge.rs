//! Folds freshly collected records into the cumulative wide table.

use std::collections::{BTreeSet, HashSet};

use autosales_adapters::BrandHarvest;
use autosales_core::{Cadence, PeriodError, SeriesKey, WideTable};
use serde::Serialize;

/// Resolution of one (row, period) cell during a merge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cell {
    Fresh(f64),
    Stale(f64),
    Missing,
}

impl Cell {
    pub fn resolve(fresh: Option<f64>, stale: Option<f64>) -> Self {
        match (fresh, stale) {
            (Some(v), _) => Cell::Fresh(v),
            (None, Some(v)) => Cell::Stale(v),
            (None, None) => Cell::Missing,
        }
    }

    pub fn value(self) -> Option<f64> {
        match self {
            Cell::Fresh(v) | Cell::Stale(v) => Some(v),
            Cell::Missing => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub fresh_rows: usize,
    pub prior_rows: usize,
    pub merged_rows: usize,
    /// Stale cells replaced by a different fresh value.
    pub overridden_cells: usize,
    /// Rows present only in the fresh table.
    pub new_rows: usize,
}

/// Sums every harvest into one wide table.
///
/// A row gets an explicit `0` for each period its brand fetched successfully
/// but in which the row did not show up. Skipped periods stay missing.
pub fn aggregate(cadence: Cadence, harvests: &[BrandHarvest]) -> Result<WideTable, PeriodError> {
    let mut table = WideTable::new(cadence);
    for harvest in harvests {
        let mut keys: BTreeSet<SeriesKey> = BTreeSet::new();
        for record in &harvest.records {
            keys.insert(record.key.clone());
            table.add_value(record.key.clone(), record.period, record.value)?;
        }
        for key in &keys {
            for period in &harvest.fetched_periods {
                table.fill_missing(key, *period, 0.0)?;
            }
        }
    }
    Ok(table)
}

/// Outer-joins `fresh` onto `prior` by key tuple. For every period in either
/// table, a fresh cell wins over a stale one; rows and columns found on only
/// one side carry through unchanged.
pub fn merge(
    prior: Option<&WideTable>,
    fresh: WideTable,
) -> Result<(WideTable, MergeStats), PeriodError> {
    let Some(prior) = prior else {
        let stats = MergeStats {
            fresh_rows: fresh.len(),
            prior_rows: 0,
            merged_rows: fresh.len(),
            overridden_cells: 0,
            new_rows: fresh.len(),
        };
        return Ok((fresh, stats));
    };

    let mut merged = WideTable::new(prior.cadence());
    for period in prior.periods().chain(fresh.periods()) {
        merged.add_period(*period)?;
    }

    let keys: BTreeSet<&SeriesKey> = prior.keys().chain(fresh.keys()).collect();
    let periods: Vec<_> = merged.periods().copied().collect();
    let mut overridden_cells = 0;
    let mut new_rows = 0;

    for key in keys {
        if !prior.contains_key(key) {
            new_rows += 1;
        }
        merged.insert_row(key.clone());
        for period in &periods {
            let stale = prior.cell(key, period);
            let cell = Cell::resolve(fresh.cell(key, period), stale);
            if let (Cell::Fresh(v), Some(old)) = (cell, stale) {
                if v != old {
                    overridden_cells += 1;
                }
            }
            if let Some(v) = cell.value() {
                merged.set_value(key.clone(), *period, v)?;
            }
        }
    }

    let stats = MergeStats {
        fresh_rows: fresh.len(),
        prior_rows: prior.len(),
        merged_rows: merged.len(),
        overridden_cells,
        new_rows,
    };
    Ok((merged, stats))
}

/// Brands that contributed at least one record.
pub fn harvested_brands(harvests: &[BrandHarvest]) -> HashSet<&str> {
    harvests
        .iter()
        .flat_map(|h| h.records.iter().map(|r| r.key.brand.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use autosales_adapters::{BrandConfig, SkippedPeriod};
    use autosales_core::{PeriodKey, SalesRecord};

    fn month(label: &str) -> PeriodKey {
        Cadence::Monthly.parse_label(label).unwrap()
    }

    fn x() -> SeriesKey {
        SeriesKey::new("BrandA", "ModelX", "100000")
    }

    fn table(cells: &[(SeriesKey, &str, f64)]) -> WideTable {
        let mut table = WideTable::new(Cadence::Monthly);
        for (key, label, value) in cells {
            table.set_value(key.clone(), month(label), *value).unwrap();
        }
        table
    }

    fn harvest(
        fetched: &[&str],
        skipped: &[&str],
        records: &[(SeriesKey, &str, f64)],
    ) -> BrandHarvest {
        BrandHarvest {
            brand: BrandConfig::new("BrandA", 1),
            fetched_periods: fetched.iter().map(|l| month(l)).collect(),
            skipped_periods: skipped
                .iter()
                .map(|l| SkippedPeriod {
                    period: l.to_string(),
                    reason: "http status 500".into(),
                })
                .collect(),
            records: records
                .iter()
                .map(|(key, label, value)| SalesRecord {
                    key: key.clone(),
                    period: month(label),
                    value: *value,
                })
                .collect(),
        }
    }

    #[test]
    fn aggregate_sums_and_zero_fills_fetched_periods() {
        let y = SeriesKey::new("BrandA", "ModelY", "");
        let h = harvest(
            &["202401", "202402"],
            &[],
            &[(x(), "202401", 30.0), (x(), "202401", 20.0), (y.clone(), "202402", 9.0)],
        );
        let agg = aggregate(Cadence::Monthly, &[h]).unwrap();
        assert_eq!(agg.cell(&x(), &month("202401")), Some(50.0));
        assert_eq!(agg.cell(&x(), &month("202402")), Some(0.0));
        assert_eq!(agg.cell(&y, &month("202401")), Some(0.0));
    }

    #[test]
    fn skipped_periods_keep_stale_values() {
        let prior = table(&[(x(), "202401", 50.0), (x(), "202402", 60.0)]);
        let h = harvest(&["202401"], &["202402"], &[(x(), "202401", 55.0)]);
        let fresh = aggregate(Cadence::Monthly, &[h]).unwrap();
        assert_eq!(fresh.cell(&x(), &month("202402")), None);

        let (merged, _) = merge(Some(&prior), fresh).unwrap();
        assert_eq!(merged.cell(&x(), &month("202401")), Some(55.0));
        assert_eq!(merged.cell(&x(), &month("202402")), Some(60.0));
    }

    #[test]
    fn merging_a_table_with_itself_is_a_no_op() {
        let t = table(&[
            (x(), "202401", 50.0),
            (x(), "202402", 60.0),
            (SeriesKey::new("BrandB", "ModelZ", ""), "202402", 3.0),
        ]);
        let (merged, stats) = merge(Some(&t), t.clone()).unwrap();
        assert_eq!(merged, t);
        assert_eq!(stats.overridden_cells, 0);
        assert_eq!(stats.new_rows, 0);
    }

    #[test]
    fn rows_absent_from_fresh_are_preserved() {
        let retired = SeriesKey::new("BrandB", "Discontinued", "9万");
        let prior = table(&[(x(), "202401", 50.0), (retired.clone(), "202401", 12.0)]);
        let fresh = table(&[(x(), "202402", 65.0)]);
        let (merged, stats) = merge(Some(&prior), fresh).unwrap();
        assert_eq!(merged.row(&retired).unwrap().len(), 1);
        assert_eq!(merged.cell(&retired, &month("202401")), Some(12.0));
        assert_eq!(merged.cell(&retired, &month("202402")), None);
        assert_eq!(stats.merged_rows, 2);
    }

    #[test]
    fn fresh_values_override_stale_ones() {
        let prior = table(&[(x(), "202402", 60.0)]);
        let fresh = table(&[(x(), "202402", 65.0)]);
        let (merged, stats) = merge(Some(&prior), fresh).unwrap();
        assert_eq!(merged.cell(&x(), &month("202402")), Some(65.0));
        assert_eq!(stats.overridden_cells, 1);
    }

    #[test]
    fn first_run_takes_the_aggregate() {
        let fresh = table(&[(x(), "202401", 1.0)]);
        let (merged, stats) = merge(None, fresh.clone()).unwrap();
        assert_eq!(merged, fresh);
        assert_eq!(stats.new_rows, 1);
    }

    #[test]
    fn monthly_update_scenario() {
        let prior = table(&[(x(), "202401", 50.0), (x(), "202402", 60.0)]);
        let h = harvest(
            &["202402", "202403"],
            &[],
            &[(x(), "202402", 65.0), (x(), "202403", 70.0)],
        );
        let fresh = aggregate(Cadence::Monthly, &[h]).unwrap();
        let (merged, stats) = merge(Some(&prior), fresh).unwrap();

        let labels: Vec<String> = merged.periods().map(|p| p.label()).collect();
        assert_eq!(labels, vec!["202401", "202402", "202403"]);
        let row: Vec<f64> = merged.row(&x()).unwrap().values().copied().collect();
        assert_eq!(row, vec![50.0, 65.0, 70.0]);
        assert_eq!(stats.overridden_cells, 1);
        assert_eq!(stats.merged_rows, 1);
    }

    #[test]
    fn mixed_cadences_are_rejected() {
        let prior = table(&[(x(), "202401", 1.0)]);
        let mut weekly = WideTable::new(Cadence::Weekly);
        weekly
            .set_value(x(), Cadence::Weekly.parse_label("2025-01-07").unwrap(), 2.0)
            .unwrap();
        assert!(merge(Some(&prior), weekly).is_err());
    }

    #[test]
    fn brands_seen_in_harvests() {
        let h = harvest(&["202401"], &[], &[(x(), "202401", 1.0)]);
        let brands = harvested_brands(std::slice::from_ref(&h));
        assert!(brands.contains("BrandA"));
    }
}
