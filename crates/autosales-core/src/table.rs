use std::collections::{BTreeMap, BTreeSet};

use crate::{Cadence, PeriodError, PeriodKey, SalesRecord, SeriesKey};

/// Cumulative sales table: one row per [`SeriesKey`], one cell per period.
///
/// `periods` is the column set. A period missing from a row's cell map is a
/// missing cell; consumers treat it as zero. Columns always iterate in
/// chronological order.
#[derive(Debug, Clone, PartialEq)]
pub struct WideTable {
    cadence: Cadence,
    periods: BTreeSet<PeriodKey>,
    rows: BTreeMap<SeriesKey, BTreeMap<PeriodKey, f64>>,
}

impl WideTable {
    pub fn new(cadence: Cadence) -> Self {
        Self {
            cadence,
            periods: BTreeSet::new(),
            rows: BTreeMap::new(),
        }
    }

    /// Builds a table from raw records, summing duplicate (key, period) pairs.
    pub fn from_records(
        cadence: Cadence,
        records: impl IntoIterator<Item = SalesRecord>,
    ) -> Result<Self, PeriodError> {
        let mut table = Self::new(cadence);
        for record in records {
            table.add_value(record.key, record.period, record.value)?;
        }
        Ok(table)
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn periods(&self) -> impl DoubleEndedIterator<Item = &PeriodKey> + '_ {
        self.periods.iter()
    }

    pub fn period_count(&self) -> usize {
        self.periods.len()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &SeriesKey> + '_ {
        self.rows.keys()
    }

    pub fn rows(&self) -> impl Iterator<Item = (&SeriesKey, &BTreeMap<PeriodKey, f64>)> + '_ {
        self.rows.iter()
    }

    pub fn row(&self, key: &SeriesKey) -> Option<&BTreeMap<PeriodKey, f64>> {
        self.rows.get(key)
    }

    pub fn contains_key(&self, key: &SeriesKey) -> bool {
        self.rows.contains_key(key)
    }

    pub fn cell(&self, key: &SeriesKey, period: &PeriodKey) -> Option<f64> {
        self.rows.get(key).and_then(|cells| cells.get(period)).copied()
    }

    pub fn value_or_zero(&self, key: &SeriesKey, period: &PeriodKey) -> f64 {
        self.cell(key, period).unwrap_or(0.0)
    }

    /// Registers a column without touching any row.
    pub fn add_period(&mut self, period: PeriodKey) -> Result<(), PeriodError> {
        self.check(&period)?;
        self.periods.insert(period);
        Ok(())
    }

    /// Registers a row with no cells.
    pub fn insert_row(&mut self, key: SeriesKey) {
        self.rows.entry(key).or_default();
    }

    /// Adds `value` to the cell, creating row and column as needed.
    pub fn add_value(
        &mut self,
        key: SeriesKey,
        period: PeriodKey,
        value: f64,
    ) -> Result<(), PeriodError> {
        self.add_period(period)?;
        *self.rows.entry(key).or_default().entry(period).or_insert(0.0) += value;
        Ok(())
    }

    /// Overwrites the cell, creating row and column as needed.
    pub fn set_value(
        &mut self,
        key: SeriesKey,
        period: PeriodKey,
        value: f64,
    ) -> Result<(), PeriodError> {
        self.add_period(period)?;
        self.rows.entry(key).or_default().insert(period, value);
        Ok(())
    }

    /// Sets the cell only when it is currently missing.
    pub fn fill_missing(
        &mut self,
        key: &SeriesKey,
        period: PeriodKey,
        value: f64,
    ) -> Result<(), PeriodError> {
        self.add_period(period)?;
        if let Some(cells) = self.rows.get_mut(key) {
            cells.entry(period).or_insert(value);
        }
        Ok(())
    }

    fn check(&self, period: &PeriodKey) -> Result<(), PeriodError> {
        if period.cadence() != self.cadence {
            return Err(PeriodError::CadenceMismatch {
                period: period.label(),
                expected: self.cadence,
                found: period.cadence(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn month(label: &str) -> PeriodKey {
        Cadence::Monthly.parse_label(label).unwrap()
    }

    #[test]
    fn duplicate_records_are_summed() {
        let key = SeriesKey::new("BrandA", "ModelX", "10.98万");
        let records: Vec<SalesRecord> = [("202401", 30.0), ("202401", 20.0), ("202402", 5.0)]
            .into_iter()
            .map(|(label, value)| SalesRecord {
                key: key.clone(),
                period: month(label),
                value,
            })
            .collect();
        let table = WideTable::from_records(Cadence::Monthly, records).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.cell(&key, &month("202401")), Some(50.0));
        assert_eq!(table.cell(&key, &month("202402")), Some(5.0));
    }

    #[test]
    fn columns_iterate_chronologically() {
        let key = SeriesKey::new("BrandA", "ModelX", "");
        let mut table = WideTable::new(Cadence::Monthly);
        for label in ["202403", "202311", "202401"] {
            table.add_value(key.clone(), month(label), 1.0).unwrap();
        }
        let labels: Vec<_> = table.periods().map(PeriodKey::label).collect();
        assert_eq!(labels, vec!["202311", "202401", "202403"]);
    }

    #[test]
    fn rejects_foreign_cadence() {
        let mut table = WideTable::new(Cadence::Monthly);
        let week = PeriodKey::week(NaiveDate::from_ymd_opt(2025, 1, 7).unwrap());
        let err = table
            .add_value(SeriesKey::new("a", "b", "c"), week, 1.0)
            .unwrap_err();
        assert!(matches!(err, PeriodError::CadenceMismatch { .. }));
    }

    #[test]
    fn missing_cells_read_as_zero() {
        let a = SeriesKey::new("BrandA", "ModelX", "");
        let b = SeriesKey::new("BrandA", "ModelY", "");
        let mut table = WideTable::new(Cadence::Monthly);
        table.add_value(a.clone(), month("202401"), 3.0).unwrap();
        table.add_value(b.clone(), month("202402"), 4.0).unwrap();
        assert_eq!(table.cell(&a, &month("202402")), None);
        assert_eq!(table.value_or_zero(&a, &month("202402")), 0.0);
    }
}
