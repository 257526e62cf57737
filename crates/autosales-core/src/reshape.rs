//! Wide → long reshaping.

use std::collections::BTreeSet;

use crate::{Cadence, PeriodError, PeriodKey, SeriesKey, WideTable};

/// One fact of the long relation.
#[derive(Debug, Clone, PartialEq)]
pub struct LongRecord {
    pub period: PeriodKey,
    pub brand: String,
    pub model: String,
    /// Price label of the wide row this record came from.
    pub price: String,
    pub value: f64,
}

impl LongRecord {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(&self.brand, &self.model, &self.price)
    }
}

/// Long form of a [`WideTable`].
#[derive(Debug, Clone, PartialEq)]
pub struct LongRelation {
    pub cadence: Cadence,
    pub records: Vec<LongRecord>,
}

impl LongRelation {
    pub fn brands(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| r.brand.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Number of distinct wide rows behind the records.
    pub fn row_count(&self) -> usize {
        self.records
            .iter()
            .map(|r| (&r.brand, &r.model, &r.price))
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn period_bounds(&self) -> Option<(PeriodKey, PeriodKey)> {
        let first = self.records.iter().map(|r| r.period).min()?;
        let last = self.records.iter().map(|r| r.period).max()?;
        Some((first, last))
    }

    /// Every price label reported for a model, in sorted order.
    pub fn prices_of(&self, brand: &str, model: &str) -> Vec<&str> {
        self.records
            .iter()
            .filter(|r| r.brand == brand && r.model == model)
            .map(|r| r.price.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Unpivots every period column into one record per row, carrying the key
/// fields. Missing cells become `0`, so the result is a dense
/// row × period grid.
pub fn reshape(table: &WideTable) -> LongRelation {
    let mut records = Vec::with_capacity(table.len() * table.period_count());

    for (key, cells) in table.rows() {
        for period in table.periods() {
            records.push(LongRecord {
                period: *period,
                brand: key.brand.clone(),
                model: key.model.clone(),
                price: key.price.clone(),
                value: cells.get(period).copied().unwrap_or(0.0),
            });
        }
    }

    LongRelation {
        cadence: table.cadence(),
        records,
    }
}

/// Pivots a long relation back to wide form on (brand, model, price) and
/// period, summing duplicates.
pub fn pivot(relation: &LongRelation) -> Result<WideTable, PeriodError> {
    let mut table = WideTable::new(relation.cadence);
    for record in &relation.records {
        table.add_value(record.key(), record.period, record.value)?;
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn month(label: &str) -> PeriodKey {
        Cadence::Monthly.parse_label(label).unwrap()
    }

    fn sample() -> WideTable {
        let mut table = WideTable::new(Cadence::Monthly);
        let x = SeriesKey::new("BrandA", "ModelX", "100000");
        let y = SeriesKey::new("BrandA", "ModelY", "150000");
        let z = SeriesKey::new("BrandB", "ModelZ", "");
        for (key, label, value) in [
            (&x, "202401", 50.0),
            (&x, "202402", 60.0),
            (&y, "202401", 7.0),
            (&y, "202402", 9.0),
            (&z, "202401", 0.0),
            (&z, "202402", 12.0),
        ] {
            table.set_value(key.clone(), month(label), value).unwrap();
        }
        table
    }

    #[test]
    fn every_row_contributes_one_record_per_column() {
        let mut table = sample();
        table
            .set_value(SeriesKey::new("BrandC", "Solo", ""), month("202403"), 4.0)
            .unwrap();
        let long = reshape(&table);
        assert_eq!(long.records.len(), table.len() * table.period_count());
        let solo_jan = long
            .records
            .iter()
            .find(|r| r.model == "Solo" && r.period == month("202401"))
            .unwrap();
        assert_eq!(solo_jan.value, 0.0);
    }

    #[test]
    fn reshape_is_deterministic() {
        let table = sample();
        assert_eq!(reshape(&table), reshape(&table));
    }

    #[test]
    fn reshape_then_pivot_reproduces_cells() {
        let table = sample();
        let back = pivot(&reshape(&table)).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn price_change_keeps_separate_rows() {
        let mut table = WideTable::new(Cadence::Monthly);
        let old = SeriesKey::new("BrandA", "ModelX", "10万");
        let new = SeriesKey::new("BrandA", "ModelX", "12万");
        table.set_value(old.clone(), month("202401"), 50.0).unwrap();
        table.set_value(new.clone(), month("202402"), 65.0).unwrap();

        let long = reshape(&table);
        assert_eq!(long.row_count(), 2);
        assert_eq!(long.prices_of("BrandA", "ModelX"), vec!["10万", "12万"]);

        let back = pivot(&long).unwrap();
        assert_eq!(back.len(), 2);
        for key in [&old, &new] {
            for period in table.periods() {
                assert_eq!(back.value_or_zero(key, period), table.value_or_zero(key, period));
            }
        }
        assert_eq!(back.cell(&old, &month("202402")), Some(0.0));
    }

    #[test]
    fn relation_summary_helpers() {
        let long = reshape(&sample());
        assert_eq!(long.prices_of("BrandA", "ModelX"), vec!["100000"]);
        assert_eq!(long.row_count(), 3);
        assert_eq!(long.brands(), vec!["BrandA".to_string(), "BrandB".to_string()]);
        let (first, last) = long.period_bounds().unwrap();
        assert_eq!(first.label(), "202401");
        assert_eq!(last.label(), "202402");
    }
}
