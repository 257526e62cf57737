//! Core sales data model: periods, key tuples, wide tables, long records and
//! the pure derivations computed over them.

pub mod analytics;
pub mod period;
pub mod reshape;
pub mod table;

use serde::{Deserialize, Serialize};

pub use period::{Cadence, PeriodError, PeriodKey};
pub use reshape::{pivot, reshape, LongRecord, LongRelation};
pub use table::WideTable;

pub const CRATE_NAME: &str = "autosales-core";

/// Identity of one wide-table row: brand (entity), model (sub-key) and the
/// price label reported by the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub brand: String,
    pub model: String,
    pub price: String,
}

impl SeriesKey {
    pub fn new(
        brand: impl Into<String>,
        model: impl Into<String>,
        price: impl Into<String>,
    ) -> Self {
        Self {
            brand: brand.into(),
            model: model.into(),
            price: price.into(),
        }
    }
}

/// A single normalized sales figure extracted from a ranking response.
#[derive(Debug, Clone, PartialEq)]
pub struct SalesRecord {
    pub key: SeriesKey,
    pub period: PeriodKey,
    pub value: f64,
}
