use std::fmt;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Time bucket of a dataset. Fixed per dataset, never inferred per column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Monthly,
    Weekly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Monthly => "monthly",
            Cadence::Weekly => "weekly",
        }
    }

    /// Parses a column label in this cadence's format: `YYYYMM` for monthly,
    /// `YYYY-MM-DD` for weekly.
    pub fn parse_label(&self, label: &str) -> Result<PeriodKey, PeriodError> {
        let trimmed = label.trim();
        let bad = || PeriodError::BadLabel {
            label: label.to_string(),
            cadence: *self,
        };

        match self {
            Cadence::Monthly => {
                // spreadsheet round-trips turn 202401 into "202401.0"
                let digits = match trimmed.split_once('.') {
                    Some((int, frac)) if frac.chars().all(|c| c == '0') => int,
                    Some(_) => return Err(bad()),
                    None => trimmed,
                };
                if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
                    return Err(bad());
                }
                let year: i32 = digits[..4].parse().map_err(|_| bad())?;
                let month: u32 = digits[4..].parse().map_err(|_| bad())?;
                PeriodKey::month(year, month).ok_or_else(bad)
            }
            Cadence::Weekly => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .or_else(|_| {
                    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S").map(|dt| dt.date())
                })
                .map(PeriodKey::week)
                .map_err(|_| bad()),
        }
    }

    /// Every period a collection run should request, starting at `first`.
    ///
    /// Monthly runs stop at the last complete month before `today`. Weekly
    /// runs are anchored on Tuesdays (the weekly source's week-start) and
    /// include every Tuesday up to and including `today`.
    pub fn periods_until(&self, first: NaiveDate, today: NaiveDate) -> Vec<PeriodKey> {
        let mut out = Vec::new();
        match self {
            Cadence::Monthly => {
                let Some(this_month) = today.with_day(1) else {
                    return out;
                };
                let last_complete = this_month - Duration::days(1);
                let mut cur = PeriodKey::new(Cadence::Monthly, first);
                let last = PeriodKey::new(Cadence::Monthly, last_complete);
                while cur <= last {
                    out.push(cur);
                    cur = cur.next_month();
                }
            }
            Cadence::Weekly => {
                let mut cur = first;
                while cur.weekday() != Weekday::Tue {
                    cur += Duration::days(1);
                }
                while cur <= today {
                    out.push(PeriodKey::week(cur));
                    cur += Duration::weeks(1);
                }
            }
        }
        out
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodError {
    #[error("`{label}` is not a valid {cadence} period label")]
    BadLabel { label: String, cadence: Cadence },
    #[error("period {period} is {found}, table is {expected}")]
    CadenceMismatch {
        period: String,
        expected: Cadence,
        found: Cadence,
    },
}

/// Chronological period identifier. Monthly keys are normalized to the first
/// day of the month so ordering is always by calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeriodKey {
    date: NaiveDate,
    cadence: Cadence,
}

impl PeriodKey {
    pub fn new(cadence: Cadence, date: NaiveDate) -> Self {
        let date = match cadence {
            Cadence::Monthly => date.with_day(1).unwrap_or(date),
            Cadence::Weekly => date,
        };
        Self { date, cadence }
    }

    pub fn month(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|date| Self {
            date,
            cadence: Cadence::Monthly,
        })
    }

    pub fn week(start: NaiveDate) -> Self {
        Self {
            date: start,
            cadence: Cadence::Weekly,
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    /// Canonical column label of this period.
    pub fn label(&self) -> String {
        match self.cadence {
            Cadence::Monthly => self.date.format("%Y%m").to_string(),
            Cadence::Weekly => self.date.format("%Y-%m-%d").to_string(),
        }
    }

    pub fn iso_week(&self) -> u32 {
        self.date.iso_week().week()
    }

    fn next_month(&self) -> Self {
        let (year, month) = if self.date.month() == 12 {
            (self.date.year() + 1, 1)
        } else {
            (self.date.year(), self.date.month() + 1)
        };
        Self {
            date: NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(self.date),
            cadence: self.cadence,
        }
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn monthly_labels_parse_and_render() {
        let key = Cadence::Monthly.parse_label("202402").unwrap();
        assert_eq!(key.date(), ymd(2024, 2, 1));
        assert_eq!(key.label(), "202402");
        assert_eq!(Cadence::Monthly.parse_label("202402.0").unwrap(), key);
    }

    #[test]
    fn labels_are_strict_per_cadence() {
        assert!(Cadence::Monthly.parse_label("2024-02-06").is_err());
        assert!(Cadence::Monthly.parse_label("202413").is_err());
        assert!(Cadence::Monthly.parse_label("202402.5").is_err());
        assert!(Cadence::Weekly.parse_label("202402").is_err());
        let week = Cadence::Weekly.parse_label("2025-01-07").unwrap();
        assert_eq!(week.label(), "2025-01-07");
        assert_eq!(week.iso_week(), 2);
        assert_eq!(
            Cadence::Weekly.parse_label("2025-01-07 00:00:00").unwrap(),
            week
        );
    }

    #[test]
    fn ordering_is_chronological() {
        let a = Cadence::Monthly.parse_label("202312").unwrap();
        let b = Cadence::Monthly.parse_label("202401").unwrap();
        assert!(a < b);
        let w1 = Cadence::Weekly.parse_label("2024-12-31").unwrap();
        let w2 = Cadence::Weekly.parse_label("2025-01-07").unwrap();
        assert!(w1 < w2);
    }

    #[test]
    fn monthly_periods_stop_before_current_month() {
        let periods = Cadence::Monthly.periods_until(ymd(2023, 11, 15), ymd(2024, 3, 10));
        let labels: Vec<_> = periods.iter().map(PeriodKey::label).collect();
        assert_eq!(labels, vec!["202311", "202312", "202401", "202402"]);
    }

    #[test]
    fn weekly_periods_are_tuesdays() {
        let periods = Cadence::Weekly.periods_until(ymd(2025, 1, 1), ymd(2025, 1, 21));
        let labels: Vec<_> = periods.iter().map(PeriodKey::label).collect();
        assert_eq!(labels, vec!["2025-01-07", "2025-01-14", "2025-01-21"]);
    }
}
