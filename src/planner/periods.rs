//! Fixed-period calendar arithmetic
//!
//! Period identifiers follow the upstream conventions: `2024` (yearly),
//! `202401` (monthly), `20240115` (daily), `2024Q1`, `2024S2`, `2024W5`
//! (ISO week, Monday-based). Expansion intersects a configured period type
//! with the overall interval covered by a request's period selection:
//! every fixed period of the type whose interval is fully engulfed by the
//! request interval is produced, in ascending order.

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PeriodError {
    #[error("unrecognized period identifier: {0}")]
    Unrecognized(String),

    #[error("period identifier {0} is out of calendar range")]
    OutOfRange(String),

    #[error("no periods supplied")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeriodType {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    SixMonthly,
    Yearly,
}

/// A concrete fixed period with an inclusive date interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub id: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

/// Parse a period identifier into its interval.
pub fn parse_period(id: &str) -> Result<Period, PeriodError> {
    let bad = || PeriodError::Unrecognized(id.to_string());
    let out_of_range = || PeriodError::OutOfRange(id.to_string());

    if let Some((year_part, rest)) = split_marker(id, 'Q') {
        let year: i32 = year_part.parse().map_err(|_| bad())?;
        let quarter: u32 = rest.parse().map_err(|_| bad())?;
        if !(1..=4).contains(&quarter) {
            return Err(bad());
        }
        let month = (quarter - 1) * 3 + 1;
        let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(out_of_range)?;
        return Ok(Period {
            id: id.to_string(),
            start,
            end: month_end(year, month + 2).ok_or_else(out_of_range)?,
        });
    }

    if let Some((year_part, rest)) = split_marker(id, 'S') {
        let year: i32 = year_part.parse().map_err(|_| bad())?;
        let half: u32 = rest.parse().map_err(|_| bad())?;
        if !(1..=2).contains(&half) {
            return Err(bad());
        }
        let month = (half - 1) * 6 + 1;
        let start = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(out_of_range)?;
        return Ok(Period {
            id: id.to_string(),
            start,
            end: month_end(year, month + 5).ok_or_else(out_of_range)?,
        });
    }

    if let Some((year_part, rest)) = split_marker(id, 'W') {
        let year: i32 = year_part.parse().map_err(|_| bad())?;
        let week: u32 = rest.parse().map_err(|_| bad())?;
        let start = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon).ok_or_else(bad)?;
        let end = start.checked_add_days(chrono::Days::new(6)).ok_or_else(out_of_range)?;
        return Ok(Period {
            id: id.to_string(),
            start,
            end,
        });
    }

    if !id.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad());
    }

    match id.len() {
        4 => {
            let year: i32 = id.parse().map_err(|_| bad())?;
            Ok(Period {
                id: id.to_string(),
                start: NaiveDate::from_ymd_opt(year, 1, 1).ok_or_else(out_of_range)?,
                end: NaiveDate::from_ymd_opt(year, 12, 31).ok_or_else(out_of_range)?,
            })
        }
        6 => {
            let year: i32 = id[..4].parse().map_err(|_| bad())?;
            let month: u32 = id[4..].parse().map_err(|_| bad())?;
            Ok(Period {
                id: id.to_string(),
                start: NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(bad)?,
                end: month_end(year, month).ok_or_else(bad)?,
            })
        }
        8 => {
            let year: i32 = id[..4].parse().map_err(|_| bad())?;
            let month: u32 = id[4..6].parse().map_err(|_| bad())?;
            let day: u32 = id[6..].parse().map_err(|_| bad())?;
            let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(bad)?;
            Ok(Period {
                id: id.to_string(),
                start: date,
                end: date,
            })
        }
        _ => Err(bad()),
    }
}

/// Expand a period selection into the identifiers of all `period_type`
/// periods strictly engulfed by the selection's overall interval.
pub fn expand(period_type: PeriodType, requested: &[String]) -> Result<Vec<String>, PeriodError> {
    if requested.is_empty() {
        return Err(PeriodError::Empty);
    }

    let mut start: Option<NaiveDate> = None;
    let mut end: Option<NaiveDate> = None;
    for id in requested {
        let period = parse_period(id)?;
        start = Some(start.map_or(period.start, |s| s.min(period.start)));
        end = Some(end.map_or(period.end, |e| e.max(period.end)));
    }

    let (from, to) = match (start, end) {
        (Some(from), Some(to)) => (from, to),
        _ => return Err(PeriodError::Empty),
    };

    Ok(periods_within(period_type, from, to)
        .into_iter()
        .map(|period| period.id)
        .collect())
}

/// All periods of `period_type` with `start >= from` and `end <= to`.
pub fn periods_within(period_type: PeriodType, from: NaiveDate, to: NaiveDate) -> Vec<Period> {
    let mut periods = Vec::new();
    let mut cursor = match first_start_on_or_after(period_type, from) {
        Some(date) => date,
        None => return periods,
    };

    loop {
        let period = match period_at(period_type, cursor) {
            Some(period) => period,
            None => break,
        };
        if period.end > to {
            break;
        }
        cursor = match period.end.checked_add_days(chrono::Days::new(1)) {
            Some(next) => next,
            None => {
                periods.push(period);
                break;
            }
        };
        periods.push(period);
    }

    periods
}

fn split_marker(id: &str, marker: char) -> Option<(&str, &str)> {
    let idx = id.find(marker)?;
    if idx != 4 {
        return None;
    }
    Some((&id[..idx], &id[idx + 1..]))
}

fn month_end(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month >= 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

/// Start date of the period of `period_type` containing or following `from`.
fn first_start_on_or_after(period_type: PeriodType, from: NaiveDate) -> Option<NaiveDate> {
    match period_type {
        PeriodType::Daily => Some(from),
        PeriodType::Weekly => {
            let offset = from.weekday().num_days_from_monday();
            if offset == 0 {
                Some(from)
            } else {
                from.checked_add_days(chrono::Days::new((7 - offset) as u64))
            }
        }
        PeriodType::Monthly => {
            if from.day() == 1 {
                Some(from)
            } else {
                month_end(from.year(), from.month())?.checked_add_days(chrono::Days::new(1))
            }
        }
        PeriodType::Quarterly => {
            align_to_month_multiple(from, 3)
        }
        PeriodType::SixMonthly => {
            align_to_month_multiple(from, 6)
        }
        PeriodType::Yearly => {
            if from.month() == 1 && from.day() == 1 {
                Some(from)
            } else {
                NaiveDate::from_ymd_opt(from.year() + 1, 1, 1)
            }
        }
    }
}

/// First day of the next month whose zero-based index is a multiple of
/// `step`, at or after `from`.
fn align_to_month_multiple(from: NaiveDate, step: u32) -> Option<NaiveDate> {
    let mut year = from.year();
    let mut month = from.month();
    if from.day() > 1 || (month - 1) % step != 0 {
        let aligned = ((month - 1) / step + 1) * step + 1;
        if aligned > 12 {
            year += 1;
            month = aligned - 12;
        } else {
            month = aligned;
        }
    }
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Build the period of `period_type` starting exactly at `start`.
fn period_at(period_type: PeriodType, start: NaiveDate) -> Option<Period> {
    let year = start.year();
    let month = start.month();
    match period_type {
        PeriodType::Daily => Some(Period {
            id: format!("{year}{month:02}{:02}", start.day()),
            start,
            end: start,
        }),
        PeriodType::Weekly => {
            let iso = start.iso_week();
            Some(Period {
                id: format!("{}W{}", iso.year(), iso.week()),
                start,
                end: start.checked_add_days(chrono::Days::new(6))?,
            })
        }
        PeriodType::Monthly => Some(Period {
            id: format!("{year}{month:02}"),
            start,
            end: month_end(year, month)?,
        }),
        PeriodType::Quarterly => {
            let quarter = (month - 1) / 3 + 1;
            Some(Period {
                id: format!("{year}Q{quarter}"),
                start,
                end: month_end(year, month + 2)?,
            })
        }
        PeriodType::SixMonthly => {
            let half = (month - 1) / 6 + 1;
            Some(Period {
                id: format!("{year}S{half}"),
                start,
                end: month_end(year, month + 5)?,
            })
        }
        PeriodType::Yearly => Some(Period {
            id: format!("{year}"),
            start,
            end: NaiveDate::from_ymd_opt(year, 12, 31)?,
        }),
    }
}
