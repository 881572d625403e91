//! Timeperiod token arithmetic.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

use super::qualifier::TimeQualifier;
use crate::error::{Result, SchedulerError};

fn invalid(tp: &str) -> SchedulerError {
    SchedulerError::InvalidTimeperiod(tp.to_string())
}

fn field(tp: &str, range: std::ops::Range<usize>, default: u32) -> Result<u32> {
    match tp.get(range) {
        Some(s) => s.parse().map_err(|_| invalid(tp)),
        None => Ok(default),
    }
}

/// Parse a token of any supported length into its qualifier and period start
pub fn parse_timeperiod(tp: &str) -> Result<(TimeQualifier, NaiveDateTime)> {
    let qualifier = TimeQualifier::from_token_len(tp.len()).ok_or_else(|| invalid(tp))?;
    if !tp.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid(tp));
    }

    let year = field(tp, 0..4, 0)? as i32;
    let month = field(tp, 4..6, 1)?;
    let day = field(tp, 6..8, 1)?;
    let hour = field(tp, 8..10, 0)?;
    let minute = field(tp, 10..12, 0)?;
    let second = field(tp, 12..14, 0)?;

    let dt = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or_else(|| invalid(tp))?;
    Ok((qualifier, dt))
}

fn format_timeperiod(qualifier: TimeQualifier, dt: &NaiveDateTime) -> String {
    match qualifier {
        TimeQualifier::Yearly => format!("{:04}", dt.year()),
        TimeQualifier::Monthly => format!("{:04}{:02}", dt.year(), dt.month()),
        TimeQualifier::Daily => format!("{:04}{:02}{:02}", dt.year(), dt.month(), dt.day()),
        TimeQualifier::Hourly => format!("{:04}{:02}{:02}{:02}", dt.year(), dt.month(), dt.day(), dt.hour()),
        TimeQualifier::RealTime => format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}",
            dt.year(),
            dt.month(),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        ),
    }
}

/// Re-express `tp` at another granularity.
///
/// Casting to a coarser qualifier truncates; casting to a finer one yields
/// the first sub-period (`2020` cast to hourly is `2020010100`).
pub fn cast_to_time_qualifier(qualifier: TimeQualifier, tp: &str) -> Result<String> {
    let (_, dt) = parse_timeperiod(tp)?;
    Ok(format_timeperiod(qualifier, &dt))
}

/// Shift `tp` by `delta` periods of the given qualifier (negative deltas decrement)
pub fn increment_timeperiod(qualifier: TimeQualifier, tp: &str, delta: i64) -> Result<String> {
    let (_, dt) = parse_timeperiod(&cast_to_time_qualifier(qualifier, tp)?)?;

    let shifted = match qualifier {
        TimeQualifier::Yearly => shift_months(dt, delta.checked_mul(12).ok_or_else(|| invalid(tp))?),
        TimeQualifier::Monthly => shift_months(dt, delta),
        TimeQualifier::Daily => dt.checked_add_signed(Duration::days(delta)),
        TimeQualifier::Hourly => dt.checked_add_signed(Duration::hours(delta)),
        TimeQualifier::RealTime => dt.checked_add_signed(Duration::seconds(delta)),
    }
    .ok_or_else(|| invalid(tp))?;

    Ok(format_timeperiod(qualifier, &shifted))
}

fn shift_months(dt: NaiveDateTime, delta: i64) -> Option<NaiveDateTime> {
    let months = Months::new(u32::try_from(delta.unsigned_abs()).ok()?);
    if delta >= 0 {
        dt.checked_add_months(months)
    } else {
        dt.checked_sub_months(months)
    }
}

/// Number of `qualifier` periods from `from` to `to` (negative when `to` precedes `from`)
pub fn periods_between(qualifier: TimeQualifier, from: &str, to: &str) -> Result<i64> {
    let (_, a) = parse_timeperiod(&cast_to_time_qualifier(qualifier, from)?)?;
    let (_, b) = parse_timeperiod(&cast_to_time_qualifier(qualifier, to)?)?;

    let months = |dt: &NaiveDateTime| dt.year() as i64 * 12 + dt.month0() as i64;
    Ok(match qualifier {
        TimeQualifier::Yearly => (b.year() - a.year()) as i64,
        TimeQualifier::Monthly => months(&b) - months(&a),
        TimeQualifier::Daily => (b - a).num_days(),
        TimeQualifier::Hourly => (b - a).num_hours(),
        TimeQualifier::RealTime => (b - a).num_seconds(),
    })
}

/// True when `tp` sits on a `grouping` boundary counted from `start`
pub fn is_grouping_aligned(qualifier: TimeQualifier, grouping: u32, start: &str, tp: &str) -> Result<bool> {
    if grouping <= 1 {
        return Ok(true);
    }
    let offset = periods_between(qualifier, start, tp)?;
    Ok(offset.rem_euclid(grouping as i64) == 0)
}

/// Start instant of a timeperiod
pub fn timeperiod_to_datetime(tp: &str) -> Result<DateTime<Utc>> {
    let (_, dt) = parse_timeperiod(tp)?;
    Ok(Utc.from_utc_datetime(&dt))
}

/// Timeperiod containing the given instant
pub fn actual_timeperiod_at(qualifier: TimeQualifier, now: DateTime<Utc>) -> String {
    format_timeperiod(qualifier, &now.naive_utc())
}

/// Timeperiod containing the current UTC instant
pub fn actual_timeperiod(qualifier: TimeQualifier) -> String {
    actual_timeperiod_at(qualifier, Utc::now())
}
