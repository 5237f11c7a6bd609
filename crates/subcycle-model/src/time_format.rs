//! Parse/format the locale-native date, time-of-day and timestamp strings the
//! sheet uses (spec.md §6): dates as `YYYY. M. D`, times as `HH:MM`,
//! pending-column timestamps as `YYYY. M. D HH:MM`.

use crate::ModelError;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

pub fn parse_local_date(s: &str) -> Result<NaiveDate, ModelError> {
    let (y, m, d) = split_date(s).ok_or_else(|| ModelError::BadDate(s.to_string()))?;
    NaiveDate::from_ymd_opt(y, m, d).ok_or_else(|| ModelError::BadDate(s.to_string()))
}

pub fn format_local_date(date: NaiveDate) -> String {
    use chrono::Datelike;
    format!("{}. {}. {}", date.year(), date.month(), date.day())
}

pub fn parse_local_time_of_day(s: &str) -> Result<NaiveTime, ModelError> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").map_err(|_| ModelError::BadTimeOfDay(s.to_string()))
}

pub fn format_local_time_of_day(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

pub fn parse_local_timestamp(s: &str) -> Result<NaiveDateTime, ModelError> {
    let s = s.trim();
    let (date_part, time_part) = s
        .rsplit_once(' ')
        .ok_or_else(|| ModelError::BadTimestamp(s.to_string()))?;
    let date = parse_local_date(date_part).map_err(|_| ModelError::BadTimestamp(s.to_string()))?;
    let time =
        parse_local_time_of_day(time_part).map_err(|_| ModelError::BadTimestamp(s.to_string()))?;
    Ok(NaiveDateTime::new(date, time))
}

pub fn format_local_timestamp(ts: NaiveDateTime) -> String {
    format!(
        "{} {}",
        format_local_date(ts.date()),
        format_local_time_of_day(ts.time())
    )
}

/// Split `"YYYY. M. D"` (whitespace around dots tolerated) into its components.
fn split_date(s: &str) -> Option<(i32, u32, u32)> {
    let mut parts = s.trim().split('.').map(str::trim);
    let y: i32 = parts.next()?.parse().ok()?;
    let m: u32 = parts.next()?.parse().ok()?;
    let d: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((y, m, d))
}
