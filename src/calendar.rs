//! Wall-clock ↔ instant conversion for the single business timezone.
//!
//! Working-hours rules, weekdays and calendar dates are wall-clock values in
//! the configured timezone. Bookings are stored as UTC instants. Every
//! comparison between the two goes through [`LocalCalendar`], so both the
//! slot calculator and the admitter see the same local day.
//!
//! DST: an ambiguous local time (clocks going back) resolves to the earlier
//! instant; a skipped local time (clocks going forward) resolves to the first
//! valid instant after the gap.

use chrono::{
    DateTime, Datelike, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeDelta,
    TimeZone, Utc,
};
use chrono_tz::Tz;

use crate::model::{Ms, Span};

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
    #[error("invalid date (expected YYYY-MM-DD): {0}")]
    InvalidDate(String),
    #[error("invalid time of day (expected HH:MM): {0}")]
    InvalidTime(String),
    #[error("invalid instant: {0}")]
    InvalidInstant(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalCalendar {
    tz: Tz,
}

impl Default for LocalCalendar {
    fn default() -> Self {
        Self { tz: Tz::UTC }
    }
}

impl LocalCalendar {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn from_name(name: &str) -> Result<Self, CalendarError> {
        let tz: Tz = name
            .parse()
            .map_err(|_| CalendarError::InvalidTimezone(name.to_string()))?;
        Ok(Self { tz })
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// The instant at which the local wall clock reads `time` on `date`.
    pub fn at(&self, date: NaiveDate, time: NaiveTime) -> Ms {
        self.resolve(date.and_time(time)).timestamp_millis()
    }

    fn resolve(&self, naive: NaiveDateTime) -> DateTime<Tz> {
        match self.tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt,
            LocalResult::Ambiguous(earliest, _) => earliest,
            LocalResult::None => {
                // Gaps are at most a few hours; probe forward in quarter hours.
                for quarters in 1..=16 {
                    let probe = naive + TimeDelta::minutes(15 * quarters);
                    if let Some(dt) = self.tz.from_local_datetime(&probe).earliest() {
                        return dt;
                    }
                }
                self.tz.from_utc_datetime(&naive)
            }
        }
    }

    /// Like [`LocalCalendar::at`], but a time repeated by a fall-back
    /// transition resolves to its later occurrence.
    pub fn at_latest(&self, date: NaiveDate, time: NaiveTime) -> Ms {
        match self.tz.from_local_datetime(&date.and_time(time)) {
            LocalResult::Ambiguous(_, latest) => latest.timestamp_millis(),
            _ => self.at(date, time),
        }
    }

    /// `[local midnight, next local midnight)` for `date`.
    pub fn day_span(&self, date: NaiveDate) -> Result<Span, CalendarError> {
        let next = date
            .succ_opt()
            .ok_or_else(|| CalendarError::InvalidDate(date.to_string()))?;
        Ok(Span::new(
            self.at(date, NaiveTime::MIN),
            self.at(next, NaiveTime::MIN),
        ))
    }

    /// Local wall-clock reading of an instant.
    pub fn local(&self, t: Ms) -> Result<NaiveDateTime, CalendarError> {
        let utc = DateTime::<Utc>::from_timestamp_millis(t)
            .ok_or_else(|| CalendarError::InvalidInstant(t.to_string()))?;
        Ok(utc.with_timezone(&self.tz).naive_local())
    }
}

/// 0 = Sunday .. 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

pub fn parse_date(s: &str) -> Result<NaiveDate, CalendarError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| CalendarError::InvalidDate(s.to_string()))
}

/// Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_time(s: &str) -> Result<NaiveTime, CalendarError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|_| CalendarError::InvalidTime(s.to_string()))
}

/// Accepts RFC 3339 (`2026-03-02T09:00:00Z`) or raw Unix milliseconds.
pub fn parse_instant(s: &str) -> Result<Ms, CalendarError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| CalendarError::InvalidInstant(s.to_string()))
}

/// ISO-8601 UTC with millisecond precision, e.g. `2026-03-02T09:00:00.000Z`.
pub fn format_instant(t: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(t) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => t.to_string(),
    }
}
