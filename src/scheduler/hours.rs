use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::calendar::LocalCalendar;
use crate::limits::*;
use crate::model::*;

use super::SchedulingError;

/// Last representable instant of a local day, used when an interval runs past midnight.
fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap_or(NaiveTime::MIN)
}

pub(crate) fn validate_instant(t: Ms) -> Result<(), SchedulingError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(SchedulingError::InvalidRequest(format!(
            "timestamp {t} out of range"
        )));
    }
    Ok(())
}

/// The shift slots are offered in: earliest-starting non-break rule.
/// `rules` must be ordered by start time.
pub(crate) fn first_shift(rules: &[WorkingHoursRule]) -> Option<&WorkingHoursRule> {
    rules.iter().find(|r| !r.is_break)
}

/// Break rules projected onto `date` as UTC spans. A break inside a
/// repeated fall-back hour is projected onto both occurrences.
pub(crate) fn break_spans(
    rules: &[WorkingHoursRule],
    date: NaiveDate,
    calendar: &LocalCalendar,
) -> Vec<Span> {
    let mut spans = Vec::new();
    for r in rules.iter().filter(|r| r.is_break) {
        let early = Span::new(calendar.at(date, r.start_time), calendar.at(date, r.end_time));
        let late = Span::new(
            calendar.at_latest(date, r.start_time),
            calendar.at_latest(date, r.end_time),
        );
        for span in [early, late] {
            if span.start < span.end && !spans.contains(&span) {
                spans.push(span);
            }
        }
    }
    spans
}

/// Time-of-day admission check for a local interval. Order matters: a
/// weekday with no working rule is `StaffNotWorking` even if it has breaks,
/// and a break overlap wins over a containment failure. The interval must
/// fit the same shift slots are offered in. `rules` must be ordered by start time.
pub(crate) fn check_working_hours(
    rules: &[WorkingHoursRule],
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> Result<(), SchedulingError> {
    let Some(shift) = first_shift(rules) else {
        return Err(SchedulingError::StaffNotWorking);
    };

    let same_day = end.date() == start.date();
    let start_t = start.time();
    let end_t = if same_day { end.time() } else { end_of_day() };

    if rules
        .iter()
        .any(|r| r.is_break && r.overlaps_times(start_t, end_t))
    {
        return Err(SchedulingError::StaffOnBreak);
    }

    if !same_day || !shift.contains_times(start_t, end_t) {
        return Err(SchedulingError::OutsideWorkingHours);
    }
    Ok(())
}
