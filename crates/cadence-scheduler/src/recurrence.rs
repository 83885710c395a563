//! Recurrence expansion for template tasks.
//!
//! Each time an instance reaches a terminal state, the expander computes
//! the next concrete occurrence from the template's pattern: dates are
//! walked in the pattern's declared timezone, then normalized to UTC
//! instants, so a 09:00 schedule stays at 09:00 local across DST shifts.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;

use cadence_store::{RecurrenceFrequency, RecurrencePattern};

use crate::error::SchedulerError;

/// Turns a recurrence pattern into concrete occurrence instants.
pub struct RecurrenceExpander;

impl RecurrenceExpander {
    /// Validate the shape of a pattern at schedule time.
    pub fn validate(pattern: &RecurrencePattern) -> Result<(), SchedulerError> {
        Self::timezone(pattern)?;

        match pattern.frequency {
            RecurrenceFrequency::Weekly => {
                if pattern.days_of_week.is_empty() {
                    return Err(SchedulerError::Validation(
                        "weekly recurrence requires at least one day of week".into(),
                    ));
                }
                if pattern.days_of_week.iter().any(|d| !(1..=7).contains(d)) {
                    return Err(SchedulerError::Validation(
                        "days of week must be 1 (Monday) through 7 (Sunday)".into(),
                    ));
                }
            }
            RecurrenceFrequency::Monthly => match pattern.day_of_month {
                None => {
                    return Err(SchedulerError::Validation(
                        "monthly recurrence requires a day of month".into(),
                    ));
                }
                Some(day) if !(1..=31).contains(&day) => {
                    return Err(SchedulerError::Validation(
                        "day of month must be 1 through 31".into(),
                    ));
                }
                Some(_) => {}
            },
            RecurrenceFrequency::Once | RecurrenceFrequency::Daily => {}
        }

        if pattern.max_occurrences == Some(0) {
            return Err(SchedulerError::Validation(
                "max occurrences must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// The next occurrence strictly after `after`, or `None` once the
    /// pattern's end condition is reached. `occurrences_so_far` counts the
    /// template's own run plus every spawned instance.
    pub fn next_occurrence(
        pattern: &RecurrencePattern,
        after: DateTime<Utc>,
        occurrences_so_far: u32,
    ) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        if let Some(max) = pattern.max_occurrences
            && occurrences_so_far >= max
        {
            return Ok(None);
        }

        let tz = Self::timezone(pattern)?;
        let local_after = after.with_timezone(&tz).date_naive();

        let next_date = match pattern.frequency {
            RecurrenceFrequency::Once => return Ok(None),
            RecurrenceFrequency::Daily => local_after + Duration::days(1),
            RecurrenceFrequency::Weekly => {
                match Self::next_weekly_date(local_after, &pattern.days_of_week) {
                    Some(date) => date,
                    None => return Ok(None),
                }
            }
            RecurrenceFrequency::Monthly => {
                let day = pattern.day_of_month.ok_or_else(|| {
                    SchedulerError::Validation("monthly recurrence requires a day of month".into())
                })?;
                match Self::next_monthly_date(local_after, day) {
                    Some(date) => date,
                    None => return Ok(None),
                }
            }
        };

        let next = Self::resolve_local(&tz, next_date, pattern.time_of_day);

        if let Some(ends_at) = pattern.ends_at
            && next > ends_at
        {
            return Ok(None);
        }

        Ok(Some(next))
    }

    fn timezone(pattern: &RecurrencePattern) -> Result<Tz, SchedulerError> {
        pattern
            .timezone
            .parse::<Tz>()
            .map_err(|_| SchedulerError::InvalidTimezone(pattern.timezone.clone()))
    }

    /// First date after `from` whose ISO weekday is in `days` (1 = Monday).
    fn next_weekly_date(from: NaiveDate, days: &[u8]) -> Option<NaiveDate> {
        (1..=7)
            .map(|offset| from + Duration::days(offset))
            .find(|date| days.contains(&(date.weekday().number_from_monday() as u8)))
    }

    /// The `day`-th of the month after `from`, clamped to that month's
    /// last day.
    fn next_monthly_date(from: NaiveDate, day: u8) -> Option<NaiveDate> {
        let (year, month) = if from.month() == 12 {
            (from.year() + 1, 1)
        } else {
            (from.year(), from.month() + 1)
        };
        let clamped = u32::from(day).min(Self::last_day_of_month(year, month));
        NaiveDate::from_ymd_opt(year, month, clamped)
    }

    fn last_day_of_month(year: i32, month: u32) -> u32 {
        let first = NaiveDate::from_ymd_opt(year, month, 1);
        let next_first = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)
        };
        match (first, next_first) {
            (Some(first), Some(next_first)) => (next_first - first).num_days() as u32,
            _ => 28,
        }
    }

    /// Resolve a local wall-clock time to a UTC instant. Ambiguous local
    /// times (fall-back) take the earlier instant; nonexistent local times
    /// (spring-forward gap) roll forward an hour.
    fn resolve_local(tz: &Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = date.and_time(time);
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(dt) => dt.with_timezone(&Utc),
            LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
            LocalResult::None => {
                let shifted = naive + Duration::hours(1);
                match tz.from_local_datetime(&shifted) {
                    LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                        dt.with_timezone(&Utc)
                    }
                    LocalResult::None => Utc.from_utc_datetime(&naive),
                }
            }
        }
    }
}
