//! Shift clock: maps instants to the two-shift day/night calendar.
//!
//! Boundaries are wall-clock times in the plant's fixed UTC offset. A DAY shift
//! covers `[day_start, night_start)` and a NIGHT shift covers
//! `[night_start, next day's day_start)`, so every instant belongs to exactly
//! one window. A NIGHT window is dated by the calendar day it starts on.

use chrono::{
    DateTime, Days, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShiftError};
use crate::types::ShiftType;

pub const DEFAULT_DAY_START: &str = "07:00";
pub const DEFAULT_NIGHT_START: &str = "19:00";

const MAX_OFFSET_MINUTES: i32 = 18 * 60;

/// One concrete shift window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShiftWindow {
    pub shift_type: ShiftType,
    pub shift_date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ShiftWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftClock {
    day_start: NaiveTime,
    night_start: NaiveTime,
    offset: FixedOffset,
}

impl Default for ShiftClock {
    fn default() -> Self {
        Self {
            day_start: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or(NaiveTime::MIN),
            night_start: NaiveTime::from_hms_opt(19, 0, 0).unwrap_or(NaiveTime::MIN),
            offset: Utc.fix(),
        }
    }
}

impl ShiftClock {
    /// Builds a clock from `HH:MM` boundary strings and a UTC offset in minutes.
    pub fn new(day_start: &str, night_start: &str, utc_offset_minutes: i32) -> Result<Self> {
        let day_start = parse_boundary(day_start)?;
        let night_start = parse_boundary(night_start)?;
        if day_start >= night_start {
            return Err(ShiftError::Config(format!(
                "day shift start {} must be before night shift start {}",
                day_start, night_start
            )));
        }
        if utc_offset_minutes.abs() > MAX_OFFSET_MINUTES {
            return Err(ShiftError::Config(format!(
                "utc offset {} minutes is out of range",
                utc_offset_minutes
            )));
        }
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
            ShiftError::Config(format!("invalid utc offset {}", utc_offset_minutes))
        })?;

        Ok(Self {
            day_start,
            night_start,
            offset,
        })
    }

    pub fn day_start(&self) -> NaiveTime {
        self.day_start
    }

    pub fn night_start(&self) -> NaiveTime {
        self.night_start
    }

    pub fn classify(&self, at: DateTime<Utc>) -> ShiftType {
        let time = self.local(at).time();
        if time >= self.day_start && time < self.night_start {
            ShiftType::Day
        } else {
            ShiftType::Night
        }
    }

    /// Theoretical `[start, end)` instants of a shift starting on `date`.
    pub fn bounds(&self, date: NaiveDate, shift_type: ShiftType) -> (DateTime<Utc>, DateTime<Utc>) {
        match shift_type {
            ShiftType::Day => (
                self.to_utc(date.and_time(self.day_start)),
                self.to_utc(date.and_time(self.night_start)),
            ),
            ShiftType::Night => (
                self.to_utc(date.and_time(self.night_start)),
                self.to_utc((date + Days::new(1)).and_time(self.day_start)),
            ),
        }
    }

    pub fn window(&self, at: DateTime<Utc>) -> ShiftWindow {
        let local = self.local(at);
        let shift_type = self.classify(at);
        let shift_date = match shift_type {
            ShiftType::Day => local.date(),
            // Past midnight the night shift still belongs to yesterday's window.
            ShiftType::Night if local.time() < self.day_start => local.date() - Days::new(1),
            ShiftType::Night => local.date(),
        };
        let (start, end) = self.bounds(shift_date, shift_type);
        ShiftWindow {
            shift_type,
            shift_date,
            start,
            end,
        }
    }

    /// First shift boundary strictly after `at`.
    pub fn next_boundary(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        self.window(at).end
    }

    pub fn shift_minutes(&self, shift_type: ShiftType) -> i64 {
        let day = (self.night_start - self.day_start).num_minutes();
        match shift_type {
            ShiftType::Day => day,
            ShiftType::Night => 24 * 60 - day,
        }
    }

    fn local(&self, at: DateTime<Utc>) -> NaiveDateTime {
        at.with_timezone(&self.offset).naive_local()
    }

    fn to_utc(&self, local: NaiveDateTime) -> DateTime<Utc> {
        let utc = local - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        DateTime::from_naive_utc_and_offset(utc, Utc)
    }
}

/// Input-boundary check for stored or received timestamps.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| ShiftError::clock(value, err.to_string()))
}

fn parse_boundary(value: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|err| ShiftError::Config(format!("invalid shift boundary {:?}: {}", value, err)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, second)
            .single()
            .unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    #[test]
    fn classifies_around_boundaries() {
        let clock = ShiftClock::default();
        assert_eq!(clock.classify(at(2, 6, 59, 59)), ShiftType::Night);
        assert_eq!(clock.classify(at(2, 7, 0, 0)), ShiftType::Day);
        assert_eq!(clock.classify(at(2, 18, 59, 59)), ShiftType::Day);
        assert_eq!(clock.classify(at(2, 19, 0, 0)), ShiftType::Night);
        assert_eq!(clock.classify(at(2, 0, 0, 0)), ShiftType::Night);
    }

    #[test]
    fn night_window_after_midnight_belongs_to_previous_date() {
        let clock = ShiftClock::default();
        let window = clock.window(at(3, 2, 30, 0));
        assert_eq!(window.shift_type, ShiftType::Night);
        assert_eq!(window.shift_date, date(2));
        assert_eq!(window.start, at(2, 19, 0, 0));
        assert_eq!(window.end, at(3, 7, 0, 0));
    }

    #[test]
    fn night_bounds_end_on_following_date() {
        let clock = ShiftClock::default();
        let (start, end) = clock.bounds(date(2), ShiftType::Night);
        assert_eq!(start, at(2, 19, 0, 0));
        assert_eq!(end, at(3, 7, 0, 0));
        let (start, end) = clock.bounds(date(2), ShiftType::Day);
        assert_eq!(start, at(2, 7, 0, 0));
        assert_eq!(end, at(2, 19, 0, 0));
    }

    #[test]
    fn windows_cover_two_days_without_gaps_or_overlap() {
        let clock = ShiftClock::default();
        let mut cursor = at(2, 0, 0, 0);
        let stop = at(4, 0, 0, 0);
        let mut previous: Option<ShiftWindow> = None;

        while cursor < stop {
            let window = clock.window(cursor);
            assert!(window.contains(cursor), "window must contain {}", cursor);
            assert_eq!(window.shift_type, clock.classify(cursor));
            if let Some(prev) = previous {
                if prev != window {
                    assert_eq!(prev.end, window.start, "gap or overlap at {}", cursor);
                    assert_ne!(prev.shift_type, window.shift_type);
                }
            }
            previous = Some(window);
            cursor += Duration::minutes(1);
        }
    }

    #[test]
    fn classification_is_deterministic() {
        let clock = ShiftClock::default();
        let instant = at(2, 12, 34, 56);
        assert_eq!(clock.window(instant), clock.window(instant));
    }

    #[test]
    fn next_boundary_is_strictly_after() {
        let clock = ShiftClock::default();
        assert_eq!(clock.next_boundary(at(2, 7, 0, 0)), at(2, 19, 0, 0));
        assert_eq!(clock.next_boundary(at(2, 18, 59, 59)), at(2, 19, 0, 0));
        assert_eq!(clock.next_boundary(at(2, 23, 0, 0)), at(3, 7, 0, 0));
    }

    #[test]
    fn plant_offset_shifts_boundaries() {
        // UTC+02:00: local 07:00 is 05:00 UTC.
        let clock = ShiftClock::new("07:00", "19:00", 120).unwrap();
        assert_eq!(clock.classify(at(2, 4, 59, 0)), ShiftType::Night);
        assert_eq!(clock.classify(at(2, 5, 0, 0)), ShiftType::Day);
        let window = clock.window(at(2, 23, 30, 0));
        assert_eq!(window.shift_type, ShiftType::Night);
        assert_eq!(window.shift_date, date(2));
        assert_eq!(window.start, at(2, 17, 0, 0));
        assert_eq!(window.end, at(3, 5, 0, 0));
    }

    #[test]
    fn rejects_inverted_boundaries() {
        assert!(ShiftClock::new("19:00", "07:00", 0).is_err());
        assert!(ShiftClock::new("7am", "19:00", 0).is_err());
        assert!(ShiftClock::new("07:00", "19:00", 24 * 60).is_err());
    }

    #[test]
    fn shift_minutes_sum_to_a_day() {
        let clock = ShiftClock::new("06:00", "18:30", 0).unwrap();
        assert_eq!(
            clock.shift_minutes(ShiftType::Day) + clock.shift_minutes(ShiftType::Night),
            24 * 60
        );
        assert_eq!(clock.shift_minutes(ShiftType::Day), 750);
    }

    #[test]
    fn malformed_timestamps_are_clock_ambiguity() {
        let err = parse_timestamp("yesterday-ish").unwrap_err();
        assert_eq!(err.code(), "clock_ambiguity");
        assert_eq!(
            parse_timestamp("2026-03-02T07:00:00Z").unwrap(),
            at(2, 7, 0, 0)
        );
    }
}
