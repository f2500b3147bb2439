//! Production accumulator.
//!
//! This is the only place production is derived from elapsed time and speed.
//! Every computation covers the interval since the record's last fold, using the
//! speed in effect for that interval. Totals are never rebuilt from the shift
//! start, which would rescale already-counted output whenever the speed changes.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MachineStatus, StatusChange};

const MILLIS_PER_MINUTE: f64 = 60_000.0;
// Absorbs binary representation error on exact unit boundaries.
const ROUNDING_SLACK: f64 = 1e-9;

/// Whole units produced over an interval and how far that output reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accrual {
    pub units: i64,
    /// New baseline for the next interval. Time not converted into whole
    /// units stays after this instant so slow machines still progress.
    pub consumed_until: DateTime<Utc>,
}

/// `floor(elapsed_minutes × speed)` with elapsed clamped to zero.
pub fn incremental_delta(last_update: DateTime<Utc>, now: DateTime<Utc>, speed: f64) -> i64 {
    accrue(last_update, now, speed).units
}

pub fn accrue(last_update: DateTime<Utc>, now: DateTime<Utc>, speed: f64) -> Accrual {
    let elapsed_ms = now.signed_duration_since(last_update).num_milliseconds();
    if elapsed_ms <= 0 {
        return Accrual {
            units: 0,
            consumed_until: last_update,
        };
    }
    if !speed.is_finite() || speed <= 0.0 {
        return Accrual {
            units: 0,
            consumed_until: now,
        };
    }

    let units = (elapsed_ms as f64 * speed / MILLIS_PER_MINUTE + ROUNDING_SLACK).floor() as i64;
    let consumed_ms = (units as f64 * MILLIS_PER_MINUTE / speed).ceil() as i64;

    Accrual {
        units,
        consumed_until: last_update + Duration::milliseconds(consumed_ms.min(elapsed_ms)),
    }
}

/// Whole downtime minutes booked over an interval and how far they reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DowntimeBooking {
    pub minutes: i64,
    /// Seconds short of a whole minute stay after this instant and are
    /// booked by the next interval.
    pub booked_until: DateTime<Utc>,
}

/// Downtime for time spent in `status` over `[from, until)`. Only stopped and
/// maintenance count; any other status books nothing.
pub fn book_downtime(
    status: MachineStatus,
    from: DateTime<Utc>,
    until: DateTime<Utc>,
) -> DowntimeBooking {
    let minutes = if status.is_downtime() {
        until.signed_duration_since(from).num_minutes().max(0)
    } else {
        0
    };
    DowntimeBooking {
        minutes,
        booked_until: from + Duration::minutes(minutes),
    }
}

/// Minutes spent in each status during a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusBreakdown {
    pub running: f64,
    pub idle: f64,
    pub stopped: f64,
    pub maintenance: f64,
}

impl StatusBreakdown {
    pub fn total(&self) -> f64 {
        self.running + self.idle + self.stopped + self.maintenance
    }

    fn add(&mut self, status: MachineStatus, minutes: f64) {
        match status {
            MachineStatus::Running => self.running += minutes,
            MachineStatus::Idle => self.idle += minutes,
            MachineStatus::Stopped => self.stopped += minutes,
            MachineStatus::Maintenance => self.maintenance += minutes,
        }
    }
}

/// Reconstructs per-status minutes for `[start, end)` from an ordered history.
///
/// `history` may include changes before the window; the latest of those sets
/// the status at `start`. Without any change inside the window the current
/// status is assumed to have held throughout.
pub fn windowed_status_breakdown(
    history: &[StatusChange],
    current_status: MachineStatus,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> StatusBreakdown {
    let mut breakdown = StatusBreakdown::default();
    if end <= start {
        return breakdown;
    }

    let mut ordered: Vec<&StatusChange> = history.iter().collect();
    ordered.sort_by_key(|change| change.at);

    let in_window: Vec<&StatusChange> = ordered
        .iter()
        .copied()
        .filter(|change| change.at >= start && change.at < end)
        .collect();

    if in_window.is_empty() {
        breakdown.add(current_status, minutes_between(start, end));
        return breakdown;
    }

    let mut status = ordered
        .iter()
        .rev()
        .find(|change| change.at < start)
        .map(|change| change.to)
        .or(in_window[0].from)
        .unwrap_or(MachineStatus::Idle);
    let mut cursor = start;

    for change in in_window {
        breakdown.add(status, minutes_between(cursor, change.at));
        status = change.to;
        cursor = change.at;
    }
    breakdown.add(status, minutes_between(cursor, end));

    breakdown
}

/// Window summary handed back to reporting collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub total_minutes: f64,
    pub running_minutes: f64,
    pub idle_minutes: f64,
    pub stopped_minutes: f64,
    pub maintenance_minutes: f64,
    /// Persisted shift total; never recomputed from time and speed.
    pub estimated_production: i64,
    pub efficiency: f64,
}

pub fn window_report(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    breakdown: StatusBreakdown,
    stored_total: i64,
) -> WindowReport {
    let total = breakdown.total();
    let efficiency = if total > 0.0 {
        breakdown.running / total * 100.0
    } else {
        0.0
    };

    WindowReport {
        start,
        end,
        total_minutes: total,
        running_minutes: breakdown.running,
        idle_minutes: breakdown.idle,
        stopped_minutes: breakdown.stopped,
        maintenance_minutes: breakdown.maintenance,
        estimated_production: stored_total,
        efficiency,
    }
}

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let ms = to.signed_duration_since(from).num_milliseconds().max(0);
    ms as f64 / MILLIS_PER_MINUTE
}
