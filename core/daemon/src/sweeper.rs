//! Boundary sweeper: archives records whose shift window has ended even when
//! no further activity arrives for their (machine, operator) pair.

use chrono::{DateTime, Duration, Utc};
use shift_core::{Result, ShiftClock};
use std::time::Duration as StdDuration;
use tracing::{info, warn};

use crate::archival::{ArchivalService, SweepReport};

pub struct BoundarySweeper {
    archival: ArchivalService,
    clock: ShiftClock,
    grace: Duration,
    recheck: Duration,
}

impl BoundarySweeper {
    pub fn new(
        archival: ArchivalService,
        clock: ShiftClock,
        grace: StdDuration,
        recheck: StdDuration,
    ) -> Self {
        Self {
            archival,
            clock,
            grace: to_chrono(grace),
            recheck: to_chrono(recheck).max(Duration::seconds(1)),
        }
    }

    pub fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let report = self.archival.sweep_due(now)?;
        if !report.archived.is_empty() || !report.failures.is_empty() {
            info!(
                archived = report.archived.len(),
                failures = report.failures.len(),
                "Boundary sweep complete"
            );
        }
        for failure in &report.failures {
            warn!(
                shift_record_id = failure.record_id,
                key = %failure.key,
                code = %failure.code,
                "Record left open after sweep"
            );
        }
        Ok(report)
    }

    /// Next sweep: just after the upcoming boundary, but never later than one
    /// recheck interval from now.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let after_boundary = self.clock.next_boundary(now) + self.grace;
        after_boundary.min(now + self.recheck)
    }

    pub fn delay_until_next(&self, now: DateTime<Utc>) -> StdDuration {
        self.next_run_after(now)
            .signed_duration_since(now)
            .to_std()
            .unwrap_or(StdDuration::ZERO)
    }
}

fn to_chrono(value: StdDuration) -> Duration {
    Duration::from_std(value).unwrap_or_else(|_| Duration::seconds(i64::from(u32::MAX)))
}
