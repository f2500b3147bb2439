//! Shift record store: the only writer of shift record counters.
//!
//! All mutations run as read-modify-write against a versioned row. A write that
//! loses to a concurrent writer re-reads and re-applies its fold, up to the
//! configured retry budget, so concurrent ticks and manual updates never lose
//! increments.

use chrono::{DateTime, Utc};
use shift_core::{
    accrue, book_downtime, Detail, DetailValue, MachineState, MachineStatus, OpenOperation,
    Result, ShiftClock, ShiftDelta, ShiftError, ShiftRecord, DETAIL_LAST_UPDATE,
};
use std::cmp::{self, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;
use tracing::{debug, info};

use crate::archival::ArchivalService;
use crate::db::{Db, InsertOutcome, NewShiftRecord};

const RETRY_BACKOFF_STEP_MS: u64 = 5;
const RETRY_BACKOFF_MAX_MS: u64 = 50;

#[derive(Clone)]
pub struct ShiftStore {
    db: Arc<Db>,
    clock: ShiftClock,
    archival: ArchivalService,
    max_write_retries: u32,
}

impl ShiftStore {
    pub fn new(db: Arc<Db>, clock: ShiftClock, max_write_retries: u32) -> Self {
        let max_write_retries = max_write_retries.max(1);
        Self {
            archival: ArchivalService::new(db.clone(), max_write_retries),
            db,
            clock,
            max_write_retries,
        }
    }

    pub fn clock(&self) -> &ShiftClock {
        &self.clock
    }

    pub fn archival(&self) -> &ArchivalService {
        &self.archival
    }

    /// Open record for the pair in the window containing `now`, if any.
    pub fn current(
        &self,
        machine_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ShiftRecord>> {
        let window = self.clock.window(now);
        self.db
            .find_open_record(machine_id, operator_id, window.shift_date, window.shift_type)
    }

    pub fn open_records(&self, machine_id: &str, operator_id: &str) -> Result<Vec<ShiftRecord>> {
        self.db.list_open_records_for_pair(machine_id, operator_id)
    }

    /// Current record, created zeroed if the window has none yet. When two
    /// callers race to create, the loser returns the winner's record.
    pub fn get_or_create(
        &self,
        machine_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ShiftRecord> {
        let window = self.clock.window(now);

        for _ in 0..self.max_write_retries {
            if let Some(record) = self.db.find_open_record(
                machine_id,
                operator_id,
                window.shift_date,
                window.shift_type,
            )? {
                return Ok(record);
            }

            let speed = self
                .db
                .get_machine(machine_id)?
                .map(|machine| machine.speed)
                .unwrap_or(0.0);
            let target = target_production(speed, self.clock.shift_minutes(window.shift_type));

            // A record replacing one archived mid-window continues from where
            // the archived one stopped counting.
            let mut detail = Detail::new();
            if let Some(previous) = self.db.latest_archived_record(
                machine_id,
                operator_id,
                window.shift_date,
                window.shift_type,
            )? {
                let baseline = previous
                    .last_update()
                    .or(previous.archived_at)
                    .unwrap_or(previous.updated_at);
                detail.insert(
                    DETAIL_LAST_UPDATE.to_string(),
                    DetailValue::Text(baseline.to_rfc3339()),
                );
            }

            let new_record = NewShiftRecord {
                machine_id: machine_id.to_string(),
                operator_id: operator_id.to_string(),
                shift_date: window.shift_date,
                shift_type: window.shift_type,
                start_time: window.start,
                end_time: window.end,
                target_production: target,
                detail,
                created_at: now,
            };
            match self.db.insert_shift_record(&new_record)? {
                InsertOutcome::Inserted(record) => {
                    info!(
                        shift_record_id = record.id,
                        key = %record.key(),
                        target_production = target,
                        "Shift record created"
                    );
                    return Ok(record);
                }
                InsertOutcome::Conflict => {
                    debug!(machine_id, operator_id, "Lost shift record creation race");
                }
            }
        }

        // No record id exists yet for a creation that never settled.
        Err(ShiftError::StaleWrite {
            id: 0,
            attempts: self.max_write_retries,
        })
    }

    /// Adds `delta` to the current record, creating it if needed.
    pub fn upsert(
        &self,
        machine_id: &str,
        operator_id: &str,
        delta: &ShiftDelta,
        now: DateTime<Utc>,
    ) -> Result<ShiftRecord> {
        let (record, _) = self.apply(machine_id, operator_id, now, |_| Ok(delta.clone()))?;
        Ok(record)
    }

    /// Read-modify-write on the current record.
    ///
    /// `fold` computes the delta from the freshly read record and may run more
    /// than once if the write loses a version race. Returns the written record
    /// and the delta that was applied.
    pub fn apply<F>(
        &self,
        machine_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
        fold: F,
    ) -> Result<(ShiftRecord, ShiftDelta)>
    where
        F: FnMut(&ShiftRecord) -> Result<ShiftDelta>,
    {
        self.write_with_retry(now, || self.get_or_create(machine_id, operator_id, now), fold)
    }

    /// Read-modify-write on a specific open record, regardless of which
    /// window `now` falls in.
    pub fn apply_to<F>(
        &self,
        shift_record_id: i64,
        now: DateTime<Utc>,
        fold: F,
    ) -> Result<(ShiftRecord, ShiftDelta)>
    where
        F: FnMut(&ShiftRecord) -> Result<ShiftDelta>,
    {
        self.write_with_retry(
            now,
            || {
                let record = self
                    .db
                    .get_shift_record(shift_record_id)?
                    .ok_or(ShiftError::ShiftRecordNotFound(shift_record_id))?;
                if !record.is_open() {
                    return Err(ShiftError::AlreadyArchived {
                        id: shift_record_id,
                    });
                }
                Ok(record)
            },
            fold,
        )
    }

    fn write_with_retry<R, F>(
        &self,
        now: DateTime<Utc>,
        mut read: R,
        mut fold: F,
    ) -> Result<(ShiftRecord, ShiftDelta)>
    where
        R: FnMut() -> Result<ShiftRecord>,
        F: FnMut(&ShiftRecord) -> Result<ShiftDelta>,
    {
        let mut last_id = 0;

        for attempt in 1..=self.max_write_retries {
            let record = read()?;
            last_id = record.id;

            let delta = fold(&record)?;
            if delta.is_empty() {
                return Ok((record, delta));
            }

            let mut next = record.clone();
            next.apply_delta(&delta, now);
            next.version = record.version + 1;

            if self.db.update_shift_record(&next, record.version)? {
                return Ok((next, delta));
            }

            debug!(
                shift_record_id = record.id,
                attempt,
                version = record.version,
                "Shift record write lost a version race; retrying"
            );
            thread::sleep(retry_backoff(attempt));
        }

        Err(ShiftError::StaleWrite {
            id: last_id,
            attempts: self.max_write_retries,
        })
    }

    /// Folds what the machine did up to the end of each elapsed window into
    /// the pair's records still open for it: output while running, downtime
    /// while stopped or in maintenance. Returns the units added.
    ///
    /// Machine and operation are re-read on every attempt, so a fold never
    /// uses state older than the record it writes. Records archived
    /// concurrently are skipped.
    pub fn settle_elapsed(
        &self,
        machine_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let mut settled = 0;
        for record in self.open_records(machine_id, operator_id)? {
            if record.end_time > now {
                continue;
            }
            let result = self.apply_to(record.id, now, |current| {
                let machine = match self.db.get_machine(machine_id)? {
                    Some(machine) => machine,
                    None => return Ok(ShiftDelta::default()),
                };
                match self.db.open_operation(machine_id)? {
                    Some(operation) if operation.operator_id == operator_id => {
                        Ok(settlement_fold(current, &machine, &operation))
                    }
                    _ => Ok(ShiftDelta::default()),
                }
            });
            match result {
                Ok((record, delta)) => {
                    if !delta.is_empty() {
                        debug!(
                            shift_record_id = record.id,
                            production = delta.production,
                            downtime_minutes = delta.downtime_minutes,
                            "Settled elapsed shift record"
                        );
                    }
                    settled += delta.production;
                }
                Err(ShiftError::AlreadyArchived { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(settled)
    }

    /// Archives the pair's records from earlier windows and returns the record
    /// for the window containing `now`, creating it zeroed if needed.
    ///
    /// Elapsed records are settled before they are archived. A record already
    /// archived by another path is not an error. Records from a later window
    /// than `now` mean `now` is behind the live shift and are rejected as
    /// ambiguous.
    pub fn reset(
        &self,
        machine_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ShiftRecord> {
        let window = self.clock.window(now);
        self.settle_elapsed(machine_id, operator_id, now)?;

        for record in self.open_records(machine_id, operator_id)? {
            match record.start_time.cmp(&window.start) {
                Ordering::Less => match self.archival.archive(record.id, now) {
                    Ok(_) => {}
                    Err(ShiftError::AlreadyArchived { id }) => {
                        info!(shift_record_id = id, "Stale record archived concurrently");
                    }
                    Err(err) => return Err(err),
                },
                Ordering::Equal => {}
                Ordering::Greater => {
                    return Err(ShiftError::clock(
                        now.to_rfc3339(),
                        format!(
                            "timestamp precedes the open {} shift of {}",
                            record.shift_type.as_str(),
                            record.shift_date
                        ),
                    ));
                }
            }
        }

        self.get_or_create(machine_id, operator_id, now)
    }

    /// Closes out the current window's record as well, then starts fresh.
    pub fn handover(
        &self,
        machine_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ShiftRecord> {
        if let Some(current) = self.current(machine_id, operator_id, now)? {
            match self.archival.archive(current.id, now) {
                Ok(_) | Err(ShiftError::AlreadyArchived { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        self.reset(machine_id, operator_id, now)
    }
}

/// Expected output for a full shift at the configured speed.
pub fn target_production(speed: f64, shift_minutes: i64) -> i64 {
    if !speed.is_finite() || speed <= 0.0 {
        return 0;
    }
    (speed * shift_minutes as f64).floor() as i64
}

// ── Folds ────────────────────────────────────────────────────────────────────

/// Start of the not-yet-counted interval for a running machine.
///
/// The latest of the record's last fold, the window start, the operation start
/// and the moment the machine entered its current status.
pub fn production_baseline(
    record: &ShiftRecord,
    machine: &MachineState,
    operation: Option<&OpenOperation>,
) -> DateTime<Utc> {
    let mut baseline = record.start_time.max(machine.status_changed_at);
    if let Some(operation) = operation {
        baseline = baseline.max(operation.started_at);
    }
    if let Some(last_update) = record.last_update() {
        baseline = baseline.max(last_update);
    }
    baseline
}

/// Delta for the running interval up to `now` at the machine's current speed.
/// Machines that are not running contribute no production.
pub fn running_fold(
    record: &ShiftRecord,
    machine: &MachineState,
    operation: Option<&OpenOperation>,
    now: DateTime<Utc>,
) -> ShiftDelta {
    if machine.status != MachineStatus::Running {
        return ShiftDelta::default();
    }

    let baseline = production_baseline(record, machine, operation);
    let accrual = accrue(baseline, now, machine.speed);
    ShiftDelta {
        production: accrual.units,
        status: Some(machine.status),
        speed: Some(machine.speed),
        observed_at: Some(accrual.consumed_until),
        ..ShiftDelta::default()
    }
}

/// Downtime not yet booked into the record for a stopped or maintenance
/// interval ending at `until`, capped at the record's window end.
pub fn downtime_fold(
    record: &ShiftRecord,
    machine: &MachineState,
    operation: Option<&OpenOperation>,
    until: DateTime<Utc>,
) -> ShiftDelta {
    let mut from = record.start_time.max(machine.status_changed_at);
    if let Some(operation) = operation {
        from = from.max(operation.started_at);
    }
    if let Some(booked) = record.downtime_booked_until() {
        from = from.max(booked);
    }

    let booking = book_downtime(machine.status, from, until.min(record.end_time));
    if booking.minutes == 0 {
        return ShiftDelta::default();
    }
    ShiftDelta {
        downtime_minutes: booking.minutes,
        downtime_until: Some(booking.booked_until),
        ..ShiftDelta::default()
    }
}

/// Everything the machine did between the record's last fold and its window
/// end.
pub fn settlement_fold(
    record: &ShiftRecord,
    machine: &MachineState,
    operation: &OpenOperation,
) -> ShiftDelta {
    if machine.status.is_running() {
        running_fold(record, machine, Some(operation), record.end_time)
    } else {
        downtime_fold(record, machine, Some(operation), record.end_time)
    }
}

fn retry_backoff(attempt: u32) -> StdDuration {
    let step = RETRY_BACKOFF_STEP_MS.saturating_mul(u64::from(attempt));
    StdDuration::from_millis(cmp::min(step, RETRY_BACKOFF_MAX_MS))
}
