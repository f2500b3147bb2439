//! Shift service: the request-facing API of the daemon.
//!
//! Every operation and every ingested event runs the transition detector for
//! its (machine, operator) pair before its own effects, so callers never see
//! or write to a record from an elapsed shift window.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shift_core::{
    parse_timestamp, window_report, windowed_status_breakdown, ArchiveEntry, ArchiveFilter,
    DateRange, MachineState, MachineStatus, OpenOperation, ProductionUpdate, Result, ShiftClock,
    ShiftDelta, ShiftError, ShiftRecord, ShiftWindow, StatusBreakdown, StatusChange, SummaryRow,
    WindowReport,
};
use shiftd_protocol::{EventEnvelope, EventType};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::db::Db;
use crate::detector::ShiftTransitionDetector;
use crate::registry::{ProductionPublisher, SubscriberRegistry};
use crate::store::{downtime_fold, running_fold, ShiftStore};
use crate::sweeper::BoundarySweeper;
use crate::ticker::RealtimeTicker;

pub struct ShiftService {
    db: Arc<Db>,
    store: ShiftStore,
    detector: ShiftTransitionDetector,
    registry: Arc<SubscriberRegistry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventOutcome {
    pub event_id: String,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ShiftRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShiftReport {
    pub record: ShiftRecord,
    pub machine_status: MachineStatus,
    pub window: WindowReport,
}

impl ShiftService {
    pub fn new(
        db: Arc<Db>,
        clock: ShiftClock,
        max_write_retries: u32,
        registry: Arc<SubscriberRegistry>,
    ) -> Self {
        let store = ShiftStore::new(db.clone(), clock, max_write_retries);
        Self {
            detector: ShiftTransitionDetector::new(store.clone()),
            db,
            store,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn ticker(&self) -> RealtimeTicker {
        RealtimeTicker::new(
            self.db.clone(),
            self.store.clone(),
            self.detector.clone(),
            self.registry.clone(),
        )
    }

    pub fn sweeper(&self, grace: StdDuration, recheck: StdDuration) -> BoundarySweeper {
        BoundarySweeper::new(
            self.store.archival().clone(),
            *self.store.clock(),
            grace,
            recheck,
        )
    }

    // ── Shift operations ─────────────────────────────────────────────────────

    pub fn get_current_shift_data(
        &self,
        machine_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ShiftRecord> {
        Ok(self
            .detector
            .ensure_current(machine_id, operator_id, now)?
            .record)
    }

    pub fn create_or_update_shift_data(
        &self,
        machine_id: &str,
        operator_id: &str,
        production_delta: i64,
        now: DateTime<Utc>,
    ) -> Result<ShiftRecord> {
        if production_delta < 0 {
            return Err(ShiftError::InvalidDelta(production_delta));
        }

        self.detector.ensure_current(machine_id, operator_id, now)?;
        let record = self.store.upsert(
            machine_id,
            operator_id,
            &ShiftDelta::production(production_delta),
            now,
        )?;
        if production_delta > 0 {
            self.publish(&record, production_delta, now);
        }
        Ok(record)
    }

    /// Admin handover: closes out the pair's current record and starts a
    /// zeroed one for the same window.
    pub fn reset_operator_data(
        &self,
        machine_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ShiftRecord> {
        if let (Some(machine), Some(operation)) = (
            self.db.get_machine(machine_id)?,
            self.db.open_operation(machine_id)?,
        ) {
            if operation.operator_id == operator_id {
                self.fold_running(&machine, &operation, now, false)?;
            }
        }

        let record = self.store.handover(machine_id, operator_id, now)?;
        info!(
            machine_id,
            operator_id,
            shift_record_id = record.id,
            "Operator data reset"
        );
        Ok(record)
    }

    pub fn archive_shift_data(
        &self,
        shift_record_id: i64,
        now: DateTime<Utc>,
    ) -> Result<ArchiveEntry> {
        self.store.archival().archive(shift_record_id, now)
    }

    pub fn get_archived_data(&self, filter: &ArchiveFilter) -> Result<Vec<ArchiveEntry>> {
        self.db.list_archive_entries(filter)
    }

    pub fn get_current_shift_type(&self, now: DateTime<Utc>) -> ShiftWindow {
        self.store.clock().window(now)
    }

    pub fn events_recorded(&self) -> Result<i64> {
        self.db.count_events()
    }

    pub fn summarize(&self, range: &DateRange) -> Result<Vec<SummaryRow>> {
        self.db.summarize(range)
    }

    /// Per-status minutes for a machine over `[start, end)`.
    pub fn windowed_status(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<StatusBreakdown> {
        let machine = self
            .db
            .get_machine(machine_id)?
            .ok_or_else(|| ShiftError::MachineNotFound(machine_id.to_string()))?;
        let history = self.db.status_history(machine_id, start, end)?;
        Ok(windowed_status_breakdown(
            &history,
            machine.status,
            start,
            end,
        ))
    }

    /// Window report for the pair's current shift, up to `now`.
    pub fn shift_report(
        &self,
        machine_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ShiftReport> {
        let machine = self
            .db
            .get_machine(machine_id)?
            .ok_or_else(|| ShiftError::MachineNotFound(machine_id.to_string()))?;
        let record = self
            .detector
            .ensure_current(machine_id, operator_id, now)?
            .record;

        let end = now.min(record.end_time).max(record.start_time);
        let breakdown = self.windowed_status(machine_id, record.start_time, end)?;
        let window = window_report(record.start_time, end, breakdown, record.total_production);

        Ok(ShiftReport {
            machine_status: machine.status,
            window,
            record,
        })
    }

    // ── Event ingestion ──────────────────────────────────────────────────────

    /// Applies one operation-lifecycle event. Events are idempotent by id.
    ///
    /// The id is claimed before any effect is applied, so concurrent
    /// deliveries of one event apply it once. A claim whose effects fail is
    /// released again and the event can be retried.
    pub fn handle_event(&self, event: &EventEnvelope) -> Result<EventOutcome> {
        let now = parse_timestamp(&event.recorded_at)?;

        if !self.db.insert_event(event)? {
            debug!(event_id = %event.event_id, "Duplicate event ignored");
            return Ok(EventOutcome {
                event_id: event.event_id.clone(),
                duplicate: true,
                record: None,
            });
        }

        let applied = match event.event_type {
            EventType::OperationStart => self.on_operation_start(event, now),
            EventType::OperationEnd => self.on_operation_end(event, now),
            EventType::StatusChange => self.on_status_change(event, now),
            EventType::SpeedChange => self.on_speed_change(event, now),
            EventType::QualityTest => self.on_quality_test(event, now),
        };
        let record = match applied {
            Ok(record) => record,
            Err(err) => {
                if let Err(release_err) = self.db.release_event(&event.event_id) {
                    warn!(
                        event_id = %event.event_id,
                        error = %release_err,
                        "Failed to release claim of unapplied event"
                    );
                }
                return Err(err);
            }
        };

        debug!(
            event_id = %event.event_id,
            event_type = ?event.event_type,
            machine_id = %event.machine_id,
            "Event applied"
        );

        Ok(EventOutcome {
            event_id: event.event_id.clone(),
            duplicate: false,
            record,
        })
    }

    fn on_operation_start(
        &self,
        event: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Option<ShiftRecord>> {
        let operator_id = event
            .operator_id
            .as_deref()
            .ok_or_else(|| ShiftError::invalid_event(event.event_id.clone(), "missing operator"))?;

        let prior = self.db.get_machine(&event.machine_id)?;
        if let (Some(machine), Some(previous)) =
            (prior.as_ref(), self.db.open_operation(&event.machine_id)?)
        {
            self.close_operation(machine, &previous, now)?;
        }

        let status = event.machine_status().unwrap_or(MachineStatus::Running);
        let machine = self.write_machine(
            prior.as_ref(),
            &event.machine_id,
            Some(status),
            event.speed,
            now,
        )?;
        let operation = OpenOperation {
            machine_id: event.machine_id.clone(),
            operator_id: operator_id.to_string(),
            started_at: now,
        };
        self.db.start_operation(&operation)?;
        info!(
            machine_id = %operation.machine_id,
            operator_id = %operation.operator_id,
            "Operation started"
        );

        self.detector
            .ensure_current(&event.machine_id, operator_id, now)?;
        let (record, _) = self
            .store
            .apply(&event.machine_id, operator_id, now, |record| {
                Ok(ShiftDelta {
                    status: Some(machine.status),
                    speed: Some(machine.speed),
                    observed_at: rebaseline(record, now),
                    ..ShiftDelta::default()
                })
            })?;
        Ok(Some(record))
    }

    fn on_operation_end(
        &self,
        event: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Option<ShiftRecord>> {
        let operation = self.db.open_operation(&event.machine_id)?.ok_or_else(|| {
            ShiftError::NoOpenOperation {
                machine_id: event.machine_id.clone(),
            }
        })?;
        let machine = self
            .db
            .get_machine(&event.machine_id)?
            .ok_or_else(|| ShiftError::MachineNotFound(event.machine_id.clone()))?;

        let record = self.close_operation(&machine, &operation, now)?;
        self.db.end_operation(&event.machine_id, now)?;
        info!(
            machine_id = %operation.machine_id,
            operator_id = %operation.operator_id,
            total_production = record.total_production,
            "Operation ended"
        );
        Ok(Some(record))
    }

    fn on_status_change(
        &self,
        event: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Option<ShiftRecord>> {
        let status = event
            .machine_status()
            .ok_or_else(|| {
                ShiftError::invalid_event(event.event_id.clone(), "missing machine status")
            })?;
        let prior = self.db.get_machine(&event.machine_id)?;
        let operation = self.db.open_operation(&event.machine_id)?;

        let mut record = None;
        if let (Some(machine), Some(operation)) = (prior.as_ref(), operation.as_ref()) {
            if machine.status != status {
                self.fold_running(machine, operation, now, false)?;
                self.detector
                    .ensure_current(&operation.machine_id, &operation.operator_id, now)?;

                let (updated, _) = self.store.apply(
                    &operation.machine_id,
                    &operation.operator_id,
                    now,
                    |current| {
                        Ok(ShiftDelta {
                            status: Some(status),
                            observed_at: if status.is_running() {
                                rebaseline(current, now)
                            } else {
                                None
                            },
                            ..downtime_fold(current, machine, Some(operation), now)
                        })
                    },
                )?;
                record = Some(updated);
            }
        }

        self.write_machine(prior.as_ref(), &event.machine_id, Some(status), event.speed, now)?;
        Ok(record)
    }

    fn on_speed_change(
        &self,
        event: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Option<ShiftRecord>> {
        let prior = self.db.get_machine(&event.machine_id)?;
        let mut record = None;

        // Output so far is counted at the old speed before the new one is stored.
        if let (Some(machine), Some(operation)) =
            (prior.as_ref(), self.db.open_operation(&event.machine_id)?)
        {
            record = self.fold_running(machine, &operation, now, true)?;
        }

        let machine =
            self.write_machine(prior.as_ref(), &event.machine_id, None, event.speed, now)?;
        info!(
            machine_id = %machine.machine_id,
            speed = machine.speed,
            "Machine speed changed"
        );
        Ok(record)
    }

    fn on_quality_test(
        &self,
        event: &EventEnvelope,
        now: DateTime<Utc>,
    ) -> Result<Option<ShiftRecord>> {
        let operator_id = match event.operator_id.clone() {
            Some(operator_id) => operator_id,
            None => {
                self.db
                    .open_operation(&event.machine_id)?
                    .ok_or_else(|| ShiftError::NoOpenOperation {
                        machine_id: event.machine_id.clone(),
                    })?
                    .operator_id
            }
        };
        let passed = event.passed.unwrap_or(false);

        self.detector
            .ensure_current(&event.machine_id, &operator_id, now)?;
        let record = self.store.upsert(
            &event.machine_id,
            &operator_id,
            &ShiftDelta {
                approved_tests: i64::from(passed),
                rejected_tests: i64::from(!passed),
                ..ShiftDelta::default()
            },
            now,
        )?;
        Ok(Some(record))
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Books everything up to `now` against an operation about to close:
    /// output if the machine is running, the open stopped or maintenance
    /// interval otherwise.
    fn close_operation(
        &self,
        machine: &MachineState,
        operation: &OpenOperation,
        now: DateTime<Utc>,
    ) -> Result<ShiftRecord> {
        self.fold_running(machine, operation, now, false)?;
        self.detector
            .ensure_current(&operation.machine_id, &operation.operator_id, now)?;
        let (record, _) = self.store.apply(
            &operation.machine_id,
            &operation.operator_id,
            now,
            |current| Ok(downtime_fold(current, machine, Some(operation), now)),
        )?;
        Ok(record)
    }

    /// Counts a running machine's output up to `now`, settling any elapsed
    /// window first. With `rebase_to_now` the baseline lands exactly on `now`
    /// instead of carrying the fractional remainder.
    fn fold_running(
        &self,
        machine: &MachineState,
        operation: &OpenOperation,
        now: DateTime<Utc>,
        rebase_to_now: bool,
    ) -> Result<Option<ShiftRecord>> {
        if !machine.status.is_running() {
            return Ok(None);
        }

        let settled =
            self.store
                .settle_elapsed(&operation.machine_id, &operation.operator_id, now)?;
        self.detector
            .ensure_current(&operation.machine_id, &operation.operator_id, now)?;
        let (record, delta) =
            self.store
                .apply(&operation.machine_id, &operation.operator_id, now, |current| {
                    let mut delta = running_fold(current, machine, Some(operation), now);
                    if rebase_to_now {
                        delta.observed_at = rebaseline(current, now).or(delta.observed_at);
                    }
                    Ok(delta)
                })?;

        let produced = settled + delta.production;
        if produced > 0 {
            self.publish(&record, produced, now);
        }
        Ok(Some(record))
    }

    fn write_machine(
        &self,
        prior: Option<&MachineState>,
        machine_id: &str,
        status: Option<MachineStatus>,
        speed: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<MachineState> {
        let status = status
            .or(prior.map(|machine| machine.status))
            .unwrap_or(MachineStatus::Idle);
        let speed = speed
            .or(prior.map(|machine| machine.speed))
            .unwrap_or(0.0);
        let previous = prior.map(|machine| machine.status);
        let changed = previous != Some(status);

        if changed {
            self.db.insert_status_change(&StatusChange {
                machine_id: machine_id.to_string(),
                at: now,
                from: previous,
                to: status,
            })?;
        }

        let machine = MachineState {
            machine_id: machine_id.to_string(),
            status,
            speed,
            status_changed_at: match prior {
                Some(machine) if !changed => machine.status_changed_at,
                _ => now,
            },
            updated_at: now,
        };
        self.db.upsert_machine(&machine)?;
        Ok(machine)
    }

    fn publish(&self, record: &ShiftRecord, delta: i64, now: DateTime<Utc>) {
        self.registry
            .publish(&ProductionUpdate::from_record(record, delta, now));
    }
}

/// Moves the baseline to `now` unless the record already counted past it.
fn rebaseline(record: &ShiftRecord, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match record.last_update() {
        Some(last_update) if last_update >= now => None,
        _ => Some(now),
    }
}
