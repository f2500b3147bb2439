//! Real-time production ticker.
//!
//! Each tick folds the production of every running machine with an open
//! operation into its current shift record, covering only the interval since
//! that record's last fold. Machines that are not running still have their
//! elapsed records settled, so downtime reaches the shift it belongs to.

use chrono::{DateTime, Utc};
use shift_core::{MachineState, OpenOperation, ProductionUpdate, Result, ShiftDelta, ShiftError};
use std::sync::Arc;
use tracing::warn;

use crate::db::Db;
use crate::detector::ShiftTransitionDetector;
use crate::registry::ProductionPublisher;
use crate::store::{running_fold, ShiftStore};

pub struct RealtimeTicker {
    db: Arc<Db>,
    store: ShiftStore,
    detector: ShiftTransitionDetector,
    publisher: Arc<dyn ProductionPublisher>,
}

#[derive(Debug, Default)]
pub struct TickReport {
    /// Running machines folded this tick.
    pub machines: usize,
    pub produced: i64,
    pub failures: Vec<ShiftError>,
}

impl RealtimeTicker {
    pub fn new(
        db: Arc<Db>,
        store: ShiftStore,
        detector: ShiftTransitionDetector,
        publisher: Arc<dyn ProductionPublisher>,
    ) -> Self {
        Self {
            db,
            store,
            detector,
            publisher,
        }
    }

    /// One pass over all machines with an open operation. A failing machine
    /// is reported and skipped; only failing to list machines aborts the tick.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        for (machine, operation) in self.db.active_operations()? {
            if machine.status.is_running() {
                report.machines += 1;
            }
            match self.tick_machine(&machine, &operation, now) {
                Ok(Some(update)) => {
                    report.produced += update.delta;
                    self.publisher.publish(&update);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        machine_id = %machine.machine_id,
                        operator_id = %operation.operator_id,
                        error = %err,
                        "Production tick failed for machine"
                    );
                    report.failures.push(ShiftError::PartialTickFailure {
                        machine_id: machine.machine_id.clone(),
                        operator_id: operation.operator_id.clone(),
                        details: err.to_string(),
                    });
                }
            }
        }

        if report.machines > 0 {
            tracing::debug!(
                machines = report.machines,
                produced = report.produced,
                failures = report.failures.len(),
                "Production tick complete"
            );
        }
        Ok(report)
    }

    /// Settles and folds one machine. `machine` and `operation` come from the
    /// listing at the start of the tick; if either has moved on by the time
    /// the record is written, the fold is skipped and the event that moved it
    /// accounts for the interval.
    fn tick_machine(
        &self,
        machine: &MachineState,
        operation: &OpenOperation,
        now: DateTime<Utc>,
    ) -> Result<Option<ProductionUpdate>> {
        let settled =
            self.store
                .settle_elapsed(&machine.machine_id, &operation.operator_id, now)?;
        if !machine.status.is_running() {
            return Ok(None);
        }

        self.detector
            .ensure_current(&machine.machine_id, &operation.operator_id, now)?;

        let (record, mut delta) =
            self.store
                .apply(&machine.machine_id, &operation.operator_id, now, |record| {
                    let unchanged = self.db.get_machine(&machine.machine_id)?.as_ref()
                        == Some(machine)
                        && self.db.open_operation(&machine.machine_id)?.as_ref()
                            == Some(operation);
                    if !unchanged {
                        return Ok(ShiftDelta::default());
                    }
                    Ok(running_fold(record, machine, Some(operation), now))
                })?;

        delta.production += settled;
        Ok(Some(ProductionUpdate::from_record(
            &record,
            delta.production,
            now,
        )))
    }
}
