//! Shift transition detection.
//!
//! Runs before any shift-scoped operation so that a (machine, operator) pair
//! never accumulates into a record from a window that has already ended.

use chrono::{DateTime, Utc};
use shift_core::{Result, ShiftRecord};
use tracing::info;

use crate::store::ShiftStore;

#[derive(Clone)]
pub struct ShiftTransitionDetector {
    store: ShiftStore,
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub record: ShiftRecord,
    /// Earlier-window records that were closed out by this check.
    pub rolled_over: Vec<i64>,
}

impl ShiftTransitionDetector {
    pub fn new(store: ShiftStore) -> Self {
        Self { store }
    }

    /// Returns the record for the window containing `now`, settling and then
    /// archiving any earlier open records of the pair first.
    pub fn ensure_current(
        &self,
        machine_id: &str,
        operator_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Detection> {
        let window = self.store.clock().window(now);
        let open = self.store.open_records(machine_id, operator_id)?;

        let stale: Vec<&ShiftRecord> = open
            .iter()
            .filter(|record| record.start_time < window.start)
            .collect();

        if stale.is_empty() {
            if let Some(current) = open
                .iter()
                .find(|record| record.start_time == window.start)
            {
                return Ok(Detection {
                    record: current.clone(),
                    rolled_over: Vec::new(),
                });
            }
        } else {
            for record in &stale {
                info!(
                    machine_id,
                    operator_id,
                    previous_shift = record.shift_type.as_str(),
                    previous_date = %record.shift_date,
                    current_shift = window.shift_type.as_str(),
                    current_date = %window.shift_date,
                    "Shift boundary crossed"
                );
            }
        }

        let rolled_over = stale.iter().map(|record| record.id).collect();
        let record = self.store.reset(machine_id, operator_id, now)?;
        Ok(Detection {
            record,
            rolled_over,
        })
    }
}
