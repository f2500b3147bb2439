//! Archival of shift records into immutable snapshots.
//!
//! Snapshot creation and the record's archive flag flip happen in one database
//! transaction, so a record is never archived without its entry or vice versa.

use chrono::{DateTime, Utc};
use serde::Serialize;
use shift_core::{
    seal, ArchiveEntry, ArchiveSnapshot, Result, ShiftError, ShiftKey, ShiftRecord,
};
use std::sync::Arc;
use tracing::{info, warn};

use crate::db::{ArchiveOutcome, Db};

#[derive(Clone)]
pub struct ArchivalService {
    db: Arc<Db>,
    max_write_retries: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub record_id: i64,
    pub key: ShiftKey,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SweepReport {
    pub archived: Vec<ArchiveEntry>,
    pub failures: Vec<SweepFailure>,
}

impl ArchivalService {
    pub fn new(db: Arc<Db>, max_write_retries: u32) -> Self {
        Self {
            db,
            max_write_retries: max_write_retries.max(1),
        }
    }

    /// Archives one record. Fails with `AlreadyArchived` if it is no longer open.
    ///
    /// A concurrent write between reading the record and archiving it is
    /// retried with a fresh read, so the snapshot always reflects the last
    /// committed totals.
    pub fn archive(&self, shift_record_id: i64, now: DateTime<Utc>) -> Result<ArchiveEntry> {
        for attempt in 1..=self.max_write_retries {
            let record = self
                .db
                .get_shift_record(shift_record_id)?
                .ok_or(ShiftError::ShiftRecordNotFound(shift_record_id))?;
            if record.is_archived {
                return Err(ShiftError::AlreadyArchived {
                    id: shift_record_id,
                });
            }

            let sealed = seal(&ArchiveSnapshot::from_record(&record, now))?;
            match self.db.archive_shift_record(&record, &sealed, now)? {
                ArchiveOutcome::Archived(entry) => {
                    info!(
                        shift_record_id,
                        key = %record.key(),
                        total_production = record.total_production,
                        checksum = %entry.checksum,
                        "Shift record archived"
                    );
                    return Ok(entry);
                }
                ArchiveOutcome::Conflict => {
                    tracing::debug!(shift_record_id, attempt, "Archive lost a race; retrying");
                }
            }
        }

        // A losing writer may have raced against another archiver.
        if let Some(record) = self.db.get_shift_record(shift_record_id)? {
            if record.is_archived {
                return Err(ShiftError::AlreadyArchived {
                    id: shift_record_id,
                });
            }
        }
        Err(ShiftError::StaleWrite {
            id: shift_record_id,
            attempts: self.max_write_retries,
        })
    }

    /// Archives every open record whose window has elapsed at `now`.
    ///
    /// Records are processed independently; one failure is reported and the
    /// sweep continues. Records archived concurrently by another path are
    /// skipped silently.
    pub fn sweep_due(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let due = self.db.list_due_records(now)?;
        Ok(self.sweep(&due, now))
    }

    fn sweep(&self, due: &[ShiftRecord], now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for record in due {
            match self.archive(record.id, now) {
                Ok(entry) => report.archived.push(entry),
                Err(ShiftError::AlreadyArchived { id }) => {
                    tracing::debug!(shift_record_id = id, "Record already archived; skipping");
                }
                Err(err) => {
                    warn!(
                        shift_record_id = record.id,
                        key = %record.key(),
                        error = %err,
                        "Failed to archive elapsed shift record"
                    );
                    report.failures.push(SweepFailure {
                        record_id: record.id,
                        key: record.key(),
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{InsertOutcome, NewShiftRecord};
    use chrono::{NaiveDate, TimeZone};
    use shift_core::{Detail, ShiftType};

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0)
            .single()
            .unwrap()
    }

    fn seed(db: &Db, operator_id: &str, shift_type: ShiftType) -> ShiftRecord {
        let (start, end) = match shift_type {
            ShiftType::Day => (at(2, 7, 0), at(2, 19, 0)),
            ShiftType::Night => (at(2, 19, 0), at(3, 7, 0)),
        };
        let new = NewShiftRecord {
            machine_id: "m-1".to_string(),
            operator_id: operator_id.to_string(),
            shift_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            shift_type,
            start_time: start,
            end_time: end,
            target_production: 100,
            detail: Detail::new(),
            created_at: start,
        };
        match db.insert_shift_record(&new).expect("insert") {
            InsertOutcome::Inserted(record) => record,
            InsertOutcome::Conflict => panic!("conflict"),
        }
    }

    #[test]
    fn archive_is_idempotent_by_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(temp_dir.path().join("shiftd.db")).expect("db init"));
        let service = ArchivalService::new(db.clone(), 3);
        let record = seed(&db, "op-1", ShiftType::Day);

        let entry = service.archive(record.id, at(2, 19, 0)).expect("archive");
        assert!(entry.verify());
        let snapshot = entry.decode_snapshot().unwrap();
        assert_eq!(snapshot.shift.record_id, record.id);

        let err = service.archive(record.id, at(2, 19, 1)).unwrap_err();
        assert!(matches!(err, ShiftError::AlreadyArchived { id } if id == record.id));
        assert_eq!(db.archive_entries_for_record(record.id).unwrap().len(), 1);
    }

    #[test]
    fn archive_missing_record_is_not_found() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(temp_dir.path().join("shiftd.db")).expect("db init"));
        let service = ArchivalService::new(db, 3);
        assert!(service.archive(999, at(2, 19, 0)).unwrap_err().is_not_found());
    }

    #[test]
    fn sweep_archives_only_elapsed_windows() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(temp_dir.path().join("shiftd.db")).expect("db init"));
        let service = ArchivalService::new(db.clone(), 3);
        let day = seed(&db, "op-1", ShiftType::Day);
        let night = seed(&db, "op-1", ShiftType::Night);

        let report = service.sweep_due(at(2, 19, 0)).expect("sweep");
        assert_eq!(report.archived.len(), 1);
        assert!(report.failures.is_empty());
        assert_eq!(report.archived[0].shift_record_id, day.id);
        assert!(db.get_shift_record(night.id).unwrap().unwrap().is_open());

        // Re-running the sweep finds nothing new.
        let again = service.sweep_due(at(2, 19, 5)).expect("sweep");
        assert!(again.archived.is_empty());
    }

    #[test]
    fn sweep_continues_past_failing_records() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db_path = temp_dir.path().join("shiftd.db");
        let db = Arc::new(Db::new(db_path.clone()).expect("db init"));
        let service = ArchivalService::new(db.clone(), 3);
        let first = seed(&db, "op-1", ShiftType::Day);
        let raced = seed(&db, "op-2", ShiftType::Day);
        let broken = seed(&db, "op-3", ShiftType::Day);
        let last = seed(&db, "op-4", ShiftType::Day);

        let due = db.list_due_records(at(2, 19, 0)).unwrap();
        assert_eq!(due.len(), 4);

        // Another path archives one record after the listing.
        service.archive(raced.id, at(2, 19, 0)).unwrap();
        // A stray entry makes every archive attempt for this record conflict.
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute(
            "INSERT INTO archive_entries \
                (shift_record_id, machine_id, operator_id, shift_date, shift_type, \
                 snapshot, size_bytes, checksum, archived_at) \
             VALUES (?1, 'm-1', 'op-3', '2026-03-02', 'day', '{}', 2, 'x', '2026-03-02T19:00:00.000Z')",
            rusqlite::params![broken.id],
        )
        .unwrap();

        let report = service.sweep(&due, at(2, 19, 0));
        let mut archived: Vec<i64> = report
            .archived
            .iter()
            .map(|entry| entry.shift_record_id)
            .collect();
        archived.sort_unstable();
        assert_eq!(archived, vec![first.id, last.id]);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].record_id, broken.id);
        assert_eq!(report.failures[0].code, "stale_write");
        assert!(db.get_shift_record(broken.id).unwrap().unwrap().is_open());
    }

    #[test]
    fn concurrent_archivers_write_one_entry() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = Arc::new(Db::new(temp_dir.path().join("shiftd.db")).expect("db init"));
        let record = seed(&db, "op-1", ShiftType::Day);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let service = ArchivalService::new(db.clone(), 5);
                std::thread::spawn(move || service.archive(record.id, at(2, 19, 0)))
            })
            .collect();

        let mut archived = 0;
        for handle in handles {
            match handle.join().expect("join") {
                Ok(_) => archived += 1,
                Err(ShiftError::AlreadyArchived { .. }) => {}
                Err(err) => panic!("unexpected error: {}", err),
            }
        }
        assert_eq!(archived, 1);
        assert_eq!(db.archive_entries_for_record(record.id).unwrap().len(), 1);
    }
}
