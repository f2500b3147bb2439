//! SQLite persistence for shiftd.
//!
//! This is the single-writer store backing the daemon: an append-only event
//! log, the machine/operation view fed by those events, shift records and
//! their write-once archive entries.
//!
//! Shift record writes are optimistic: every UPDATE is conditional on the
//! version that was read and bumps it. A partial unique index keeps at most one
//! open record per (machine, operator, shift date, shift type).

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OpenFlags, OptionalExtension,
    TransactionBehavior,
};
use shift_core::{
    parse_timestamp, ArchiveEntry, ArchiveFilter, DateRange, Detail, MachineState, MachineStatus,
    OpenOperation, Result, SealedSnapshot, ShiftError, ShiftRecord, ShiftType, StatusChange,
    SummaryRow,
};
use shiftd_protocol::EventEnvelope;
use std::path::PathBuf;

const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5000;

const SHIFT_COLUMNS: &str = "id, machine_id, operator_id, shift_date, shift_type, start_time, \
     end_time, total_production, target_production, efficiency, downtime_minutes, \
     quality_tests, approved_tests, rejected_tests, detail, is_active, is_archived, \
     archived_at, created_at, updated_at, version";

const ARCHIVE_COLUMNS: &str = "id, shift_record_id, machine_id, operator_id, shift_date, \
     shift_type, snapshot, size_bytes, checksum, archived_at";

pub struct Db {
    path: PathBuf,
    busy_timeout_ms: u32,
}

/// Values for a record about to be created.
#[derive(Debug, Clone)]
pub struct NewShiftRecord {
    pub machine_id: String,
    pub operator_id: String,
    pub shift_date: NaiveDate,
    pub shift_type: ShiftType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub target_production: i64,
    /// Initial detail, e.g. a carried-over production baseline.
    pub detail: Detail,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum InsertOutcome {
    Inserted(ShiftRecord),
    /// Another writer already holds the open record for this key.
    Conflict,
}

#[derive(Debug)]
pub enum ArchiveOutcome {
    Archived(ArchiveEntry),
    /// The record moved on (version bump or archived) since it was read.
    Conflict,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self> {
        Self::with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT_MS)
    }

    pub fn with_busy_timeout(path: PathBuf, busy_timeout_ms: u32) -> Result<Self> {
        let db = Self {
            path,
            busy_timeout_ms,
        };
        db.init_schema()?;
        Ok(db)
    }

    // ── Event log ────────────────────────────────────────────────────────────

    /// Appends an event, claiming its id. Returns false when the id was
    /// already claimed. The insert is a single statement, so of any number of
    /// concurrent deliveries exactly one sees true.
    pub fn insert_event(&self, event: &EventEnvelope) -> Result<bool> {
        self.with_connection(|conn| {
            let payload = serde_json::to_string(event).map_err(|source| {
                ShiftError::Serialization {
                    context: "serializing event payload".to_string(),
                    source,
                }
            })?;
            let event_type = serde_json::to_string(&event.event_type)
                .unwrap_or_else(|_| "unknown".to_string())
                .trim_matches('"')
                .to_string();

            let inserted = conn
                .execute(
                    "INSERT INTO events (id, recorded_at, event_type, machine_id, payload) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(id) DO NOTHING",
                    params![
                        event.event_id,
                        event.recorded_at,
                        event_type,
                        event.machine_id,
                        payload
                    ],
                )
                .map_err(|err| ShiftError::storage("Failed to insert event", err))?;

            Ok(inserted > 0)
        })
    }

    /// Drops an event claim whose effects could not be applied, so a retry
    /// with the same id is not mistaken for a duplicate.
    pub fn release_event(&self, event_id: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM events WHERE id = ?1", params![event_id])
                .map_err(|err| ShiftError::storage("Failed to release event", err))?;
            Ok(())
        })
    }

    pub fn count_events(&self) -> Result<i64> {
        self.with_connection(|conn| {
            conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
                .map_err(|err| ShiftError::storage("Failed to count events", err))
        })
    }

    // ── Machines, operations, status history ─────────────────────────────────

    pub fn upsert_machine(&self, machine: &MachineState) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO machines (machine_id, status, speed, status_changed_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(machine_id) DO UPDATE SET \
                    status = excluded.status, \
                    speed = excluded.speed, \
                    status_changed_at = excluded.status_changed_at, \
                    updated_at = excluded.updated_at",
                params![
                    machine.machine_id,
                    machine.status.as_str(),
                    machine.speed,
                    ts(machine.status_changed_at),
                    ts(machine.updated_at)
                ],
            )
            .map_err(|err| ShiftError::storage("Failed to upsert machine", err))?;
            Ok(())
        })
    }

    pub fn get_machine(&self, machine_id: &str) -> Result<Option<MachineState>> {
        let raw = self.with_connection(|conn| {
            conn.query_row(
                "SELECT machine_id, status, speed, status_changed_at, updated_at \
                 FROM machines WHERE machine_id = ?1",
                params![machine_id],
                RawMachine::from_row,
            )
            .optional()
            .map_err(|err| ShiftError::storage("Failed to query machine", err))
        })?;
        raw.map(RawMachine::into_machine).transpose()
    }

    pub fn insert_status_change(&self, change: &StatusChange) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO status_history (machine_id, at, from_status, to_status) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    change.machine_id,
                    ts(change.at),
                    change.from.map(|status| status.as_str()),
                    change.to.as_str()
                ],
            )
            .map_err(|err| ShiftError::storage("Failed to insert status change", err))?;
            Ok(())
        })
    }

    /// Changes inside `[start, end)` plus the last change before `start`.
    pub fn status_history(
        &self,
        machine_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StatusChange>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT machine_id, at, from_status, to_status FROM ( \
                        SELECT id, machine_id, at, from_status, to_status FROM status_history \
                        WHERE machine_id = ?1 AND at < ?2 \
                        ORDER BY at DESC, id DESC LIMIT 1 \
                     ) \
                     UNION ALL \
                     SELECT machine_id, at, from_status, to_status FROM ( \
                        SELECT id, machine_id, at, from_status, to_status FROM status_history \
                        WHERE machine_id = ?1 AND at >= ?2 AND at < ?3 \
                        ORDER BY at ASC, id ASC \
                     )",
                )
                .map_err(|err| ShiftError::storage("Failed to prepare status history query", err))?;
            let rows = stmt
                .query_map(params![machine_id, ts(start), ts(end)], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(|err| ShiftError::storage("Failed to query status history", err))?;

            let mut raw = Vec::new();
            for row in rows {
                raw.push(
                    row.map_err(|err| ShiftError::storage("Failed to decode status change", err))?,
                );
            }
            Ok(raw)
        })?;

        let mut changes = Vec::with_capacity(rows.len());
        for (machine_id, at, from, to) in rows {
            changes.push(StatusChange {
                machine_id,
                at: parse_timestamp(&at)?,
                from: from.as_deref().map(parse_status).transpose()?,
                to: parse_status(&to)?,
            });
        }
        changes.sort_by_key(|change| change.at);
        Ok(changes)
    }

    pub fn open_operation(&self, machine_id: &str) -> Result<Option<OpenOperation>> {
        let raw = self.with_connection(|conn| {
            conn.query_row(
                "SELECT machine_id, operator_id, started_at FROM operations \
                 WHERE machine_id = ?1 AND ended_at IS NULL",
                params![machine_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|err| ShiftError::storage("Failed to query open operation", err))
        })?;

        raw.map(|(machine_id, operator_id, started_at)| {
            Ok(OpenOperation {
                machine_id,
                operator_id,
                started_at: parse_timestamp(&started_at)?,
            })
        })
        .transpose()
    }

    /// Opens an operation, closing any operation still open on the machine.
    pub fn start_operation(&self, operation: &OpenOperation) -> Result<()> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| ShiftError::storage("Failed to begin operation start", err))?;
            tx.execute(
                "UPDATE operations SET ended_at = ?2 WHERE machine_id = ?1 AND ended_at IS NULL",
                params![operation.machine_id, ts(operation.started_at)],
            )
            .map_err(|err| ShiftError::storage("Failed to close previous operation", err))?;
            tx.execute(
                "INSERT INTO operations (machine_id, operator_id, started_at) VALUES (?1, ?2, ?3)",
                params![
                    operation.machine_id,
                    operation.operator_id,
                    ts(operation.started_at)
                ],
            )
            .map_err(|err| ShiftError::storage("Failed to insert operation", err))?;
            tx.commit()
                .map_err(|err| ShiftError::storage("Failed to commit operation start", err))
        })
    }

    pub fn end_operation(&self, machine_id: &str, ended_at: DateTime<Utc>) -> Result<bool> {
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE operations SET ended_at = ?2 WHERE machine_id = ?1 AND ended_at IS NULL",
                    params![machine_id, ts(ended_at)],
                )
                .map_err(|err| ShiftError::storage("Failed to end operation", err))?;
            Ok(updated > 0)
        })
    }

    /// Machines that have an open operation, in any status.
    pub fn active_operations(&self) -> Result<Vec<(MachineState, OpenOperation)>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT m.machine_id, m.status, m.speed, m.status_changed_at, m.updated_at, \
                            o.operator_id, o.started_at \
                     FROM machines m \
                     JOIN operations o ON o.machine_id = m.machine_id AND o.ended_at IS NULL \
                     ORDER BY m.machine_id ASC",
                )
                .map_err(|err| ShiftError::storage("Failed to prepare active operations query", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        RawMachine::from_row(row)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })
                .map_err(|err| ShiftError::storage("Failed to query active operations", err))?;

            let mut raw = Vec::new();
            for row in rows {
                raw.push(
                    row.map_err(|err| ShiftError::storage("Failed to decode active operation", err))?,
                );
            }
            Ok(raw)
        })?;

        let mut active = Vec::with_capacity(rows.len());
        for (machine, operator_id, started_at) in rows {
            let machine = machine.into_machine()?;
            let operation = OpenOperation {
                machine_id: machine.machine_id.clone(),
                operator_id,
                started_at: parse_timestamp(&started_at)?,
            };
            active.push((machine, operation));
        }
        Ok(active)
    }

    // ── Shift records ────────────────────────────────────────────────────────

    pub fn get_shift_record(&self, id: i64) -> Result<Option<ShiftRecord>> {
        let raw = self.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM shift_records WHERE id = ?1", SHIFT_COLUMNS),
                params![id],
                RawShiftRecord::from_row,
            )
            .optional()
            .map_err(|err| ShiftError::storage("Failed to query shift record", err))
        })?;
        raw.map(RawShiftRecord::into_record).transpose()
    }

    pub fn find_open_record(
        &self,
        machine_id: &str,
        operator_id: &str,
        shift_date: NaiveDate,
        shift_type: ShiftType,
    ) -> Result<Option<ShiftRecord>> {
        let raw = self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM shift_records \
                     WHERE machine_id = ?1 AND operator_id = ?2 AND shift_date = ?3 \
                       AND shift_type = ?4 AND is_active = 1 AND is_archived = 0",
                    SHIFT_COLUMNS
                ),
                params![
                    machine_id,
                    operator_id,
                    shift_date.to_string(),
                    shift_type.as_str()
                ],
                RawShiftRecord::from_row,
            )
            .optional()
            .map_err(|err| ShiftError::storage("Failed to query open shift record", err))
        })?;
        raw.map(RawShiftRecord::into_record).transpose()
    }

    /// Most recently archived record for a key, if the window was closed early.
    pub fn latest_archived_record(
        &self,
        machine_id: &str,
        operator_id: &str,
        shift_date: NaiveDate,
        shift_type: ShiftType,
    ) -> Result<Option<ShiftRecord>> {
        let raw = self.with_connection(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM shift_records \
                     WHERE machine_id = ?1 AND operator_id = ?2 AND shift_date = ?3 \
                       AND shift_type = ?4 AND is_archived = 1 \
                     ORDER BY id DESC LIMIT 1",
                    SHIFT_COLUMNS
                ),
                params![
                    machine_id,
                    operator_id,
                    shift_date.to_string(),
                    shift_type.as_str()
                ],
                RawShiftRecord::from_row,
            )
            .optional()
            .map_err(|err| ShiftError::storage("Failed to query archived shift record", err))
        })?;
        raw.map(RawShiftRecord::into_record).transpose()
    }

    /// Every open record of a (machine, operator) pair, oldest window first.
    pub fn list_open_records_for_pair(
        &self,
        machine_id: &str,
        operator_id: &str,
    ) -> Result<Vec<ShiftRecord>> {
        self.query_shift_records(
            &format!(
                "SELECT {} FROM shift_records \
                 WHERE machine_id = ?1 AND operator_id = ?2 AND is_active = 1 AND is_archived = 0 \
                 ORDER BY start_time ASC, id ASC",
                SHIFT_COLUMNS
            ),
            vec![machine_id.to_string(), operator_id.to_string()],
        )
    }

    /// Open records whose theoretical window has fully elapsed at `now`.
    pub fn list_due_records(&self, now: DateTime<Utc>) -> Result<Vec<ShiftRecord>> {
        self.query_shift_records(
            &format!(
                "SELECT {} FROM shift_records \
                 WHERE is_active = 1 AND is_archived = 0 AND end_time <= ?1 \
                 ORDER BY end_time ASC, id ASC",
                SHIFT_COLUMNS
            ),
            vec![ts(now)],
        )
    }

    pub fn insert_shift_record(&self, record: &NewShiftRecord) -> Result<InsertOutcome> {
        let detail = encode_detail(&record.detail)?;
        let inserted_id = self.with_connection(|conn| {
            let result = conn.execute(
                "INSERT INTO shift_records \
                    (machine_id, operator_id, shift_date, shift_type, start_time, end_time, \
                     total_production, target_production, efficiency, downtime_minutes, \
                     quality_tests, approved_tests, rejected_tests, detail, is_active, \
                     is_archived, archived_at, created_at, updated_at, version) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, 0.0, 0, 0, 0, 0, ?9, 1, 0, NULL, ?8, ?8, 0)",
                params![
                    record.machine_id,
                    record.operator_id,
                    record.shift_date.to_string(),
                    record.shift_type.as_str(),
                    ts(record.start_time),
                    ts(record.end_time),
                    record.target_production,
                    ts(record.created_at),
                    detail
                ],
            );

            match result {
                Ok(_) => Ok(Some(conn.last_insert_rowid())),
                Err(err) if is_constraint_violation(&err) => Ok(None),
                Err(err) => Err(ShiftError::storage("Failed to insert shift record", err)),
            }
        })?;

        match inserted_id {
            Some(id) => self
                .get_shift_record(id)?
                .map(InsertOutcome::Inserted)
                .ok_or(ShiftError::ShiftRecordNotFound(id)),
            None => Ok(InsertOutcome::Conflict),
        }
    }

    /// Writes `record` if the stored row is still open at `expected_version`.
    /// The caller is responsible for bumping `record.version`.
    pub fn update_shift_record(&self, record: &ShiftRecord, expected_version: i64) -> Result<bool> {
        let detail = encode_detail(&record.detail)?;
        self.with_connection(|conn| {
            let updated = conn
                .execute(
                    "UPDATE shift_records SET \
                        total_production = ?3, \
                        target_production = ?4, \
                        efficiency = ?5, \
                        downtime_minutes = ?6, \
                        quality_tests = ?7, \
                        approved_tests = ?8, \
                        rejected_tests = ?9, \
                        detail = ?10, \
                        updated_at = ?11, \
                        version = ?12 \
                     WHERE id = ?1 AND version = ?2 AND is_active = 1 AND is_archived = 0",
                    params![
                        record.id,
                        expected_version,
                        record.total_production,
                        record.target_production,
                        record.efficiency,
                        record.downtime_minutes,
                        record.quality_tests,
                        record.approved_tests,
                        record.rejected_tests,
                        detail,
                        ts(record.updated_at),
                        record.version
                    ],
                )
                .map_err(|err| ShiftError::storage("Failed to update shift record", err))?;
            Ok(updated == 1)
        })
    }

    /// Flips the record to archived and writes its archive entry in one
    /// transaction. Nothing is written unless both succeed.
    pub fn archive_shift_record(
        &self,
        record: &ShiftRecord,
        sealed: &SealedSnapshot,
        archived_at: DateTime<Utc>,
    ) -> Result<ArchiveOutcome> {
        let entry_id = self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| ShiftError::storage("Failed to begin archival", err))?;

            let flipped = tx
                .execute(
                    "UPDATE shift_records SET \
                        is_active = 0, is_archived = 1, archived_at = ?3, updated_at = ?3, \
                        version = version + 1 \
                     WHERE id = ?1 AND version = ?2 AND is_archived = 0",
                    params![record.id, record.version, ts(archived_at)],
                )
                .map_err(|err| ShiftError::storage("Failed to flip archive flags", err))?;
            if flipped != 1 {
                // Dropping the transaction rolls it back.
                return Ok(None);
            }

            let inserted = tx.execute(
                "INSERT INTO archive_entries \
                    (shift_record_id, machine_id, operator_id, shift_date, shift_type, \
                     snapshot, size_bytes, checksum, archived_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    record.id,
                    record.machine_id,
                    record.operator_id,
                    record.shift_date.to_string(),
                    record.shift_type.as_str(),
                    sealed.payload,
                    sealed.size_bytes,
                    sealed.checksum,
                    ts(archived_at)
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(err) if is_constraint_violation(&err) => return Ok(None),
                Err(err) => return Err(ShiftError::storage("Failed to insert archive entry", err)),
            }
            let entry_id = tx.last_insert_rowid();

            tx.commit()
                .map_err(|err| ShiftError::storage("Failed to commit archival", err))?;
            Ok(Some(entry_id))
        })?;

        match entry_id {
            Some(id) => self
                .get_archive_entry(id)?
                .map(ArchiveOutcome::Archived)
                .ok_or_else(|| ShiftError::storage("Failed to reload archive entry", id)),
            None => Ok(ArchiveOutcome::Conflict),
        }
    }

    // ── Archive entries ──────────────────────────────────────────────────────

    pub fn get_archive_entry(&self, id: i64) -> Result<Option<ArchiveEntry>> {
        let raw = self.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM archive_entries WHERE id = ?1", ARCHIVE_COLUMNS),
                params![id],
                RawArchiveEntry::from_row,
            )
            .optional()
            .map_err(|err| ShiftError::storage("Failed to query archive entry", err))
        })?;
        raw.map(RawArchiveEntry::into_entry).transpose()
    }

    #[cfg(test)]
    pub fn archive_entries_for_record(&self, shift_record_id: i64) -> Result<Vec<ArchiveEntry>> {
        self.query_archive_entries(
            &format!(
                "SELECT {} FROM archive_entries WHERE shift_record_id = ?1 ORDER BY id ASC",
                ARCHIVE_COLUMNS
            ),
            vec![shift_record_id.to_string()],
        )
    }

    pub fn list_archive_entries(&self, filter: &ArchiveFilter) -> Result<Vec<ArchiveEntry>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();

        if let Some(machine_id) = &filter.machine_id {
            values.push(machine_id.clone());
            clauses.push(format!("machine_id = ?{}", values.len()));
        }
        if let Some(operator_id) = &filter.operator_id {
            values.push(operator_id.clone());
            clauses.push(format!("operator_id = ?{}", values.len()));
        }
        if let Some(range) = &filter.date_range {
            values.push(range.from.to_string());
            clauses.push(format!("shift_date >= ?{}", values.len()));
            values.push(range.to.to_string());
            clauses.push(format!("shift_date <= ?{}", values.len()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        self.query_archive_entries(
            &format!(
                "SELECT {} FROM archive_entries {} ORDER BY archived_at ASC, id ASC",
                ARCHIVE_COLUMNS, where_clause
            ),
            values,
        )
    }

    // ── Reporting ────────────────────────────────────────────────────────────

    /// Totals per (machine, operator) over records whose shift date is in range.
    pub fn summarize(&self, range: &DateRange) -> Result<Vec<SummaryRow>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT machine_id, operator_id, COUNT(*), \
                            COALESCE(SUM(total_production), 0), \
                            COALESCE(AVG(efficiency), 0.0), \
                            COALESCE(SUM(downtime_minutes), 0) \
                     FROM shift_records \
                     WHERE shift_date >= ?1 AND shift_date <= ?2 \
                     GROUP BY machine_id, operator_id \
                     ORDER BY machine_id ASC, operator_id ASC",
                )
                .map_err(|err| ShiftError::storage("Failed to prepare summary query", err))?;
            let rows = stmt
                .query_map(params![range.from.to_string(), range.to.to_string()], |row| {
                    Ok(SummaryRow {
                        machine_id: row.get(0)?,
                        operator_id: row.get(1)?,
                        shift_count: row.get(2)?,
                        total_production: row.get(3)?,
                        average_efficiency: row.get(4)?,
                        total_downtime_minutes: row.get(5)?,
                    })
                })
                .map_err(|err| ShiftError::storage("Failed to query summary", err))?;

            let mut summary = Vec::new();
            for row in rows {
                summary.push(
                    row.map_err(|err| ShiftError::storage("Failed to decode summary row", err))?,
                );
            }
            Ok(summary)
        })
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn query_shift_records(&self, sql: &str, values: Vec<String>) -> Result<Vec<ShiftRecord>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|err| ShiftError::storage("Failed to prepare shift record query", err))?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), RawShiftRecord::from_row)
                .map_err(|err| ShiftError::storage("Failed to query shift records", err))?;

            let mut raw = Vec::new();
            for row in rows {
                raw.push(
                    row.map_err(|err| ShiftError::storage("Failed to decode shift record", err))?,
                );
            }
            Ok(raw)
        })?;
        rows.into_iter().map(RawShiftRecord::into_record).collect()
    }

    fn query_archive_entries(&self, sql: &str, values: Vec<String>) -> Result<Vec<ArchiveEntry>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|err| ShiftError::storage("Failed to prepare archive query", err))?;
            let rows = stmt
                .query_map(params_from_iter(values.iter()), RawArchiveEntry::from_row)
                .map_err(|err| ShiftError::storage("Failed to query archive entries", err))?;

            let mut raw = Vec::new();
            for row in rows {
                raw.push(
                    row.map_err(|err| ShiftError::storage("Failed to decode archive entry", err))?,
                );
            }
            Ok(raw)
        })?;
        rows.into_iter().map(RawArchiveEntry::into_entry).collect()
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS events (
                    id TEXT PRIMARY KEY,
                    recorded_at TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    machine_id TEXT NOT NULL,
                    payload TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS machines (
                    machine_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    speed REAL NOT NULL DEFAULT 0,
                    status_changed_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS operations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    machine_id TEXT NOT NULL,
                    operator_id TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    ended_at TEXT
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS operations_open_machine
                    ON operations (machine_id) WHERE ended_at IS NULL;
                 CREATE TABLE IF NOT EXISTS status_history (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    machine_id TEXT NOT NULL,
                    at TEXT NOT NULL,
                    from_status TEXT,
                    to_status TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS status_history_machine_at
                    ON status_history (machine_id, at);
                 CREATE TABLE IF NOT EXISTS shift_records (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    machine_id TEXT NOT NULL,
                    operator_id TEXT NOT NULL,
                    shift_date TEXT NOT NULL,
                    shift_type TEXT NOT NULL,
                    start_time TEXT NOT NULL,
                    end_time TEXT NOT NULL,
                    total_production INTEGER NOT NULL DEFAULT 0,
                    target_production INTEGER NOT NULL DEFAULT 0,
                    efficiency REAL NOT NULL DEFAULT 0,
                    downtime_minutes INTEGER NOT NULL DEFAULT 0,
                    quality_tests INTEGER NOT NULL DEFAULT 0,
                    approved_tests INTEGER NOT NULL DEFAULT 0,
                    rejected_tests INTEGER NOT NULL DEFAULT 0,
                    detail TEXT NOT NULL DEFAULT '{}',
                    is_active INTEGER NOT NULL DEFAULT 1,
                    is_archived INTEGER NOT NULL DEFAULT 0,
                    archived_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    version INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE UNIQUE INDEX IF NOT EXISTS shift_records_open_key
                    ON shift_records (machine_id, operator_id, shift_date, shift_type)
                    WHERE is_active = 1 AND is_archived = 0;
                 CREATE INDEX IF NOT EXISTS shift_records_due
                    ON shift_records (is_active, is_archived, end_time);
                 CREATE TABLE IF NOT EXISTS archive_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    shift_record_id INTEGER NOT NULL UNIQUE REFERENCES shift_records(id),
                    machine_id TEXT NOT NULL,
                    operator_id TEXT NOT NULL,
                    shift_date TEXT NOT NULL,
                    shift_type TEXT NOT NULL,
                    snapshot TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL,
                    checksum TEXT NOT NULL,
                    archived_at TEXT NOT NULL
                 );
                 CREATE TRIGGER IF NOT EXISTS archive_entries_write_once
                    BEFORE UPDATE ON archive_entries
                    BEGIN SELECT RAISE(ABORT, 'archive entries are write-once'); END;
                 COMMIT;",
            )
            .map_err(|err| ShiftError::storage("Failed to initialize schema", err))
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| ShiftError::storage("Failed to create shiftd data dir", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| ShiftError::storage("Failed to open sqlite db", err))?;

        conn.pragma_update(None, "busy_timeout", self.busy_timeout_ms)
            .map_err(|err| ShiftError::storage("Failed to set busy_timeout", err))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| ShiftError::storage("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| ShiftError::storage("Failed to set synchronous", err))?;

        Ok(conn)
    }
}

/// Canonical stored form: UTC, millisecond precision, `Z` suffix. Keeps
/// lexical and chronological order identical for SQL comparisons.
pub fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _) if inner.code == ErrorCode::ConstraintViolation
    )
}

fn parse_status(value: &str) -> Result<MachineStatus> {
    MachineStatus::from_str(value)
        .ok_or_else(|| ShiftError::storage("Unknown machine status", value))
}

fn parse_shift_type(value: &str) -> Result<ShiftType> {
    ShiftType::from_str(value).ok_or_else(|| ShiftError::storage("Unknown shift type", value))
}

fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|err| ShiftError::clock(value, err.to_string()))
}

fn encode_detail(detail: &Detail) -> Result<String> {
    serde_json::to_string(detail).map_err(|source| ShiftError::Serialization {
        context: "encoding shift record detail".to_string(),
        source,
    })
}

fn decode_detail(value: &str) -> Result<Detail> {
    serde_json::from_str(value).map_err(|source| ShiftError::Serialization {
        context: "decoding shift record detail".to_string(),
        source,
    })
}

// Rows are read as raw text first so malformed timestamps surface as
// ClockAmbiguity instead of a generic SQLite conversion error.

struct RawMachine {
    machine_id: String,
    status: String,
    speed: f64,
    status_changed_at: String,
    updated_at: String,
}

impl RawMachine {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            machine_id: row.get(0)?,
            status: row.get(1)?,
            speed: row.get(2)?,
            status_changed_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_machine(self) -> Result<MachineState> {
        Ok(MachineState {
            machine_id: self.machine_id,
            status: parse_status(&self.status)?,
            speed: self.speed,
            status_changed_at: parse_timestamp(&self.status_changed_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct RawShiftRecord {
    id: i64,
    machine_id: String,
    operator_id: String,
    shift_date: String,
    shift_type: String,
    start_time: String,
    end_time: String,
    total_production: i64,
    target_production: i64,
    efficiency: f64,
    downtime_minutes: i64,
    quality_tests: i64,
    approved_tests: i64,
    rejected_tests: i64,
    detail: String,
    is_active: bool,
    is_archived: bool,
    archived_at: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl RawShiftRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            machine_id: row.get(1)?,
            operator_id: row.get(2)?,
            shift_date: row.get(3)?,
            shift_type: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
            total_production: row.get(7)?,
            target_production: row.get(8)?,
            efficiency: row.get(9)?,
            downtime_minutes: row.get(10)?,
            quality_tests: row.get(11)?,
            approved_tests: row.get(12)?,
            rejected_tests: row.get(13)?,
            detail: row.get(14)?,
            is_active: row.get(15)?,
            is_archived: row.get(16)?,
            archived_at: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
            version: row.get(20)?,
        })
    }

    fn into_record(self) -> Result<ShiftRecord> {
        Ok(ShiftRecord {
            id: self.id,
            machine_id: self.machine_id,
            operator_id: self.operator_id,
            shift_date: parse_date(&self.shift_date)?,
            shift_type: parse_shift_type(&self.shift_type)?,
            start_time: parse_timestamp(&self.start_time)?,
            end_time: parse_timestamp(&self.end_time)?,
            total_production: self.total_production,
            target_production: self.target_production,
            efficiency: self.efficiency,
            downtime_minutes: self.downtime_minutes,
            quality_tests: self.quality_tests,
            approved_tests: self.approved_tests,
            rejected_tests: self.rejected_tests,
            detail: decode_detail(&self.detail)?,
            is_active: self.is_active,
            is_archived: self.is_archived,
            archived_at: self.archived_at.as_deref().map(parse_timestamp).transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            version: self.version,
        })
    }
}

struct RawArchiveEntry {
    id: i64,
    shift_record_id: i64,
    machine_id: String,
    operator_id: String,
    shift_date: String,
    shift_type: String,
    snapshot: String,
    size_bytes: i64,
    checksum: String,
    archived_at: String,
}

impl RawArchiveEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            shift_record_id: row.get(1)?,
            machine_id: row.get(2)?,
            operator_id: row.get(3)?,
            shift_date: row.get(4)?,
            shift_type: row.get(5)?,
            snapshot: row.get(6)?,
            size_bytes: row.get(7)?,
            checksum: row.get(8)?,
            archived_at: row.get(9)?,
        })
    }

    fn into_entry(self) -> Result<ArchiveEntry> {
        Ok(ArchiveEntry {
            id: self.id,
            shift_record_id: self.shift_record_id,
            machine_id: self.machine_id,
            operator_id: self.operator_id,
            shift_date: parse_date(&self.shift_date)?,
            shift_type: parse_shift_type(&self.shift_type)?,
            snapshot: self.snapshot,
            size_bytes: self.size_bytes,
            checksum: self.checksum,
            archived_at: parse_timestamp(&self.archived_at)?,
        })
    }
}
