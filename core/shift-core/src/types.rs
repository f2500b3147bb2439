//! Core types for shift production tracking.
//!
//! These types are shared by the daemon, its store and the `shiftctl` client.
//! Timestamps are always UTC; plant-local interpretation lives in [`crate::clock`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Detail keys written on every fold.
pub const DETAIL_LAST_STATUS: &str = "last_status";
pub const DETAIL_LAST_UPDATE: &str = "last_update";
pub const DETAIL_LAST_SPEED: &str = "last_speed";
/// How far downtime has been booked into the record.
pub const DETAIL_DOWNTIME_UNTIL: &str = "downtime_until";

// ═══════════════════════════════════════════════════════════════════════════════
// Shift identity
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShiftType {
    Day,
    Night,
}

impl ShiftType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShiftType::Day => "day",
            ShiftType::Night => "night",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "day" => Some(ShiftType::Day),
            "night" => Some(ShiftType::Night),
            _ => None,
        }
    }
}

/// Identity of a shift record: one (machine, operator) pair in one shift window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShiftKey {
    pub machine_id: String,
    pub operator_id: String,
    pub shift_date: NaiveDate,
    pub shift_type: ShiftType,
}

impl std::fmt::Display for ShiftKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.machine_id,
            self.operator_id,
            self.shift_date,
            self.shift_type.as_str()
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Machine state (consumed from the CRUD layer)
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Running,
    Idle,
    Stopped,
    Maintenance,
}

impl MachineStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, MachineStatus::Running)
    }

    /// Statuses that count towards shift downtime.
    pub fn is_downtime(&self) -> bool {
        matches!(self, MachineStatus::Stopped | MachineStatus::Maintenance)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::Running => "running",
            MachineStatus::Idle => "idle",
            MachineStatus::Stopped => "stopped",
            MachineStatus::Maintenance => "maintenance",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "running" => Some(MachineStatus::Running),
            "idle" => Some(MachineStatus::Idle),
            "stopped" => Some(MachineStatus::Stopped),
            "maintenance" => Some(MachineStatus::Maintenance),
            _ => None,
        }
    }
}

/// One entry of a machine's ordered status-change history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub machine_id: String,
    pub at: DateTime<Utc>,
    pub from: Option<MachineStatus>,
    pub to: MachineStatus,
}

/// Materialized machine view fed by operation-lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineState {
    pub machine_id: String,
    pub status: MachineStatus,
    /// Configured production speed in units per minute.
    pub speed: f64,
    pub status_changed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An operation that has started and not yet ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOperation {
    pub machine_id: String,
    pub operator_id: String,
    pub started_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Detail blob
// ═══════════════════════════════════════════════════════════════════════════════

/// Primitive value stored in a record's detail map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DetailValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl DetailValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DetailValue::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DetailValue::Float(value) => Some(*value),
            DetailValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }
}

/// Opaque structured detail. Ordered so snapshots serialize deterministically.
pub type Detail = BTreeMap<String, DetailValue>;

// ═══════════════════════════════════════════════════════════════════════════════
// Shift record
// ═══════════════════════════════════════════════════════════════════════════════

/// The mutable, currently-accumulating representation of one shift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftRecord {
    pub id: i64,
    pub machine_id: String,
    pub operator_id: String,
    pub shift_date: NaiveDate,
    pub shift_type: ShiftType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub total_production: i64,
    pub target_production: i64,
    pub efficiency: f64,
    pub downtime_minutes: i64,
    pub quality_tests: i64,
    pub approved_tests: i64,
    pub rejected_tests: i64,
    pub detail: Detail,
    pub is_active: bool,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl ShiftRecord {
    pub fn key(&self) -> ShiftKey {
        ShiftKey {
            machine_id: self.machine_id.clone(),
            operator_id: self.operator_id.clone(),
            shift_date: self.shift_date,
            shift_type: self.shift_type,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_active && !self.is_archived
    }

    /// Timestamp of the last production fold, if any has happened.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.detail_time(DETAIL_LAST_UPDATE)
    }

    pub fn downtime_booked_until(&self) -> Option<DateTime<Utc>> {
        self.detail_time(DETAIL_DOWNTIME_UNTIL)
    }

    fn detail_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.detail
            .get(key)
            .and_then(DetailValue::as_text)
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn last_status(&self) -> Option<MachineStatus> {
        self.detail
            .get(DETAIL_LAST_STATUS)
            .and_then(DetailValue::as_text)
            .and_then(MachineStatus::from_str)
    }

    /// Folds a delta into the record. Counters only ever grow.
    pub fn apply_delta(&mut self, delta: &ShiftDelta, now: DateTime<Utc>) {
        self.total_production = self.total_production.saturating_add(delta.production.max(0));
        self.downtime_minutes = self
            .downtime_minutes
            .saturating_add(delta.downtime_minutes.max(0));
        let approved = delta.approved_tests.max(0);
        let rejected = delta.rejected_tests.max(0);
        self.approved_tests = self.approved_tests.saturating_add(approved);
        self.rejected_tests = self.rejected_tests.saturating_add(rejected);
        self.quality_tests = self.quality_tests.saturating_add(approved + rejected);
        self.efficiency = compute_efficiency(self.total_production, self.target_production);

        if let Some(status) = delta.status {
            self.detail.insert(
                DETAIL_LAST_STATUS.to_string(),
                DetailValue::Text(status.as_str().to_string()),
            );
        }
        if let Some(speed) = delta.speed {
            self.detail
                .insert(DETAIL_LAST_SPEED.to_string(), DetailValue::Float(speed));
        }
        if let Some(observed_at) = delta.observed_at {
            self.detail.insert(
                DETAIL_LAST_UPDATE.to_string(),
                DetailValue::Text(observed_at.to_rfc3339()),
            );
        }
        if let Some(until) = delta.downtime_until {
            if self.downtime_booked_until().map_or(true, |booked| until > booked) {
                self.detail.insert(
                    DETAIL_DOWNTIME_UNTIL.to_string(),
                    DetailValue::Text(until.to_rfc3339()),
                );
            }
        }
        self.updated_at = now;
    }
}

/// Production share of the target, clamped to 0..=100. Zero when no target.
pub fn compute_efficiency(total_production: i64, target_production: i64) -> f64 {
    if target_production <= 0 {
        return 0.0;
    }
    let ratio = total_production as f64 / target_production as f64 * 100.0;
    ratio.clamp(0.0, 100.0)
}

/// An additive change to a shift record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShiftDelta {
    #[serde(default)]
    pub production: i64,
    #[serde(default)]
    pub downtime_minutes: i64,
    #[serde(default)]
    pub approved_tests: i64,
    #[serde(default)]
    pub rejected_tests: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MachineStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    /// Moves the record's "last update" baseline when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
    /// Marks downtime as booked up to this instant. Never moves backwards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downtime_until: Option<DateTime<Utc>>,
}

impl ShiftDelta {
    pub fn production(units: i64) -> Self {
        Self {
            production: units,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.production == 0
            && self.downtime_minutes == 0
            && self.approved_tests == 0
            && self.rejected_tests == 0
            && self.status.is_none()
            && self.speed.is_none()
            && self.observed_at.is_none()
            && self.downtime_until.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Queries
// ═══════════════════════════════════════════════════════════════════════════════

/// Inclusive range of shift dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveFilter {
    #[serde(default)]
    pub machine_id: Option<String>,
    #[serde(default)]
    pub operator_id: Option<String>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
}

/// Reporting aggregate for one (machine, operator) pair over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub machine_id: String,
    pub operator_id: String,
    pub shift_count: i64,
    pub total_production: i64,
    pub average_efficiency: f64,
    pub total_downtime_minutes: i64,
}

/// Broadcast after every production fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionUpdate {
    pub record_id: i64,
    pub machine_id: String,
    pub operator_id: String,
    pub shift_date: NaiveDate,
    pub shift_type: ShiftType,
    pub delta: i64,
    pub total_production: i64,
    pub efficiency: f64,
    pub at: DateTime<Utc>,
}

impl ProductionUpdate {
    pub fn from_record(record: &ShiftRecord, delta: i64, at: DateTime<Utc>) -> Self {
        Self {
            record_id: record.id,
            machine_id: record.machine_id.clone(),
            operator_id: record.operator_id.clone(),
            shift_date: record.shift_date,
            shift_type: record.shift_type,
            delta,
            total_production: record.total_production,
            efficiency: record.efficiency,
            at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> ShiftRecord {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).unwrap();
        ShiftRecord {
            id: 1,
            machine_id: "m-1".to_string(),
            operator_id: "op-1".to_string(),
            shift_date: start.date_naive(),
            shift_type: ShiftType::Day,
            start_time: start,
            end_time: Utc.with_ymd_and_hms(2026, 3, 2, 19, 0, 0).unwrap(),
            total_production: 0,
            target_production: 200,
            efficiency: 0.0,
            downtime_minutes: 0,
            quality_tests: 0,
            approved_tests: 0,
            rejected_tests: 0,
            detail: Detail::new(),
            is_active: true,
            is_archived: false,
            archived_at: None,
            created_at: start,
            updated_at: start,
            version: 0,
        }
    }

    #[test]
    fn apply_delta_accumulates_and_tracks_baseline() {
        let mut rec = record();
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 7, 5, 0).unwrap();
        rec.apply_delta(
            &ShiftDelta {
                production: 10,
                status: Some(MachineStatus::Running),
                speed: Some(2.0),
                observed_at: Some(at),
                ..ShiftDelta::default()
            },
            at,
        );
        rec.apply_delta(&ShiftDelta::production(40), at);

        assert_eq!(rec.total_production, 50);
        assert_eq!(rec.efficiency, 25.0);
        assert_eq!(rec.last_update(), Some(at));
        assert_eq!(rec.last_status(), Some(MachineStatus::Running));
    }

    #[test]
    fn apply_delta_never_decreases_counters() {
        let mut rec = record();
        rec.total_production = 30;
        rec.apply_delta(&ShiftDelta::production(-5), rec.updated_at);
        assert_eq!(rec.total_production, 30);
    }

    #[test]
    fn downtime_marker_only_moves_forward() {
        let mut rec = record();
        let later = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap();
        rec.apply_delta(
            &ShiftDelta {
                downtime_minutes: 20,
                downtime_until: Some(later),
                ..ShiftDelta::default()
            },
            later,
        );
        rec.apply_delta(
            &ShiftDelta {
                downtime_until: Some(earlier),
                ..ShiftDelta::default()
            },
            later,
        );
        assert_eq!(rec.downtime_minutes, 20);
        assert_eq!(rec.downtime_booked_until(), Some(later));
    }

    #[test]
    fn quality_counts_roll_into_total_tests() {
        let mut rec = record();
        rec.apply_delta(
            &ShiftDelta {
                approved_tests: 2,
                rejected_tests: 1,
                ..ShiftDelta::default()
            },
            rec.updated_at,
        );
        assert_eq!(rec.quality_tests, 3);
        assert_eq!(rec.approved_tests, 2);
        assert_eq!(rec.rejected_tests, 1);
    }

    #[test]
    fn efficiency_is_clamped_and_zero_without_target() {
        assert_eq!(compute_efficiency(50, 0), 0.0);
        assert_eq!(compute_efficiency(500, 100), 100.0);
        assert_eq!(compute_efficiency(25, 100), 25.0);
    }

    #[test]
    fn detail_values_round_trip_through_json() {
        let mut detail = Detail::new();
        detail.insert("flag".to_string(), DetailValue::Bool(true));
        detail.insert("count".to_string(), DetailValue::Int(3));
        detail.insert("speed".to_string(), DetailValue::Float(2.5));
        detail.insert("status".to_string(), DetailValue::Text("running".to_string()));

        let json = serde_json::to_string(&detail).unwrap();
        let parsed: Detail = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, detail);
    }
}
