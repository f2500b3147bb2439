//! A DAY shift driven end to end through the public API: window lookup,
//! interval folds across a speed change, then sealing the archive snapshot.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use shift_core::{
    accrue, seal, ArchiveEntry, ArchiveSnapshot, Detail, MachineStatus, ShiftClock, ShiftDelta,
    ShiftRecord, ShiftType,
};

fn at(hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0)
        .single()
        .unwrap()
}

fn open_record(clock: &ShiftClock, now: DateTime<Utc>) -> ShiftRecord {
    let window = clock.window(now);
    ShiftRecord {
        id: 1,
        machine_id: "press-01".to_string(),
        operator_id: "op-ana".to_string(),
        shift_date: window.shift_date,
        shift_type: window.shift_type,
        start_time: window.start,
        end_time: window.end,
        total_production: 0,
        target_production: 1440,
        efficiency: 0.0,
        downtime_minutes: 0,
        quality_tests: 0,
        approved_tests: 0,
        rejected_tests: 0,
        detail: Detail::new(),
        is_active: true,
        is_archived: false,
        archived_at: None,
        created_at: now,
        updated_at: now,
        version: 0,
    }
}

fn fold(record: &mut ShiftRecord, now: DateTime<Utc>, speed: f64) {
    let baseline = record.last_update().unwrap_or(record.start_time);
    let accrual = accrue(baseline, now, speed);
    record.apply_delta(
        &ShiftDelta {
            production: accrual.units,
            status: Some(MachineStatus::Running),
            speed: Some(speed),
            observed_at: Some(accrual.consumed_until),
            ..ShiftDelta::default()
        },
        now,
    );
}

#[test]
fn day_shift_folds_and_seals() {
    let clock = ShiftClock::default();
    let mut record = open_record(&clock, at(7, 0));
    assert_eq!(record.shift_type, ShiftType::Day);
    assert_eq!(record.shift_date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
    assert_eq!(record.end_time, at(19, 0));

    fold(&mut record, at(7, 5), 2.0);
    fold(&mut record, at(7, 10), 2.0);
    assert_eq!(record.total_production, 20);

    // The new speed only applies from the last fold onward.
    fold(&mut record, at(7, 15), 5.0);
    assert_eq!(record.total_production, 45);
    assert_eq!(record.last_status(), Some(MachineStatus::Running));

    let sealed = seal(&ArchiveSnapshot::from_record(&record, at(19, 0))).unwrap();
    let mut entry = ArchiveEntry {
        id: 1,
        shift_record_id: record.id,
        machine_id: record.machine_id.clone(),
        operator_id: record.operator_id.clone(),
        shift_date: record.shift_date,
        shift_type: record.shift_type,
        snapshot: sealed.payload,
        size_bytes: sealed.size_bytes,
        checksum: sealed.checksum,
        archived_at: at(19, 0),
    };
    assert!(entry.verify());
    let snapshot = entry.decode_snapshot().unwrap();
    assert_eq!(snapshot.production.total_production, 45);
    assert_eq!(snapshot.shift.end_time, at(19, 0));

    entry.snapshot = entry.snapshot.replace("45", "46");
    assert!(!entry.verify());
}

#[test]
fn boundary_moves_to_night_window_of_same_date() {
    let clock = ShiftClock::default();
    let day = clock.window(at(18, 59));
    let night = clock.window(at(19, 0));
    assert_eq!(day.end, night.start);
    assert_eq!(night.shift_type, ShiftType::Night);
    assert_eq!(night.shift_date, day.shift_date);
    assert_eq!(clock.next_boundary(at(18, 59)), at(19, 0));
}
