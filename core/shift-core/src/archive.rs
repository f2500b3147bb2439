//! Immutable archive snapshots.
//!
//! A snapshot is encoded once, when its shift record is archived, and the
//! encoded bytes are what gets stored and checksummed. Verification always
//! hashes the stored bytes, never a re-encoding, so the checksum stays a
//! byte-level contract even if the snapshot types gain fields later.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, ShiftError};
use crate::types::{Detail, ShiftRecord, ShiftType};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftMetadata {
    pub record_id: i64,
    pub machine_id: String,
    pub operator_id: String,
    pub shift_date: NaiveDate,
    pub shift_type: ShiftType,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductionMetrics {
    pub total_production: i64,
    pub target_production: i64,
    pub efficiency: f64,
    pub downtime_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub quality_tests: i64,
    pub approved_tests: i64,
    pub rejected_tests: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSnapshot {
    pub version: u32,
    pub shift: ShiftMetadata,
    pub production: ProductionMetrics,
    pub quality: QualityMetrics,
    pub detail: Detail,
    pub archived_at: DateTime<Utc>,
}

impl ArchiveSnapshot {
    pub fn from_record(record: &ShiftRecord, archived_at: DateTime<Utc>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            shift: ShiftMetadata {
                record_id: record.id,
                machine_id: record.machine_id.clone(),
                operator_id: record.operator_id.clone(),
                shift_date: record.shift_date,
                shift_type: record.shift_type,
                start_time: record.start_time,
                end_time: record.end_time,
                created_at: record.created_at,
            },
            production: ProductionMetrics {
                total_production: record.total_production,
                target_production: record.target_production,
                efficiency: record.efficiency,
                downtime_minutes: record.downtime_minutes,
            },
            quality: QualityMetrics {
                quality_tests: record.quality_tests,
                approved_tests: record.approved_tests,
                rejected_tests: record.rejected_tests,
            },
            detail: record.detail.clone(),
            archived_at,
        }
    }
}

/// Encoded snapshot ready to be written alongside the archival flag flip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSnapshot {
    pub payload: String,
    pub size_bytes: i64,
    pub checksum: String,
}

pub fn seal(snapshot: &ArchiveSnapshot) -> Result<SealedSnapshot> {
    let payload = serde_json::to_string(snapshot).map_err(|source| ShiftError::Serialization {
        context: format!("encoding snapshot for record {}", snapshot.shift.record_id),
        source,
    })?;
    Ok(SealedSnapshot {
        size_bytes: payload.len() as i64,
        checksum: checksum(payload.as_bytes()),
        payload,
    })
}

/// Lowercase hex SHA-256.
pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Immutable historical record of one archived shift.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub id: i64,
    pub shift_record_id: i64,
    pub machine_id: String,
    pub operator_id: String,
    pub shift_date: NaiveDate,
    pub shift_type: ShiftType,
    pub snapshot: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub archived_at: DateTime<Utc>,
}

impl ArchiveEntry {
    pub fn verify(&self) -> bool {
        self.size_bytes == self.snapshot.len() as i64
            && checksum(self.snapshot.as_bytes()) == self.checksum
    }

    pub fn decode_snapshot(&self) -> Result<ArchiveSnapshot> {
        serde_json::from_str(&self.snapshot).map_err(|source| ShiftError::Serialization {
            context: format!("decoding archive entry {}", self.id),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DetailValue;
    use chrono::TimeZone;

    fn record() -> ShiftRecord {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 7, 0, 0).single().unwrap();
        let mut detail = Detail::new();
        detail.insert(
            "last_status".to_string(),
            DetailValue::Text("running".to_string()),
        );
        ShiftRecord {
            id: 42,
            machine_id: "m-1".to_string(),
            operator_id: "op-1".to_string(),
            shift_date: start.date_naive(),
            shift_type: ShiftType::Day,
            start_time: start,
            end_time: Utc.with_ymd_and_hms(2026, 3, 2, 19, 0, 0).single().unwrap(),
            total_production: 1_250,
            target_production: 1_440,
            efficiency: 86.8,
            downtime_minutes: 35,
            quality_tests: 4,
            approved_tests: 3,
            rejected_tests: 1,
            detail,
            is_active: true,
            is_archived: false,
            archived_at: None,
            created_at: start,
            updated_at: start,
            version: 9,
        }
    }

    fn entry_for(sealed: &SealedSnapshot) -> ArchiveEntry {
        let rec = record();
        ArchiveEntry {
            id: 1,
            shift_record_id: rec.id,
            machine_id: rec.machine_id,
            operator_id: rec.operator_id,
            shift_date: rec.shift_date,
            shift_type: rec.shift_type,
            snapshot: sealed.payload.clone(),
            size_bytes: sealed.size_bytes,
            checksum: sealed.checksum.clone(),
            archived_at: rec.end_time,
        }
    }

    #[test]
    fn sealed_snapshot_verifies_and_decodes() {
        let rec = record();
        let snapshot = ArchiveSnapshot::from_record(&rec, rec.end_time);
        let sealed = seal(&snapshot).unwrap();
        let entry = entry_for(&sealed);

        assert!(entry.verify());
        let decoded = entry.decode_snapshot().unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(checksum(entry.snapshot.as_bytes()), entry.checksum);
        assert_eq!(decoded.production.total_production, 1_250);
    }

    #[test]
    fn tampered_snapshot_fails_verification() {
        let rec = record();
        let sealed = seal(&ArchiveSnapshot::from_record(&rec, rec.end_time)).unwrap();
        let mut entry = entry_for(&sealed);
        entry.snapshot = entry.snapshot.replace("1250", "9999");
        assert!(!entry.verify());
    }

    #[test]
    fn sealing_is_deterministic() {
        let rec = record();
        let snapshot = ArchiveSnapshot::from_record(&rec, rec.end_time);
        assert_eq!(seal(&snapshot).unwrap(), seal(&snapshot).unwrap());
    }

    #[test]
    fn checksum_is_lowercase_sha256_hex() {
        assert_eq!(
            checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
