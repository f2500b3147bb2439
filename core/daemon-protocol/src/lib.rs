//! IPC protocol types and validation for shiftd.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.

use chrono::{DateTime, NaiveDate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shift_core::{MachineStatus, ShiftError};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Event,
    GetCurrentShift,
    UpdateShift,
    ResetOperator,
    ArchiveShift,
    GetArchived,
    GetShiftType,
    GetSummary,
    GetShiftReport,
    Subscribe,
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl From<&ShiftError> for ErrorInfo {
    fn from(err: &ShiftError) -> Self {
        ErrorInfo::new(err.code(), err.to_string())
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Operation-lifecycle events
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum EventType {
    OperationStart,
    OperationEnd,
    StatusChange,
    SpeedChange,
    QualityTest,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EventEnvelope {
    pub event_id: String,
    pub recorded_at: String,
    pub event_type: EventType,
    pub machine_id: String,
    #[serde(default)]
    pub operator_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Units per minute.
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub passed: Option<bool>,
}

impl EventEnvelope {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if self.event_id.trim().is_empty() {
            return Err(ErrorInfo::new("invalid_event_id", "event_id is required"));
        }
        if self.event_id.len() > 128 {
            return Err(ErrorInfo::new(
                "invalid_event_id",
                "event_id must be 128 characters or fewer",
            ));
        }

        if DateTime::parse_from_rfc3339(&self.recorded_at).is_err() {
            return Err(ErrorInfo::new(
                "invalid_timestamp",
                "recorded_at must be RFC3339",
            ));
        }

        require_id(&self.machine_id, "machine_id")?;
        if let Some(speed) = self.speed {
            require_speed(speed)?;
        }

        match self.event_type {
            EventType::OperationStart => {
                require_operator(&self.operator_id)?;
            }
            EventType::OperationEnd => {}
            EventType::StatusChange => {
                require_status(&self.status)?;
            }
            EventType::SpeedChange => {
                if self.speed.is_none() {
                    return Err(ErrorInfo::new("missing_field", "speed is required"));
                }
            }
            EventType::QualityTest => {
                if self.passed.is_none() {
                    return Err(ErrorInfo::new("missing_field", "passed is required"));
                }
            }
        }

        Ok(())
    }

    /// Parsed status; only meaningful after [`EventEnvelope::validate`].
    pub fn machine_status(&self) -> Option<MachineStatus> {
        self.status.as_deref().and_then(MachineStatus::from_str)
    }
}

pub fn parse_event(params: Value) -> Result<EventEnvelope, ErrorInfo> {
    let envelope: EventEnvelope = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("event payload is invalid JSON: {}", err),
        )
    })?;
    envelope.validate()?;
    Ok(envelope)
}

// ─────────────────────────────────────────────────────────────────────────────
// Query parameters
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ShiftParams {
    pub machine_id: String,
    pub operator_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateShiftParams {
    pub machine_id: String,
    pub operator_id: String,
    pub production_delta: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ArchiveShiftParams {
    pub shift_record_id: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SummaryParams {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

/// Decodes and validates method params. Identifiers must be non-blank.
pub fn parse_params<T: DeserializeOwned + ValidateParams>(
    params: Option<Value>,
) -> Result<T, ErrorInfo> {
    let params = params.ok_or_else(|| ErrorInfo::new("invalid_params", "params are required"))?;
    let parsed: T = serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("invalid params: {}", err)))?;
    parsed.validate()?;
    Ok(parsed)
}

pub trait ValidateParams {
    fn validate(&self) -> Result<(), ErrorInfo>;
}

impl ValidateParams for ShiftParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.machine_id, "machine_id")?;
        require_id(&self.operator_id, "operator_id")
    }
}

impl ValidateParams for UpdateShiftParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        require_id(&self.machine_id, "machine_id")?;
        require_id(&self.operator_id, "operator_id")?;
        if self.production_delta < 0 {
            return Err(ErrorInfo::new(
                "invalid_delta",
                "production_delta must be non-negative",
            ));
        }
        Ok(())
    }
}

impl ValidateParams for ArchiveShiftParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        if self.shift_record_id <= 0 {
            return Err(ErrorInfo::new(
                "invalid_params",
                "shift_record_id must be positive",
            ));
        }
        Ok(())
    }
}

impl ValidateParams for SummaryParams {
    fn validate(&self) -> Result<(), ErrorInfo> {
        if self.from > self.to {
            return Err(ErrorInfo::new("invalid_params", "from must not be after to"));
        }
        Ok(())
    }
}

impl ValidateParams for shift_core::ArchiveFilter {
    fn validate(&self) -> Result<(), ErrorInfo> {
        if let Some(range) = &self.date_range {
            if range.from > range.to {
                return Err(ErrorInfo::new(
                    "invalid_params",
                    "date_range.from must not be after date_range.to",
                ));
            }
        }
        Ok(())
    }
}

fn require_id(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    if value.len() > 128 {
        return Err(ErrorInfo::new(
            "invalid_params",
            format!("{} must be 128 characters or fewer", field),
        ));
    }
    Ok(())
}

fn require_operator(value: &Option<String>) -> Result<(), ErrorInfo> {
    match value {
        Some(candidate) => require_id(candidate, "operator_id"),
        None => Err(ErrorInfo::new("missing_field", "operator_id is required")),
    }
}

fn require_status(value: &Option<String>) -> Result<(), ErrorInfo> {
    match value.as_deref() {
        Some(raw) if MachineStatus::from_str(raw).is_some() => Ok(()),
        Some(raw) => Err(ErrorInfo::new(
            "invalid_status",
            format!("unknown machine status: {}", raw),
        )),
        None => Err(ErrorInfo::new("missing_field", "status is required")),
    }
}

fn require_speed(speed: f64) -> Result<(), ErrorInfo> {
    if !speed.is_finite() || speed < 0.0 {
        return Err(ErrorInfo::new(
            "invalid_speed",
            "speed must be a finite, non-negative number",
        ));
    }
    Ok(())
}
