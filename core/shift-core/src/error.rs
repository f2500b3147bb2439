//! Error types for shift tracking operations.
//! Variant names are part of the daemon's IPC error codes; keep them stable.

/// All errors that can occur while tracking or archiving shift production.
#[derive(Debug, thiserror::Error)]
pub enum ShiftError {
    // ─────────────────────────────────────────────────────────────────────
    // Lookup Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Shift record not found: {0}")]
    ShiftRecordNotFound(i64),

    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    #[error("No open operation for machine {machine_id}")]
    NoOpenOperation { machine_id: String },

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle Errors
    // ─────────────────────────────────────────────────────────────────────
    /// Archiving is a one-time terminal transition.
    #[error("Shift record {id} is already archived")]
    AlreadyArchived { id: i64 },

    /// Optimistic concurrency retries exhausted.
    #[error("Stale write on shift record {id} after {attempts} attempts")]
    StaleWrite { id: i64, attempts: u32 },

    #[error("Production delta must be non-negative, got {0}")]
    InvalidDelta(i64),

    /// An event that is missing a field its type requires.
    #[error("Invalid event {event_id}: {reason}")]
    InvalidEvent { event_id: String, reason: String },

    /// One machine's update failed inside a realtime tick.
    #[error("Tick update failed for machine {machine_id} / operator {operator_id}: {details}")]
    PartialTickFailure {
        machine_id: String,
        operator_id: String,
        details: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Clock Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Timestamp does not classify cleanly: {value}: {reason}")]
    ClockAmbiguity { value: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Infrastructure Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage error: {context}: {details}")]
    Storage { context: String, details: String },

    #[error("Serialization error: {context}: {source}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration invalid: {0}")]
    Config(String),
}

impl ShiftError {
    pub fn storage(context: &str, details: impl std::fmt::Display) -> Self {
        ShiftError::Storage {
            context: context.to_string(),
            details: details.to_string(),
        }
    }

    pub fn invalid_event(event_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ShiftError::InvalidEvent {
            event_id: event_id.into(),
            reason: reason.into(),
        }
    }

    pub fn clock(value: impl Into<String>, reason: impl Into<String>) -> Self {
        ShiftError::ClockAmbiguity {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable code used in IPC error responses.
    pub fn code(&self) -> &'static str {
        match self {
            ShiftError::ShiftRecordNotFound(_)
            | ShiftError::MachineNotFound(_)
            | ShiftError::NoOpenOperation { .. } => "not_found",
            ShiftError::AlreadyArchived { .. } => "already_archived",
            ShiftError::StaleWrite { .. } => "stale_write",
            ShiftError::InvalidDelta(_) => "invalid_delta",
            ShiftError::InvalidEvent { .. } => "invalid_event",
            ShiftError::PartialTickFailure { .. } => "partial_tick_failure",
            ShiftError::ClockAmbiguity { .. } => "clock_ambiguity",
            ShiftError::Storage { .. } => "storage_error",
            ShiftError::Serialization { .. } => "serialization_error",
            ShiftError::Config(_) => "config_error",
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == "not_found"
    }
}

/// Convenience type alias for Results using ShiftError.
pub type Result<T> = std::result::Result<T, ShiftError>;

// Conversion for string error compatibility
impl From<ShiftError> for String {
    fn from(err: ShiftError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_errors_share_not_found_code() {
        assert_eq!(ShiftError::ShiftRecordNotFound(7).code(), "not_found");
        assert_eq!(
            ShiftError::MachineNotFound("m-1".to_string()).code(),
            "not_found"
        );
        assert!(ShiftError::NoOpenOperation {
            machine_id: "m-1".to_string()
        }
        .is_not_found());
    }

    #[test]
    fn invalid_event_is_not_a_lookup_error() {
        let err = ShiftError::invalid_event("evt-1", "missing machine status");
        assert_eq!(err.code(), "invalid_event");
        assert!(!err.is_not_found());
    }

    #[test]
    fn already_archived_is_distinct_from_stale_write() {
        let archived = ShiftError::AlreadyArchived { id: 3 };
        let stale = ShiftError::StaleWrite { id: 3, attempts: 5 };
        assert_ne!(archived.code(), stale.code());
        assert_eq!(archived.to_string(), "Shift record 3 is already archived");
    }
}
