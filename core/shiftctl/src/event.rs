//! Builds operation-lifecycle event envelopes from command-line arguments.

use chrono::{DateTime, Utc};
use clap::Subcommand;
use shiftd_protocol::{EventEnvelope, EventType};

use crate::daemon_client::make_event_id;

#[derive(Subcommand, Debug)]
pub enum EventCommand {
    /// An operator starts working a machine
    Start {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        operator: String,
        /// Units per minute
        #[arg(long)]
        speed: Option<f64>,
        /// Initial machine status (defaults to running)
        #[arg(long)]
        status: Option<String>,
    },

    /// The open operation on a machine ends
    End {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        operator: Option<String>,
    },

    /// Machine status changes (running, idle, stopped, maintenance)
    Status {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        status: String,
    },

    /// Machine speed changes
    Speed {
        #[arg(long)]
        machine: String,
        /// Units per minute
        #[arg(long)]
        speed: f64,
    },

    /// A quality test is recorded against the machine's current shift
    Quality {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        operator: Option<String>,
        /// Mark the test as rejected instead of approved
        #[arg(long)]
        rejected: bool,
    },
}

/// Event envelope for `command`, stamped with `recorded_at` and a fresh id
/// unless one is supplied.
pub fn build_envelope(
    command: EventCommand,
    event_id: Option<String>,
    recorded_at: DateTime<Utc>,
) -> EventEnvelope {
    let mut envelope = EventEnvelope {
        event_id: event_id.unwrap_or_else(make_event_id),
        recorded_at: recorded_at.to_rfc3339(),
        event_type: EventType::OperationStart,
        machine_id: String::new(),
        operator_id: None,
        status: None,
        speed: None,
        passed: None,
    };

    match command {
        EventCommand::Start {
            machine,
            operator,
            speed,
            status,
        } => {
            envelope.machine_id = machine;
            envelope.operator_id = Some(operator);
            envelope.speed = speed;
            envelope.status = status;
        }
        EventCommand::End { machine, operator } => {
            envelope.event_type = EventType::OperationEnd;
            envelope.machine_id = machine;
            envelope.operator_id = operator;
        }
        EventCommand::Status { machine, status } => {
            envelope.event_type = EventType::StatusChange;
            envelope.machine_id = machine;
            envelope.status = Some(status);
        }
        EventCommand::Speed { machine, speed } => {
            envelope.event_type = EventType::SpeedChange;
            envelope.machine_id = machine;
            envelope.speed = Some(speed);
        }
        EventCommand::Quality {
            machine,
            operator,
            rejected,
        } => {
            envelope.event_type = EventType::QualityTest;
            envelope.machine_id = machine;
            envelope.operator_id = operator;
            envelope.passed = Some(!rejected);
        }
    }

    envelope
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 30, 0).single().unwrap()
    }

    #[test]
    fn start_carries_operator_and_speed() {
        let envelope = build_envelope(
            EventCommand::Start {
                machine: "press-01".to_string(),
                operator: "op-ana".to_string(),
                speed: Some(2.5),
                status: None,
            },
            Some("evt-1".to_string()),
            at(),
        );
        assert_eq!(envelope.event_type, EventType::OperationStart);
        assert_eq!(envelope.event_id, "evt-1");
        assert_eq!(envelope.operator_id.as_deref(), Some("op-ana"));
        assert_eq!(envelope.speed, Some(2.5));
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn quality_defaults_to_approved() {
        let envelope = build_envelope(
            EventCommand::Quality {
                machine: "press-01".to_string(),
                operator: None,
                rejected: false,
            },
            None,
            at(),
        );
        assert_eq!(envelope.event_type, EventType::QualityTest);
        assert_eq!(envelope.passed, Some(true));
        assert!(envelope.event_id.starts_with("evt-"));
    }

    #[test]
    fn unknown_status_fails_validation() {
        let envelope = build_envelope(
            EventCommand::Status {
                machine: "press-01".to_string(),
                status: "exploded".to_string(),
            },
            None,
            at(),
        );
        assert!(envelope.validate().is_err());
    }
}
