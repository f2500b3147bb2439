//! shiftctl: command-line client for the shiftd daemon.
//!
//! ## Subcommands
//!
//! - `event`: report an operation-lifecycle event (start, end, status, speed, quality)
//! - `current`, `update`, `reset`, `archive`, `archived`: shift record operations
//! - `shift-type`, `summary`, `report`: read-only queries
//! - `subscribe`: stream production updates as they happen
//! - `health`, `shutdown`: daemon control

mod daemon_client;
mod event;

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use shift_core::ProductionUpdate;
use shiftd_protocol::Method;
use tracing_subscriber::EnvFilter;

use event::EventCommand;

#[derive(Parser)]
#[command(name = "shiftctl")]
#[command(about = "Shift production tracker client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report a machine event
    Event {
        #[command(subcommand)]
        event: EventCommand,

        /// Explicit event id (retries with the same id are deduplicated)
        #[arg(long, global = true)]
        event_id: Option<String>,

        /// Event time as RFC3339 (defaults to now)
        #[arg(long, global = true)]
        at: Option<DateTime<Utc>>,
    },

    /// Show the current shift record for a machine and operator
    Current {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        operator: String,
    },

    /// Add manually counted production to the current shift record
    Update {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        operator: String,
        #[arg(long, allow_hyphen_values = true)]
        delta: i64,
    },

    /// Close out an operator's current record and start a fresh one
    Reset {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        operator: String,
    },

    /// Archive a shift record by id
    Archive {
        #[arg(value_name = "SHIFT_RECORD_ID")]
        shift_record_id: i64,
    },

    /// List archive entries
    Archived {
        #[arg(long)]
        machine: Option<String>,
        #[arg(long)]
        operator: Option<String>,
        /// First shift date (YYYY-MM-DD), requires --to
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        /// Last shift date (YYYY-MM-DD), requires --from
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },

    /// Show the shift window in effect now
    ShiftType,

    /// Production totals per machine and operator over a date range
    Summary {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },

    /// Current shift record plus windowed machine status
    Report {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        operator: String,
    },

    /// Stream production updates
    Subscribe {
        /// Stop after this many updates
        #[arg(long)]
        count: Option<usize>,
        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Check that the daemon is up
    Health,

    /// Ask the daemon to stop after draining background jobs
    Shutdown,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(err) = run(cli.command) {
        tracing::error!(error = %err, "shiftctl failed");
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("SHIFTCTL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Commands) -> Result<(), String> {
    let data = match command {
        Commands::Event {
            event,
            event_id,
            at,
        } => {
            let envelope = event::build_envelope(event, event_id, at.unwrap_or_else(Utc::now));
            daemon_client::send_event(&envelope)?
        }
        Commands::Current { machine, operator } => daemon_client::call(
            Method::GetCurrentShift,
            Some(pair(&machine, &operator)),
        )?,
        Commands::Update {
            machine,
            operator,
            delta,
        } => daemon_client::call(
            Method::UpdateShift,
            Some(json!({
                "machine_id": machine,
                "operator_id": operator,
                "production_delta": delta,
            })),
        )?,
        Commands::Reset { machine, operator } => daemon_client::call(
            Method::ResetOperator,
            Some(pair(&machine, &operator)),
        )?,
        Commands::Archive { shift_record_id } => daemon_client::call(
            Method::ArchiveShift,
            Some(json!({ "shift_record_id": shift_record_id })),
        )?,
        Commands::Archived {
            machine,
            operator,
            from,
            to,
        } => {
            let mut filter = json!({});
            if let Some(machine) = machine {
                filter["machine_id"] = json!(machine);
            }
            if let Some(operator) = operator {
                filter["operator_id"] = json!(operator);
            }
            if let (Some(from), Some(to)) = (from, to) {
                filter["date_range"] = json!({ "from": from, "to": to });
            }
            daemon_client::call(Method::GetArchived, Some(filter))?
        }
        Commands::ShiftType => daemon_client::call(Method::GetShiftType, None)?,
        Commands::Summary { from, to } => daemon_client::call(
            Method::GetSummary,
            Some(json!({ "from": from, "to": to })),
        )?,
        Commands::Report { machine, operator } => daemon_client::call(
            Method::GetShiftReport,
            Some(pair(&machine, &operator)),
        )?,
        Commands::Subscribe { count, json } => return stream(count, json),
        Commands::Health => daemon_client::call(Method::GetHealth, None)?,
        Commands::Shutdown => daemon_client::call(Method::Shutdown, None)?,
    };

    print_json(&data)
}

fn pair(machine: &str, operator: &str) -> Value {
    json!({ "machine_id": machine, "operator_id": operator })
}

fn print_json(value: &Value) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| format!("Failed to render response: {}", err))?;
    println!("{}", rendered);
    Ok(())
}

fn stream(count: Option<usize>, raw: bool) -> Result<(), String> {
    let mut seen = 0usize;
    daemon_client::subscribe(|update| {
        if raw {
            println!("{}", update);
        } else {
            match serde_json::from_value::<ProductionUpdate>(update.clone()) {
                Ok(update) => println!("{}", format_update(&update)),
                Err(_) => println!("{}", update),
            }
        }
        seen += 1;
        count.map_or(true, |limit| seen < limit)
    })
}

fn format_update(update: &ProductionUpdate) -> String {
    format!(
        "{} {}/{} {} {} +{} total={} efficiency={:.1}%",
        update.at.format("%H:%M:%S"),
        update.machine_id,
        update.operator_id,
        update.shift_date,
        update.shift_type.as_str(),
        update.delta,
        update.total_production,
        update.efficiency,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clap::CommandFactory;
    use shift_core::ShiftType;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn event_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from([
            "shiftctl",
            "event",
            "speed",
            "--machine",
            "press-01",
            "--speed",
            "3.5",
            "--event-id",
            "evt-7",
        ])
        .unwrap();
        match cli.command {
            Commands::Event {
                event: EventCommand::Speed { machine, speed },
                event_id,
                ..
            } => {
                assert_eq!(machine, "press-01");
                assert_eq!(speed, 3.5);
                assert_eq!(event_id.as_deref(), Some("evt-7"));
            }
            _ => panic!("expected speed event"),
        }
    }

    #[test]
    fn archived_date_bounds_must_come_together() {
        assert!(Cli::try_parse_from(["shiftctl", "archived", "--from", "2026-03-01"]).is_err());
        assert!(Cli::try_parse_from([
            "shiftctl",
            "archived",
            "--from",
            "2026-03-01",
            "--to",
            "2026-03-07"
        ])
        .is_ok());
    }

    #[test]
    fn update_line_is_compact() {
        let update = ProductionUpdate {
            record_id: 4,
            machine_id: "press-01".to_string(),
            operator_id: "op-ana".to_string(),
            shift_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            shift_type: ShiftType::Day,
            delta: 10,
            total_production: 120,
            efficiency: 8.333,
            at: Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).single().unwrap(),
        };
        assert_eq!(
            format_update(&update),
            "09:15:00 press-01/op-ana 2026-03-02 day +10 total=120 efficiency=8.3%"
        );
    }
}
