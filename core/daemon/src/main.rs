//! shiftd entrypoint.
//!
//! A single-writer service that owns shift production state: a Unix socket
//! listener with strict request validation, a SQLite store of shift records
//! and archive entries, and two background loops (the production ticker and
//! the boundary sweeper).

use chrono::Utc;
use fs_err as fs;
use serde::Serialize;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shift_core::{ArchiveFilter, DateRange};
use shiftd_protocol::{
    parse_event, parse_params, ArchiveShiftParams, ErrorInfo, Method, Request, Response,
    ShiftParams, SummaryParams, UpdateShiftParams, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod archival;
mod config;
mod db;
mod detector;
mod registry;
mod scheduler;
mod service;
mod store;
mod sweeper;
mod ticker;

use config::DaemonConfig;
use db::Db;
use registry::SubscriberRegistry;
use scheduler::ShutdownSignal;
use service::ShiftService;

const SOCKET_NAME: &str = "daemon.sock";
const DB_NAME: &str = "shiftd.db";
const READ_TIMEOUT_SECS: u64 = 2;
const WRITE_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;
const ACCEPT_POLL_MILLIS: u64 = 50;
const SUBSCRIBER_POLL_MILLIS: u64 = 500;

struct Daemon {
    service: ShiftService,
    config: DaemonConfig,
    shutdown: ShutdownSignal,
}

fn main() {
    init_logging();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let config = match config::load_runtime_config(None) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load shiftd config; using defaults");
            DaemonConfig::default()
        }
    };
    let clock = match config.shift_clock() {
        Ok(clock) => clock,
        Err(err) => {
            error!(error = %err, "Invalid shift clock configuration");
            std::process::exit(1);
        }
    };
    info!(
        day_start = %clock.day_start(),
        night_start = %clock.night_start(),
        utc_offset_minutes = config.clock.utc_offset_minutes,
        tick_interval_secs = config.ticker.interval_secs,
        "shiftd config loaded"
    );

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::with_busy_timeout(db_path, config.store.busy_timeout_ms) {
        Ok(db) => Arc::new(db),
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let service = ShiftService::new(
        db,
        clock,
        config.max_write_retries(),
        Arc::new(SubscriberRegistry::new()),
    );
    let daemon = Arc::new(Daemon {
        service,
        config,
        shutdown: ShutdownSignal::new(),
    });

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };
    if let Err(err) = listener.set_nonblocking(true) {
        error!(error = %err, "Failed to configure daemon socket");
        std::process::exit(1);
    }

    info!(path = %socket_path.display(), "shiftd started");

    let jobs = spawn_background_jobs(&daemon);
    accept_loop(&listener, &daemon);

    info!("Shutdown requested; draining background jobs");
    scheduler::join_all(jobs);
    let _ = remove_existing_socket(&socket_path);
    info!("shiftd stopped");
}

fn accept_loop(listener: &UnixListener, daemon: &Arc<Daemon>) {
    while !daemon.shutdown.is_triggered() {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    warn!(error = %err, "Failed to configure daemon connection");
                    continue;
                }
                let daemon = Arc::clone(daemon);
                thread::spawn(move || handle_connection(stream, daemon));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                daemon
                    .shutdown
                    .wait_timeout(Duration::from_millis(ACCEPT_POLL_MILLIS));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn spawn_background_jobs(daemon: &Arc<Daemon>) -> Vec<(&'static str, thread::JoinHandle<()>)> {
    let mut jobs = Vec::new();
    let ticker = Arc::new(daemon.service.ticker());
    let sweeper = Arc::new(
        daemon
            .service
            .sweeper(daemon.config.sweep_grace(), daemon.config.sweep_recheck_interval()),
    );

    if daemon.config.sweeper.enabled {
        // Catch up on windows that ended while the daemon was down, after
        // settling what active machines did before those boundaries.
        let now = Utc::now();
        if let Err(err) = ticker.tick(now) {
            warn!(error = %err, "Startup settlement tick failed");
        }
        if let Err(err) = sweeper.run_once(now) {
            warn!(error = %err, "Startup sweep failed");
        }

        let delay_sweeper = Arc::clone(&sweeper);
        let job_ticker = Arc::clone(&ticker);
        let spawned = scheduler::spawn_periodic(
            "sweeper",
            daemon.shutdown.clone(),
            move || delay_sweeper.delay_until_next(Utc::now()),
            move || {
                let now = Utc::now();
                // Running machines settle their pre-boundary output first.
                if let Err(err) = job_ticker.tick(now) {
                    warn!(error = %err, "Pre-sweep tick failed");
                }
                if let Err(err) = sweeper.run_once(now) {
                    warn!(error = %err, "Boundary sweep failed");
                }
            },
        );
        match spawned {
            Ok(handle) => jobs.push(("sweeper", handle)),
            Err(err) => error!(error = %err, "Failed to spawn boundary sweeper"),
        }
    }

    if daemon.config.ticker.enabled {
        let interval = daemon.config.tick_interval();
        let spawned = scheduler::spawn_periodic(
            "ticker",
            daemon.shutdown.clone(),
            move || interval,
            move || {
                if let Err(err) = ticker.tick(Utc::now()) {
                    warn!(error = %err, "Production tick failed");
                }
            },
        );
        match spawned {
            Ok(handle) => jobs.push(("ticker", handle)),
            Err(err) => error!(error = %err, "Failed to spawn production ticker"),
        }
    }

    jobs
}

fn init_logging() {
    let debug_enabled = env::var("SHIFTD_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn shiftd_home() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".shiftd"))
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    Ok(shiftd_home()?.join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    Ok(shiftd_home()?.join(DB_NAME))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, daemon: Arc<Daemon>) {
    let _ = stream.set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)));
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");

    if request.method == Method::Subscribe && request.protocol_version == PROTOCOL_VERSION {
        stream_updates(stream, request.id, &daemon);
        return;
    }

    let method = request.method;
    let response = handle_request(request, &daemon);
    let accepted = response.ok;
    let _ = write_response(&mut stream, response);

    // Stop only after the caller has its acknowledgement.
    if method == Method::Shutdown && accepted {
        daemon.shutdown.trigger();
    }
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, daemon: &Daemon) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let service = &daemon.service;
    let now = Utc::now();

    match request.method {
        Method::GetHealth => {
            let window = service.get_current_shift_type(now);
            let events_recorded = match service.events_recorded() {
                Ok(count) => count,
                Err(err) => return respond::<()>(request.id, Err(err)),
            };
            let data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "tick_interval_secs": daemon.config.ticker.interval_secs,
                "subscribers": service.registry().len(),
                "events_recorded": events_recorded,
                "shift_type": window.shift_type,
                "shift_date": window.shift_date,
            });
            Response::ok(request.id, data)
        }
        Method::Event => {
            let params = match request.params {
                Some(params) => params,
                None => {
                    return Response::error(
                        request.id,
                        "invalid_params",
                        "event payload is required",
                    )
                }
            };
            let event = match parse_event(params) {
                Ok(event) => event,
                Err(err) => return Response::error_with_info(request.id, err),
            };
            info!(
                event_id = %event.event_id,
                event_type = ?event.event_type,
                machine_id = %event.machine_id,
                operator_id = ?event.operator_id,
                "Received event"
            );
            respond(request.id, service.handle_event(&event))
        }
        Method::GetCurrentShift => match parse_params::<ShiftParams>(request.params) {
            Ok(params) => respond(
                request.id,
                service.get_current_shift_data(&params.machine_id, &params.operator_id, now),
            ),
            Err(err) => Response::error_with_info(request.id, err),
        },
        Method::UpdateShift => match parse_params::<UpdateShiftParams>(request.params) {
            Ok(params) => respond(
                request.id,
                service.create_or_update_shift_data(
                    &params.machine_id,
                    &params.operator_id,
                    params.production_delta,
                    now,
                ),
            ),
            Err(err) => Response::error_with_info(request.id, err),
        },
        Method::ResetOperator => match parse_params::<ShiftParams>(request.params) {
            Ok(params) => respond(
                request.id,
                service.reset_operator_data(&params.machine_id, &params.operator_id, now),
            ),
            Err(err) => Response::error_with_info(request.id, err),
        },
        Method::ArchiveShift => match parse_params::<ArchiveShiftParams>(request.params) {
            Ok(params) => respond(
                request.id,
                service.archive_shift_data(params.shift_record_id, now),
            ),
            Err(err) => Response::error_with_info(request.id, err),
        },
        Method::GetArchived => {
            let filter = match request.params {
                None => Ok(ArchiveFilter::default()),
                params => parse_params::<ArchiveFilter>(params),
            };
            match filter {
                Ok(filter) => respond(request.id, service.get_archived_data(&filter)),
                Err(err) => Response::error_with_info(request.id, err),
            }
        }
        Method::GetShiftType => respond(request.id, Ok(service.get_current_shift_type(now))),
        Method::GetSummary => match parse_params::<SummaryParams>(request.params) {
            Ok(params) => respond(
                request.id,
                service.summarize(&DateRange {
                    from: params.from,
                    to: params.to,
                }),
            ),
            Err(err) => Response::error_with_info(request.id, err),
        },
        Method::GetShiftReport => match parse_params::<ShiftParams>(request.params) {
            Ok(params) => respond(
                request.id,
                service.shift_report(&params.machine_id, &params.operator_id, now),
            ),
            Err(err) => Response::error_with_info(request.id, err),
        },
        Method::Subscribe => Response::error(
            request.id,
            "invalid_request",
            "subscribe is handled as a streaming connection",
        ),
        Method::Shutdown => {
            info!("Shutdown requested over IPC");
            Response::ok(request.id, serde_json::json!({ "stopping": true }))
        }
    }
}

fn respond<T: Serialize>(id: Option<String>, result: shift_core::Result<T>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                "serialization_error",
                format!("Failed to serialize response: {}", err),
            ),
        },
        Err(err) => {
            if !err.is_not_found() {
                warn!(code = err.code(), error = %err, "Request failed");
            }
            Response::error_with_info(id, ErrorInfo::from(&err))
        }
    }
}

/// Keeps the connection open and writes one production update per line until
/// the client goes away or the daemon shuts down.
fn stream_updates(mut stream: UnixStream, id: Option<String>, daemon: &Daemon) {
    let registry = daemon.service.registry();
    let (subscriber_id, receiver) = registry.register();

    let ack = Response::ok(
        id,
        serde_json::json!({ "subscribed": true, "subscriber_id": subscriber_id }),
    );
    if write_response(&mut stream, ack).is_err() {
        registry.unregister(subscriber_id);
        return;
    }

    loop {
        match receiver.recv_timeout(Duration::from_millis(SUBSCRIBER_POLL_MILLIS)) {
            Ok(update) => {
                let line = match serde_json::to_string(&update) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, "Failed to serialize production update");
                        continue;
                    }
                };
                let written = stream
                    .write_all(line.as_bytes())
                    .and_then(|_| stream.write_all(b"\n"))
                    .and_then(|_| stream.flush());
                if let Err(err) = written {
                    tracing::debug!(subscriber_id, error = %err, "Subscriber went away");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if daemon.shutdown.is_triggered() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    registry.unregister(subscriber_id);
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
