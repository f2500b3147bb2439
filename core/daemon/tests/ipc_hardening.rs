use chrono::Utc;
use shiftd_protocol::{
    EventEnvelope, EventType, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(home: &Path) -> Child {
    let config_dir = home.join(".shiftd");
    fs::create_dir_all(&config_dir).expect("create config dir");
    fs::write(config_dir.join("config.toml"), "[ticker]\nenabled = false\n")
        .expect("write config");

    Command::new(env!("CARGO_BIN_EXE_shiftd"))
        .env("HOME", home)
        .env_remove("SHIFTD_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn shiftd")
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".shiftd").join("daemon.sock")
}

fn db_path(home: &Path) -> PathBuf {
    home.join(".shiftd").join("shiftd.db")
}

fn can_bind_socket(home: &Path) -> bool {
    let check_path = home.join("bind-check.sock");
    match UnixListener::bind(&check_path) {
        Ok(listener) => {
            drop(listener);
            let _ = fs::remove_file(&check_path);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(_) => true,
    }
}

fn temp_home(prefix: &str) -> Option<tempfile::TempDir> {
    let home = tempfile::Builder::new()
        .prefix(prefix)
        .tempdir_in("/tmp")
        .expect("failed to create temp HOME");
    if !can_bind_socket(home.path()) {
        eprintln!("Skipping {}: unix socket binding not permitted in this environment.", prefix);
        return None;
    }
    Some(home)
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for daemon socket at {}", path.display());
}

fn send_request(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    serde_json::to_writer(&mut stream, &request).expect("failed to serialize request");
    stream.write_all(b"\n").expect("failed to write request");
    stream.flush().expect("failed to flush request");
    read_response(&mut stream)
}

fn send_raw_request(socket: &Path, payload: &[u8]) -> Response {
    let mut stream = UnixStream::connect(socket).expect("failed to connect to daemon socket");
    // The daemon may answer and close before the whole payload is written.
    let _ = stream.write_all(payload);
    let _ = stream.flush();
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("failed to parse response JSON")
}

fn health(socket: &Path, id: &str) -> Response {
    send_request(
        socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetHealth,
            id: Some(id.to_string()),
            params: None,
        },
    )
}

fn error_code(response: &Response) -> Option<&str> {
    response.error.as_ref().map(|err| err.code.as_str())
}

#[test]
fn daemon_handles_malformed_payload_flood_without_losing_health() {
    let Some(home) = temp_home("shiftd-hardening-malformed") else {
        return;
    };

    let socket = socket_path(home.path());
    let _guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    for _ in 0..128 {
        let response = send_raw_request(&socket, b"{\"bad_json\": true\n");
        assert!(!response.ok, "malformed payload must be rejected");
        assert_eq!(error_code(&response), Some("invalid_json"));
    }

    let response = health(&socket, "health-after-malformed-flood");
    assert!(
        response.ok,
        "daemon should remain healthy after malformed flood"
    );
}

#[test]
fn daemon_rejects_oversized_and_mismatched_requests() {
    let Some(home) = temp_home("shiftd-hardening-limits") else {
        return;
    };

    let socket = socket_path(home.path());
    let _guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    let oversized = vec![b'a'; MAX_REQUEST_BYTES + 1024];
    let response = send_raw_request(&socket, &oversized);
    assert_eq!(error_code(&response), Some("request_too_large"));

    let mismatch = send_request(
        &socket,
        Request {
            protocol_version: PROTOCOL_VERSION + 1,
            method: Method::GetHealth,
            id: Some("mismatch".to_string()),
            params: None,
        },
    );
    assert_eq!(error_code(&mismatch), Some("protocol_mismatch"));

    let unknown = send_raw_request(
        &socket,
        b"{\"protocol_version\":1,\"method\":\"drop_tables\"}\n",
    );
    assert_eq!(error_code(&unknown), Some("invalid_json"));

    let blank_machine = send_request(
        &socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetCurrentShift,
            id: Some("blank".to_string()),
            params: Some(serde_json::json!({ "machine_id": " ", "operator_id": "op-1" })),
        },
    );
    assert_eq!(error_code(&blank_machine), Some("missing_field"));

    let missing_params = send_request(
        &socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::ArchiveShift,
            id: Some("no-params".to_string()),
            params: None,
        },
    );
    assert_eq!(error_code(&missing_params), Some("invalid_params"));

    assert!(health(&socket, "health-after-limits").ok);
}

#[test]
fn daemon_idle_connection_returns_read_timeout_error() {
    let Some(home) = temp_home("shiftd-hardening-timeout") else {
        return;
    };

    let socket = socket_path(home.path());
    let _guard = DaemonGuard {
        child: spawn_daemon(home.path()),
    };
    wait_for_socket(&socket, Duration::from_secs(5));

    let mut idle = UnixStream::connect(&socket).expect("failed to connect idle stream");
    let response = read_response(&mut idle);
    assert!(!response.ok, "idle request should return an error");
    assert_eq!(error_code(&response), Some("read_timeout"));
}

#[test]
fn daemon_restart_keeps_records_and_event_dedup() {
    let Some(home) = temp_home("shiftd-hardening-restart") else {
        return;
    };

    let socket = socket_path(home.path());
    let mut guard = Some(DaemonGuard {
        child: spawn_daemon(home.path()),
    });
    wait_for_socket(&socket, Duration::from_secs(5));

    let start = EventEnvelope {
        event_id: "evt-restart-start".to_string(),
        recorded_at: Utc::now().to_rfc3339(),
        event_type: EventType::OperationStart,
        machine_id: "lathe-7".to_string(),
        operator_id: Some("op-kim".to_string()),
        status: Some("idle".to_string()),
        speed: Some(3.0),
        passed: None,
    };
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Event,
        id: Some(start.event_id.clone()),
        params: Some(serde_json::to_value(&start).expect("serialize event")),
    };
    let first = send_request(&socket, request);
    assert!(first.ok, "operation_start should succeed");
    let record_id = first
        .data
        .as_ref()
        .and_then(|data| data.get("record"))
        .and_then(|record| record.get("id"))
        .and_then(|value| value.as_i64())
        .expect("record id");

    drop(guard.take());
    let _ = fs::remove_file(&socket);

    let conn = rusqlite::Connection::open(db_path(home.path())).expect("open daemon db");
    let events: i64 = conn
        .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
        .expect("count events");
    assert_eq!(events, 1);
    drop(conn);

    guard = Some(DaemonGuard {
        child: spawn_daemon(home.path()),
    });
    wait_for_socket(&socket, Duration::from_secs(5));

    let replay = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Event,
        id: Some(start.event_id.clone()),
        params: Some(serde_json::to_value(&start).expect("serialize event")),
    };
    let second = send_request(&socket, replay);
    assert!(second.ok, "replayed event should be acknowledged");
    assert_eq!(
        second
            .data
            .as_ref()
            .and_then(|data| data.get("duplicate"))
            .and_then(|value| value.as_bool()),
        Some(true)
    );

    let current = send_request(
        &socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetCurrentShift,
            id: Some("current-after-restart".to_string()),
            params: Some(serde_json::json!({ "machine_id": "lathe-7", "operator_id": "op-kim" })),
        },
    );
    assert!(current.ok, "current shift should survive restart");
    assert_eq!(
        current
            .data
            .as_ref()
            .and_then(|data| data.get("id"))
            .and_then(|value| value.as_i64()),
        Some(record_id)
    );

    drop(guard.take());
}
