//! Client helper for talking to shiftd over its Unix socket.
//!
//! The daemon is the only writer. Failures are surfaced to the caller; there
//! is no local fallback.

use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use shiftd_protocol::{
    EventEnvelope, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const SOCKET_ENV: &str = "SHIFTD_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 2000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".shiftd").join(SOCKET_NAME))
}

pub fn make_event_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "evt-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u64()
    )
}

/// Sends one request and returns the response `data`, or the daemon's error as
/// `code: message`.
pub fn call(method: Method, params: Option<Value>) -> Result<Value, String> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(make_request_id()),
        params,
    };
    into_data(send_request(&request)?)
}

/// Sends an event, retrying once. The retry reuses the event id so the daemon
/// can drop it if the first attempt was applied but its response was lost.
pub fn send_event(event: &EventEnvelope) -> Result<Value, String> {
    event
        .validate()
        .map_err(|err| format!("{}: {}", err.code, err.message))?;

    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Event,
        id: Some(event.event_id.clone()),
        params: Some(
            serde_json::to_value(event)
                .map_err(|err| format!("Failed to serialize event: {}", err))?,
        ),
    };

    match send_request(&request).and_then(into_data) {
        Ok(data) => Ok(data),
        Err(err) => {
            tracing::warn!(error = %err, event_id = %event.event_id, "Failed to send event to daemon");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_request(&request).and_then(into_data).map_err(|retry_err| {
                tracing::warn!(
                    error = %retry_err,
                    event_id = %event.event_id,
                    "Retry failed sending event to daemon"
                );
                retry_err
            })
        }
    }
}

/// Opens a subscription and hands each streamed update to `on_update` until
/// the daemon closes the stream or the callback returns false.
pub fn subscribe<F>(mut on_update: F) -> Result<(), String>
where
    F: FnMut(Value) -> bool,
{
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method: Method::Subscribe,
        id: Some(make_request_id()),
        params: None,
    };
    let mut stream = connect()?;
    write_request(&mut stream, &request)?;
    // Updates arrive only when production changes, so block indefinitely.
    let _ = stream.set_read_timeout(None);

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|err| format!("Failed to read subscription ack: {}", err))?;
    let ack: Response = serde_json::from_str(line.trim())
        .map_err(|err| format!("Failed to parse subscription ack: {}", err))?;
    into_data(ack)?;

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|err| format!("Subscription stream failed: {}", err))?;
        if read == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let update: Value = serde_json::from_str(line.trim())
            .map_err(|err| format!("Failed to parse update: {}", err))?;
        if !on_update(update) {
            return Ok(());
        }
    }
}

fn make_request_id() -> String {
    let mut random = rand::thread_rng();
    format!("req-{:x}", random.next_u64())
}

fn into_data(response: Response) -> Result<Value, String> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown daemon error".to_string()))
    }
}

fn connect() -> Result<UnixStream, String> {
    let socket = socket_path()?;
    let stream = UnixStream::connect(&socket).map_err(|err| {
        format!(
            "Failed to connect to daemon socket {}: {}",
            socket.display(),
            err
        )
    })?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    Ok(stream)
}

fn write_request(stream: &mut UnixStream, request: &Request) -> Result<(), String> {
    serde_json::to_writer(&mut *stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();
    Ok(())
}

fn send_request(request: &Request) -> Result<Response, String> {
    let mut stream = connect()?;
    write_request(&mut stream, request)?;
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES * 16 {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}
