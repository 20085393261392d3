//! Blocking client helpers for talking to a running service.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::sleep;
use std::time::Duration;

use hearth_core::ExitCode;
use serde_json::{json, Value};

use crate::error::{io_err, DaemonError};
use crate::rpc::{Frame, RpcRequest};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// Send one call and wait for its response. Notifications that arrive
/// first are skipped.
pub fn send_request(socket: &Path, method: &str, params: Value) -> Result<Frame, DaemonError> {
    if !socket.exists() {
        return Err(DaemonError::ServiceNotRunning {
            socket: socket.to_path_buf(),
        });
    }

    let mut stream = UnixStream::connect(socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::ServiceNotRunning {
                socket: socket.to_path_buf(),
            }
        } else {
            io_err(socket, err)
        }
    })?;

    let request = RpcRequest {
        seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
        method: method.to_string(),
        params,
    };
    let payload = serde_json::to_string(&request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(socket, e))?;
    stream.flush().map_err(|e| io_err(socket, e))?;

    let mut reader = BufReader::new(stream);
    loop {
        let mut line = String::new();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| io_err(socket, e))?;
        if read == 0 {
            return Err(DaemonError::Protocol(
                "service closed connection before responding".to_string(),
            ));
        }
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Frame>(line.trim_end())? {
            response @ Frame::Response { seq, .. } if seq == request.seq => return Ok(response),
            Frame::Response { seq, .. } => {
                tracing::debug!(seq, expected = request.seq, "skipping unrelated response");
            }
            Frame::Notify { method, .. } => {
                tracing::debug!(method = %method, "skipping notification");
            }
        }
    }
}

/// Call `method` and unwrap the response payload.
pub fn call(socket: &Path, method: &str, params: Value) -> Result<Value, DaemonError> {
    response_into_data(send_request(socket, method, params)?)
}

pub fn request_status(socket: &Path) -> Result<Value, DaemonError> {
    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match call(socket, "ctl.status", Value::Null) {
            Ok(data) => return Ok(data),
            Err(err @ DaemonError::ServiceNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("service status retry loop exited unexpectedly".to_string())
    }))
}

/// Ask the service to stop with `code`. Returns whether this request was
/// the one that took effect.
pub fn request_stop(socket: &Path, code: ExitCode) -> Result<bool, DaemonError> {
    let data = call(socket, "ctl.stop", json!({ "exit_code": code }))?;
    Ok(data
        .get("accepted")
        .and_then(Value::as_bool)
        .unwrap_or(false))
}

fn response_into_data(frame: Frame) -> Result<Value, DaemonError> {
    match frame {
        Frame::Response { ok: true, data, .. } => Ok(data.unwrap_or(Value::Null)),
        Frame::Response { error, .. } => Err(DaemonError::Protocol(
            error.unwrap_or_else(|| "unknown service error".to_string()),
        )),
        Frame::Notify { method, .. } => Err(DaemonError::Protocol(format!(
            "expected a response, got notification {method}"
        ))),
    }
}
