//! Newline-delimited JSON control protocol over the daemon's Unix socket.
//!
//! ```text
//! -> {"cmd":"status"}     <- {"ok":true,"data":{...controller status...}}
//! -> {"cmd":"sync"}       <- {"ok":true,"data":{...cycle summary...}}
//! -> {"cmd":"stop"}       <- {"ok":true,"data":{"stopping":true}}
//! ```

use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slotsync_core::CycleSummary;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// One request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum DaemonRequest {
    Status,
    /// Run one cycle now and answer with its summary.
    Sync,
    /// Graceful shutdown, bounded by the configured deadline.
    Stop,
}

/// One response line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// `data` of a successful response, the daemon's message otherwise.
    pub fn into_data(self) -> Result<Value, DaemonError> {
        match (self.ok, self.error) {
            (true, _) => Ok(self.data.unwrap_or(Value::Null)),
            (false, error) => Err(DaemonError::Protocol(
                error.unwrap_or_else(|| "unknown daemon error".to_string()),
            )),
        }
    }
}

/// Status and stop are answered immediately; a sync waits for a whole cycle.
const QUICK_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts made while a freshly started daemon binds its socket.
const STARTUP_ATTEMPTS: usize = 5;
const STARTUP_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Send one request line and read one response line.
pub fn send_request(home: &Path, request: DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    let stream = connect(&socket)?;
    if request != DaemonRequest::Sync {
        stream
            .set_read_timeout(Some(QUICK_REPLY_TIMEOUT))
            .map_err(|e| io_err(&socket, e))?;
    }

    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    (&stream)
        .write_all(line.as_bytes())
        .map_err(|e| io_err(&socket, e))?;

    line.clear();
    let read = BufReader::new(&stream)
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

fn connect(socket: &Path) -> Result<UnixStream, DaemonError> {
    let not_running = || DaemonError::DaemonNotRunning {
        socket: socket.to_path_buf(),
    };
    if !socket.exists() {
        return Err(not_running());
    }
    UnixStream::connect(socket).map_err(|err| match err.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
            not_running()
        }
        _ => io_err(socket, err),
    })
}

/// Controller status as JSON. Retried briefly so a daemon that is still
/// binding its socket is not reported as stopped.
pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let mut attempt = 1;
    loop {
        match send_request(home, DaemonRequest::Status) {
            Err(DaemonError::DaemonNotRunning { .. }) if attempt < STARTUP_ATTEMPTS => {
                attempt += 1;
                sleep(STARTUP_RETRY_DELAY);
            }
            result => return result?.into_data(),
        }
    }
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    send_request(home, DaemonRequest::Stop)?.into_data().map(|_| ())
}

/// Ask the daemon to run a cycle now; blocks until it finishes.
pub fn request_sync(home: &Path) -> Result<CycleSummary, DaemonError> {
    let data = send_request(home, DaemonRequest::Sync)?.into_data()?;
    Ok(serde_json::from_value(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn requests_use_cmd_tag() {
        assert_eq!(
            serde_json::to_string(&DaemonRequest::Sync).unwrap(),
            r#"{"cmd":"sync"}"#
        );
        let parsed: DaemonRequest = serde_json::from_str(r#"{"cmd":"stop"}"#).unwrap();
        assert_eq!(parsed, DaemonRequest::Stop);
        assert!(serde_json::from_str::<DaemonRequest>(r#"{"cmd":"reboot"}"#).is_err());
    }

    #[test]
    fn ok_response_without_data_is_null() {
        let data = DaemonResponse {
            ok: true,
            data: None,
            error: None,
        }
        .into_data()
        .unwrap();
        assert!(data.is_null());
    }

    #[test]
    fn missing_socket_means_not_running() {
        let home = TempDir::new().unwrap();
        let err = send_request(home.path(), DaemonRequest::Status).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got {err}");
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let err = DaemonResponse::error("daemon is shutting down").into_data().unwrap_err();
        assert_eq!(err.to_string(), "daemon protocol error: daemon is shutting down");
    }
}
