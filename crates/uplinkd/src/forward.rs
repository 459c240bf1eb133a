//! Log and stat forwarding over the low-priority queue.
//!
//! Logs are acknowledged by the cloud: each file carries a marker with the
//! time it was last sent, and a successful reply pins the marker to
//! `i32::MAX` so the file is never sent again. A file whose marker is more
//! than an hour old is assumed lost in transit and goes out again. Stats are
//! fire-and-forget: sent once, then deleted.

use crate::channel::Outbound;
use crate::signal::Signal;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::ffi::CString;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uplink_core::{Reply, Request, UplinkResult};

pub const LOG_ATTR_NAME: &str = "user.upload";
/// Marker value meaning "acknowledged, never resend".
pub const MARKER_ACKED: u32 = i32::MAX as u32;
const RESEND_AFTER_S: u64 = 3600;
const REPLY_POLL: Duration = Duration::from_secs(1);
const TEMP_PREFIX: &str = "tmp";

/// Per-file record of when a log was last sent.
pub trait LogMarker: Send + Sync {
    fn get(&self, path: &Path) -> io::Result<Option<u32>>;
    fn set(&self, path: &Path, unix_time: u32) -> io::Result<()>;
}

/// Marker stored in a filesystem extended attribute (4 bytes, little endian).
pub struct XattrMarker {
    name: CString,
}

impl XattrMarker {
    pub fn new(name: &str) -> io::Result<Self> {
        Ok(Self {
            name: CString::new(name)?,
        })
    }
}

fn c_path(path: &Path) -> io::Result<CString> {
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

impl LogMarker for XattrMarker {
    fn get(&self, path: &Path) -> io::Result<Option<u32>> {
        let path = c_path(path)?;
        let mut buf = [0u8; 4];
        // SAFETY: both strings are NUL-terminated and `buf` has room for 4 bytes.
        let n = unsafe {
            libc::getxattr(
                path.as_ptr(),
                self.name.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(libc::ENODATA) | Some(libc::ERANGE) => Ok(None),
                _ => Err(err),
            };
        }
        if n as usize != buf.len() {
            return Ok(None);
        }
        Ok(Some(u32::from_le_bytes(buf)))
    }

    fn set(&self, path: &Path, unix_time: u32) -> io::Result<()> {
        let path = c_path(path)?;
        let value = unix_time.to_le_bytes();
        // SAFETY: both strings are NUL-terminated and `value` is 4 bytes.
        let rc = unsafe {
            libc::setxattr(
                path.as_ptr(),
                self.name.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn gzip_base64(data: &[u8]) -> io::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(STANDARD.encode(encoder.finish()?))
}

/// A JSON-RPC request carrying one file's content under `key`.
fn file_message(
    method: &str,
    key: &str,
    id: &str,
    payload: String,
    compressed: bool,
) -> UplinkResult<String> {
    let mut params = json!({ key: payload });
    if compressed {
        params["compressed"] = Value::Bool(true);
    }
    Ok(serde_json::to_string(&Request::new(method, params, id))?)
}

pub struct LogForwarder {
    pub dir: PathBuf,
    pub marker: std::sync::Arc<dyn LogMarker>,
    pub outbound: Outbound,
    pub compress: bool,
    pub max_message_bytes: usize,
    pub scan_interval: Duration,
    pub response_wait: Duration,
}

impl LogForwarder {
    /// Unsent logs in name order, minus the newest one (still being written).
    pub fn logs_to_send(&self, now_unix: u64) -> io::Result<Vec<String>> {
        let mut logs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let sent_at = self.marker.get(&entry.path()).ok().flatten().unwrap_or(0);
            if sent_at == 0 || now_unix.saturating_sub(u64::from(sent_at)) > RESEND_AFTER_S {
                logs.push(name);
            }
        }
        logs.sort();
        logs.pop();
        Ok(logs)
    }

    /// Build the `forwardLogs` message, or `None` when it must be skipped.
    pub fn log_message(&self, id: &str, data: String) -> UplinkResult<Option<String>> {
        if data.is_empty() {
            warn!(log = %id, "log file is empty");
            return Ok(None);
        }
        // Escaped payload plus the envelope, roughly.
        let estimate = serde_json::to_string(&data)?.len() + id.len() + 100;
        let (payload, compressed) = if self.compress && estimate > self.max_message_bytes {
            let encoded = gzip_base64(data.as_bytes())?;
            debug!(log = %id, before = estimate, after = encoded.len(), "log compressed");
            (encoded, true)
        } else {
            (data, false)
        };
        let msg = file_message("forwardLogs", "logs", id, payload, compressed)?;
        if self.compress && msg.len() > self.max_message_bytes {
            warn!(log = %id, bytes = msg.len(), "log too large to forward");
            return Ok(None);
        }
        Ok(Some(msg))
    }

    /// Stamp and queue one log. Returns false if it vanished or was skipped.
    fn send_log(&self, name: &str) -> UplinkResult<bool> {
        let path = self.dir.join(name);
        self.marker.set(&path, unix_now() as u32)?;
        let data = std::fs::read_to_string(&path)?;
        match self.log_message(name, data)? {
            Some(msg) => {
                self.outbound.send_low(msg);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn handle_reply(&self, reply: &Reply) {
        let success = reply.is_success();
        debug!(id = ?reply.id, success, "forward response");
        if let (Some(name), true) = (reply.id_str(), success) {
            if let Err(e) = self.marker.set(&self.dir.join(name), MARKER_ACKED) {
                // Rotated away in the meantime.
                debug!(log = %name, error = %e, "failed to mark log acknowledged");
            }
        }
    }

    pub async fn run(
        self,
        mut replies: mpsc::UnboundedReceiver<Reply>,
        end: Signal,
    ) -> UplinkResult<()> {
        let mut pending: Vec<String> = Vec::new();
        let mut last_scan: Option<Instant> = None;

        while !end.is_set() {
            if last_scan.map_or(true, |t| t.elapsed() > self.scan_interval) {
                pending = self.logs_to_send(unix_now()).unwrap_or_else(|e| {
                    warn!(dir = %self.dir.display(), error = %e, "failed to scan logs");
                    Vec::new()
                });
                last_scan = Some(Instant::now());
            }

            let mut current = None;
            if let Some(name) = pending.pop() {
                debug!(log = %name, "forward request");
                match self.send_log(&name) {
                    Ok(true) => current = Some(name),
                    Ok(false) => {}
                    Err(e) => debug!(log = %name, error = %e, "log not forwarded"),
                }
            }

            // Always read at least once so stale replies are processed.
            let deadline = Instant::now() + self.response_wait;
            loop {
                let reply = tokio::select! {
                    _ = end.wait() => return Ok(()),
                    r = tokio::time::timeout(REPLY_POLL, replies.recv()) => r,
                };
                match reply {
                    Ok(Some(reply)) => {
                        self.handle_reply(&reply);
                        if current.is_some() && reply.id_str() == current.as_deref() {
                            break;
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(_) if current.is_none() => break,
                    Err(_) => {}
                }
                if Instant::now() >= deadline {
                    break;
                }
            }
        }
        Ok(())
    }
}

pub struct StatForwarder {
    pub dir: PathBuf,
    pub outbound: Outbound,
    pub compress: bool,
    pub interval: Duration,
}

impl StatForwarder {
    /// Send the first finished stats file and delete it.
    pub fn forward_one(&self) -> UplinkResult<Option<String>> {
        let mut names: Vec<String> = std::fs::read_dir(&self.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with(TEMP_PREFIX))
            .collect();
        names.sort();
        let Some(name) = names.into_iter().next() else {
            return Ok(None);
        };

        let path = self.dir.join(&name);
        let data = std::fs::read_to_string(&path)?;
        let (payload, compressed) = if self.compress {
            (gzip_base64(data.as_bytes())?, true)
        } else {
            (data, false)
        };
        self.outbound
            .send_low(file_message("storeStats", "stats", &name, payload, compressed)?);
        std::fs::remove_file(&path)?;
        info!(stats = %name, "stats forwarded");
        Ok(Some(name))
    }

    pub async fn run(self, end: Signal) -> UplinkResult<()> {
        loop {
            if let Err(e) = self.forward_one() {
                warn!(dir = %self.dir.display(), error = %e, "stat forwarding failed");
            }
            if end.sleep(self.interval).await {
                return Ok(());
            }
        }
    }
}
