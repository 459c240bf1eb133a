//! Remote shell session table.
//!
//! Sessions are keyed by an opaque random id. The table is the only owner
//! of each [`PtySession`]; removing an entry hands it to the caller, which
//! closes it after the lock is released. Every entry point first checks the
//! `RemoteSshEnabled` toggle and runs the reaper.

use super::pty::{clamp_size, PtySession, ShellCommand};
use crate::params::{Params, REMOTE_SSH, REMOTE_SSH_ENABLED};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rand::RngCore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use uplink_core::{UplinkError, UplinkResult};

pub const MAX_READ_BYTES: usize = 1024 * 1024;
pub const DEFAULT_READ_BYTES: i64 = 65536;
const DISABLED: &str = "Remote SSH disabled";

fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn not_found() -> UplinkError {
    UplinkError::NotFound("session not found".into())
}

pub struct ShellManager {
    sessions: Mutex<HashMap<String, PtySession>>,
    params: Params,
    command: ShellCommand,
    idle_timeout: Duration,
}

impl ShellManager {
    pub fn new(params: Params, command: ShellCommand, idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            params,
            command,
            idle_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PtySession>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn enabled(&self) -> bool {
        self.params.get_bool(REMOTE_SSH_ENABLED)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn mirror_active(&self, active: bool) {
        if let Err(e) = self.params.put_bool(REMOTE_SSH, active) {
            debug!(error = %e, "failed to mirror remote ssh state");
        }
    }

    /// Close everything when the feature is off, otherwise reap every
    /// session but `keep`. Returns `false` when the caller must answer
    /// "disabled".
    fn admit(&self, keep: Option<&str>) -> bool {
        if !self.enabled() {
            self.close_all();
            return false;
        }
        self.reap_except(keep);
        true
    }

    /// Close sessions whose shell exited or that sat idle too long.
    pub fn reap(&self) {
        self.reap_except(None);
    }

    /// Like [`reap`](Self::reap), but leaves `keep` to a reader that still
    /// has to report its output and exit code.
    fn reap_except(&self, keep: Option<&str>) {
        let (stale, active) = {
            let mut sessions = self.lock();
            let mut ids = Vec::new();
            for (id, session) in sessions.iter_mut() {
                if Some(id.as_str()) == keep {
                    continue;
                }
                if session.idle_for() > self.idle_timeout || session.has_exited() {
                    ids.push(id.clone());
                }
            }
            let stale: Vec<(String, PtySession)> = ids
                .into_iter()
                .filter_map(|id| sessions.remove(&id).map(|s| (id, s)))
                .collect();
            (stale, !sessions.is_empty())
        };
        if stale.is_empty() {
            return;
        }
        for (id, mut session) in stale {
            info!(session_id = %id, "reaping shell session");
            session.close();
        }
        self.mirror_active(active);
    }

    pub fn close_all(&self) {
        let drained: Vec<(String, PtySession)> = self.lock().drain().collect();
        if drained.is_empty() {
            return;
        }
        for (id, mut session) in drained {
            info!(session_id = %id, "closing shell session");
            session.close();
        }
        self.mirror_active(false);
    }

    fn remove(&self, id: &str) -> Option<PtySession> {
        let (session, active) = {
            let mut sessions = self.lock();
            let session = sessions.remove(id);
            (session, !sessions.is_empty())
        };
        if session.is_some() {
            self.mirror_active(active);
        }
        session
    }

    pub fn start(&self, cols: i64, rows: i64) -> UplinkResult<Value> {
        if !self.admit(None) {
            return Ok(json!({"success": false, "error": DISABLED}));
        }
        let (cols, rows) = clamp_size(cols, rows);
        let session = PtySession::spawn(&self.command, cols, rows)?;
        let id = generate_session_id();
        self.lock().insert(id.clone(), session);
        self.mirror_active(true);
        info!(session_id = %id, cols, rows, "shell session started");
        Ok(json!({"success": true, "sessionId": id}))
    }

    pub fn write(&self, id: &str, data: &str) -> UplinkResult<Value> {
        if !self.admit(None) {
            return Ok(json!({"success": false, "error": DISABLED}));
        }
        let written = {
            let mut sessions = self.lock();
            let session = sessions.get_mut(id).ok_or_else(not_found)?;
            if session.has_exited() {
                None
            } else {
                let n = session.write_nonblocking(data.as_bytes())?;
                session.touch();
                Some(n)
            }
        };
        match written {
            Some(n) => Ok(json!({"success": true, "written": n})),
            None => {
                if let Some(mut session) = self.remove(id) {
                    session.close();
                }
                Ok(json!({"success": false, "written": 0}))
            }
        }
    }

    pub fn read(&self, id: &str, max_bytes: i64) -> UplinkResult<Value> {
        if !self.admit(Some(id)) {
            return Ok(json!({
                "success": false,
                "error": DISABLED,
                "data": "",
                "closed": true,
                "exitCode": Value::Null,
            }));
        }
        let max = usize::try_from(max_bytes.max(1))
            .unwrap_or(MAX_READ_BYTES)
            .min(MAX_READ_BYTES);

        let (data, exit_code) = {
            let mut sessions = self.lock();
            let session = sessions.get_mut(id).ok_or_else(not_found)?;
            let out = match session.read_nonblocking(max) {
                Ok(out) => out,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "pty read failed");
                    Default::default()
                }
            };
            if !out.data.is_empty() {
                session.touch();
            }
            (out.data, session.exit_code())
        };

        let closed = exit_code.is_some();
        if closed {
            if let Some(mut session) = self.remove(id) {
                session.close();
            }
            info!(session_id = %id, exit_code = ?exit_code, "shell session exited");
        }
        Ok(json!({
            "success": true,
            "data": STANDARD.encode(&data),
            "closed": closed,
            "exitCode": exit_code,
        }))
    }

    pub fn resize(&self, id: &str, cols: i64, rows: i64) -> UplinkResult<Value> {
        if !self.admit(None) {
            return Ok(json!({"success": false, "error": DISABLED}));
        }
        let (cols, rows) = clamp_size(cols, rows);
        let mut sessions = self.lock();
        let session = sessions.get_mut(id).ok_or_else(not_found)?;
        session.resize(cols, rows)?;
        session.touch();
        Ok(json!({"success": true}))
    }

    pub fn stop(&self, id: &str) -> UplinkResult<Value> {
        if !self.enabled() {
            self.close_all();
            return Ok(json!({"success": false, "error": DISABLED}));
        }
        match self.remove(id) {
            Some(mut session) => {
                session.close();
                info!(session_id = %id, "shell session stopped");
                Ok(json!({"success": true}))
            }
            None => Ok(json!({"success": false})),
        }
    }
}

impl Drop for ShellManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
