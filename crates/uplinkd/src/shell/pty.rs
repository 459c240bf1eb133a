//! One pseudo-terminal hosting a login shell.
//!
//! The master side is switched to non-blocking mode and driven with plain
//! `read`/`write` calls on its descriptor, so callers poll for output
//! instead of parking a thread on it. The session owns both the master and
//! the child; closing (or dropping) it hangs up the terminal and reaps the
//! child, escalating to SIGKILL when the shell ignores the polite signal.

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uplink_core::{UplinkError, UplinkResult};

const READ_CHUNK: usize = 4096;
const KILL_GRACE: Duration = Duration::from_secs(1);
const EXIT_POLL: Duration = Duration::from_millis(20);

pub const MIN_COLS: u16 = 10;
pub const MAX_COLS: u16 = 500;
pub const MIN_ROWS: u16 = 5;
pub const MAX_ROWS: u16 = 300;

/// Clamp a requested terminal size to the supported range.
pub fn clamp_size(cols: i64, rows: i64) -> (u16, u16) {
    (
        cols.clamp(MIN_COLS as i64, MAX_COLS as i64) as u16,
        rows.clamp(MIN_ROWS as i64, MAX_ROWS as i64) as u16,
    )
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// What to run inside a new terminal.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub term: String,
}

/// Output drained from the terminal in one call.
#[derive(Debug, Default)]
pub struct ReadOutput {
    pub data: Vec<u8>,
    /// Master reported end-of-file or EIO (slave side gone).
    pub hung_up: bool,
}

pub struct PtySession {
    master: Option<Box<dyn MasterPty + Send>>,
    fd: RawFd,
    child: Box<dyn Child + Send + Sync>,
    exit_code: Option<i32>,
    pub last_activity: Instant,
    closed: bool,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("fd", &self.fd)
            .field("pid", &self.child.process_id())
            .field("exit_code", &self.exit_code)
            .field("closed", &self.closed)
            .finish()
    }
}

impl PtySession {
    pub fn spawn(cmd: &ShellCommand, cols: u16, rows: u16) -> UplinkResult<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| UplinkError::Other(format!("failed to open pty: {e}")))?;

        let mut builder = CommandBuilder::new(&cmd.program);
        builder.args(&cmd.args);
        builder.env("TERM", &cmd.term);
        if let Some(home) = dirs::home_dir() {
            builder.cwd(home);
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| UplinkError::Other(format!("failed to spawn shell: {e}")))?;
        // Only the child keeps the slave open, so its exit hangs up the master.
        drop(pair.slave);

        let fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| UplinkError::Other("pty master has no descriptor".into()))?;
        set_nonblocking(fd)?;

        info!(pid = ?child.process_id(), cols, rows, "shell spawned");
        Ok(Self {
            master: Some(pair.master),
            fd,
            child,
            exit_code: None,
            last_activity: Instant::now(),
            closed: false,
        })
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Exit code if the child has exited.
    pub fn exit_code(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_code = Some(exit_code_of(&status));
            }
        }
        self.exit_code
    }

    pub fn has_exited(&mut self) -> bool {
        self.exit_code().is_some()
    }

    /// Write as much of `data` as the terminal accepts without blocking.
    pub fn write_nonblocking(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.master.is_none() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "pty closed"));
        }
        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            // SAFETY: `fd` is the open master descriptor owned by `self.master`.
            let n = unsafe { libc::write(self.fd, rest.as_ptr().cast(), rest.len()) };
            if n >= 0 {
                written += n as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
        Ok(written)
    }

    /// Drain up to `max` bytes of pending output without blocking.
    pub fn read_nonblocking(&mut self, max: usize) -> io::Result<ReadOutput> {
        let mut out = ReadOutput::default();
        if self.master.is_none() {
            out.hung_up = true;
            return Ok(out);
        }
        let mut buf = [0u8; READ_CHUNK];
        while out.data.len() < max {
            let want = (max - out.data.len()).min(READ_CHUNK);
            // SAFETY: `buf` has room for `want` bytes; `fd` is owned by `self.master`.
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), want) };
            if n > 0 {
                out.data.extend_from_slice(&buf[..n as usize]);
                continue;
            }
            if n == 0 {
                out.hung_up = true;
                break;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => break,
                io::ErrorKind::Interrupted => continue,
                // Linux reports EIO on the master once the slave is closed.
                _ if err.raw_os_error() == Some(libc::EIO) => {
                    out.hung_up = true;
                    break;
                }
                _ => return Err(err),
            }
        }
        Ok(out)
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> UplinkResult<()> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| UplinkError::Other("pty closed".into()))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| UplinkError::Other(format!("pty resize failed: {e}")))?;
        debug!(cols, rows, "pty resized");
        Ok(())
    }

    fn wait_exit(&mut self, within: Duration) -> Option<i32> {
        let deadline = Instant::now() + within;
        loop {
            if let Some(code) = self.exit_code() {
                return Some(code);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(EXIT_POLL);
        }
    }

    /// Hang up the terminal and make sure the child is gone.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.master.take();

        if self.exit_code().is_none() {
            if let Some(pid) = self.child.process_id() {
                // SAFETY: plain signal delivery to our own child.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            if self.wait_exit(KILL_GRACE).is_none() {
                if let Err(e) = self.child.kill() {
                    warn!(error = %e, "failed to kill shell");
                }
                if self.wait_exit(KILL_GRACE).is_none() {
                    warn!(pid = ?self.child.process_id(), "shell did not exit");
                }
            }
        }
        debug!(exit_code = ?self.exit_code, "pty session closed");
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Process exit code, or `-signum` when the child was killed by a signal.
fn exit_code_of(status: &portable_pty::ExitStatus) -> i32 {
    // portable-pty keeps only the strsignal() text of the signal.
    let text = status.to_string();
    match text.strip_prefix("Terminated by ").and_then(signal_number) {
        Some(signum) => -signum,
        None => status.exit_code() as i32,
    }
}

fn signal_number(name: &str) -> Option<i32> {
    if let Some(n) = name.strip_prefix("Signal ") {
        return n.parse().ok();
    }
    (1..65).find(|&signum| {
        // SAFETY: strsignal returns a NUL-terminated string or null.
        let ptr = unsafe { libc::strsignal(signum) };
        !ptr.is_null() && unsafe { CStr::from_ptr(ptr) }.to_string_lossy() == name
    })
}

fn set_nonblocking(fd: RawFd) -> UplinkResult<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh() -> ShellCommand {
        ShellCommand {
            program: "/bin/sh".into(),
            args: Vec::new(),
            term: "xterm-256color".into(),
        }
    }

    fn read_until(session: &mut PtySession, needle: &str, within: Duration) -> String {
        let deadline = Instant::now() + within;
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            let out = session.read_nonblocking(65536).unwrap();
            seen.extend_from_slice(&out.data);
            if String::from_utf8_lossy(&seen).contains(needle) || out.hung_up {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        String::from_utf8_lossy(&seen).into_owned()
    }

    #[test]
    fn clamps_size() {
        assert_eq!(clamp_size(1, 1), (10, 5));
        assert_eq!(clamp_size(9999, 9999), (500, 300));
        assert_eq!(clamp_size(120, 32), (120, 32));
        assert_eq!(clamp_size(-5, -5), (10, 5));
    }

    #[test]
    fn echo_round_trip() {
        let mut session = PtySession::spawn(&sh(), 80, 24).unwrap();
        let written = session.write_nonblocking(b"echo hi\n").unwrap();
        assert_eq!(written, 8);
        let out = read_until(&mut session, "hi\r\n", Duration::from_secs(5));
        assert!(out.contains("hi"), "output was {out:?}");
        session.close();
        assert!(session.exit_code.is_some());
    }

    #[test]
    fn reports_exit_code() {
        let mut session = PtySession::spawn(&sh(), 80, 24).unwrap();
        session.write_nonblocking(b"exit 3\n").unwrap();
        assert_eq!(session.wait_exit(Duration::from_secs(5)), Some(3));
    }

    #[test]
    fn signal_death_is_negative() {
        let mut session = PtySession::spawn(&sh(), 80, 24).unwrap();
        session.write_nonblocking(b"kill -9 $$\n").unwrap();
        assert_eq!(session.wait_exit(Duration::from_secs(5)), Some(-libc::SIGKILL));
    }

    #[test]
    fn signal_names_map_back_to_numbers() {
        let term = exit_code_of(&portable_pty::ExitStatus::with_signal("Signal 15"));
        assert_eq!(term, -15);
        // SAFETY: strsignal returns a NUL-terminated string.
        let name = unsafe { CStr::from_ptr(libc::strsignal(libc::SIGHUP)) }
            .to_string_lossy()
            .into_owned();
        let hup = exit_code_of(&portable_pty::ExitStatus::with_signal(&name));
        assert_eq!(hup, -libc::SIGHUP);
        assert_eq!(exit_code_of(&portable_pty::ExitStatus::with_exit_code(4)), 4);
    }

    #[test]
    fn close_kills_running_child() {
        let mut session = PtySession::spawn(&sh(), 80, 24).unwrap();
        session.write_nonblocking(b"trap '' TERM HUP; sleep 5\n").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        session.close();
        assert!(session.exit_code.is_some());
        assert!(session.write_nonblocking(b"x").is_err());
    }

    #[test]
    fn resize_after_close_fails() {
        let mut session = PtySession::spawn(&sh(), 80, 24).unwrap();
        session.resize(100, 40).unwrap();
        session.close();
        assert!(session.resize(100, 40).is_err());
    }
}
