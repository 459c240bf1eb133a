//! TCP keepalive tuning for the channel socket.
//!
//! While driving the link is expected to drop often, so dead connections
//! must be noticed within seconds. Parked, a relaxed profile saves traffic.

use super::WsStream;
use crate::params::{Params, IS_ONROAD};
use crate::signal::Signal;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info, warn};
use uplink_core::UplinkResult;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub user_timeout_ms: u32,
    pub idle_s: u32,
    pub interval_s: u32,
    pub count: u32,
}

impl Keepalive {
    pub const ONROAD: Keepalive = Keepalive {
        user_timeout_ms: 16_000,
        idle_s: 7,
        interval_s: 7,
        count: 2,
    };

    pub const OFFROAD: Keepalive = Keepalive {
        user_timeout_ms: 0,
        idle_s: 30,
        interval_s: 10,
        count: 3,
    };

    pub fn for_onroad(onroad: bool) -> Self {
        if onroad {
            Self::ONROAD
        } else {
            Self::OFFROAD
        }
    }

    /// Apply to a connected TCP socket.
    pub fn apply(&self, fd: RawFd) -> io::Result<()> {
        set_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1)?;
        set_opt(fd, libc::IPPROTO_TCP, libc::TCP_USER_TIMEOUT, self.user_timeout_ms)?;
        set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, self.idle_s)?;
        set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, self.interval_s)?;
        set_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, self.count)?;
        Ok(())
    }
}

pub(crate) fn set_opt(fd: RawFd, level: libc::c_int, name: libc::c_int, value: u32) -> io::Result<()> {
    let value = value as libc::c_int;
    // SAFETY: `value` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&value as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Descriptor of the TCP socket under the websocket, TLS or not.
pub fn socket_fd(ws: &WsStream) -> Option<RawFd> {
    match ws.get_ref() {
        MaybeTlsStream::Plain(tcp) => Some(tcp.as_raw_fd()),
        MaybeTlsStream::Rustls(tls) => Some(tls.get_ref().0.as_raw_fd()),
        _ => None,
    }
}

/// Watch `IsOnroad` and retune keepalive whenever it flips.
pub async fn run_manage(params: Params, fd: Option<RawFd>, end: Signal) -> UplinkResult<()> {
    let Some(fd) = fd else {
        debug!("channel socket descriptor unavailable, keepalive left alone");
        end.wait().await;
        return Ok(());
    };
    let mut onroad_prev: Option<bool> = None;
    loop {
        let onroad = params.get_bool(IS_ONROAD);
        if onroad_prev != Some(onroad) {
            let profile = Keepalive::for_onroad(onroad);
            match profile.apply(fd) {
                Ok(()) => info!(onroad, ?profile, "channel keepalive updated"),
                Err(e) => warn!(onroad, error = %e, "failed to set keepalive"),
            }
            onroad_prev = Some(onroad);
        }
        if end.sleep(POLL_INTERVAL).await {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_opt(fd: RawFd, level: libc::c_int, name: libc::c_int) -> i32 {
        let mut value: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(fd, level, name, (&mut value as *mut libc::c_int).cast(), &mut len)
        };
        assert_eq!(rc, 0);
        value
    }

    #[test]
    fn profiles() {
        assert_eq!(Keepalive::for_onroad(true).user_timeout_ms, 16_000);
        assert_eq!(Keepalive::for_onroad(false), Keepalive::OFFROAD);
    }

    #[tokio::test]
    async fn applies_to_a_live_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let fd = client.as_raw_fd();

        Keepalive::ONROAD.apply(fd).unwrap();
        assert_eq!(get_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE), 7);
        assert_eq!(get_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT), 2);
        assert_eq!(get_opt(fd, libc::IPPROTO_TCP, libc::TCP_USER_TIMEOUT), 16_000);

        Keepalive::OFFROAD.apply(fd).unwrap();
        assert_eq!(get_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE), 30);
        assert_eq!(get_opt(fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL), 10);
        assert_eq!(get_opt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE), 1);
    }

    #[tokio::test]
    async fn manage_stops_on_end() {
        let dir = tempfile::tempdir().unwrap();
        let params = Params::open(dir.path()).unwrap();
        let end = Signal::new();
        end.set();
        run_manage(params, None, end).await.unwrap();
    }
}
