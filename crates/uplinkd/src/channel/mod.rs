//! The duplex control channel to the cloud.
//!
//! A connection is served by a send pump and a receive pump around a set of
//! in-process queues. Everything else (RPC workers, forwarders) only ever
//! touches the queues.

pub mod manage;
pub mod proxy;
pub mod pumps;

pub use manage::{run_manage, Keepalive};
pub use pumps::{run_recv, run_send, WsStream};

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as WsRequest;
use tokio_tungstenite::tungstenite::http::{header::COOKIE, HeaderValue};
use uplink_core::{Reply, Request, UplinkError, UplinkResult};

/// Handle for queueing outbound messages.
#[derive(Debug, Clone)]
pub struct Outbound {
    high: mpsc::UnboundedSender<String>,
    low: mpsc::UnboundedSender<String>,
}

impl Outbound {
    /// RPC responses and protocol errors.
    pub fn send_high(&self, msg: String) {
        let _ = self.high.send(msg);
    }

    /// Bulk traffic (forwarded logs and stats).
    pub fn send_low(&self, msg: String) {
        let _ = self.low.send(msg);
    }
}

/// Receiving ends drained by the send pump.
#[derive(Debug)]
pub struct OutboundRx {
    pub high: mpsc::UnboundedReceiver<String>,
    pub low: mpsc::UnboundedReceiver<String>,
}

/// Where the receive pump routes what it reads.
#[derive(Debug, Clone)]
pub struct InboundTx {
    pub calls: mpsc::UnboundedSender<Request>,
    pub replies: mpsc::UnboundedSender<Reply>,
    pub outbound: Outbound,
}

/// All queues of one connection.
pub struct ChannelQueues {
    pub outbound: Outbound,
    pub outbound_rx: OutboundRx,
    pub inbound: InboundTx,
    /// Shared by the RPC worker pool.
    pub calls: Arc<Mutex<mpsc::UnboundedReceiver<Request>>>,
    /// Responses to requests we sent; read by the log forwarder.
    pub replies: mpsc::UnboundedReceiver<Reply>,
}

impl ChannelQueues {
    pub fn new() -> Self {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        let (calls_tx, calls_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let outbound = Outbound {
            high: high_tx,
            low: low_tx,
        };
        Self {
            inbound: InboundTx {
                calls: calls_tx,
                replies: replies_tx,
                outbound: outbound.clone(),
            },
            outbound,
            outbound_rx: OutboundRx {
                high: high_rx,
                low: low_rx,
            },
            calls: Arc::new(Mutex::new(calls_rx)),
            replies: replies_rx,
        }
    }
}

impl Default for ChannelQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic clock in nanoseconds, as stored in `LastAthenaPingTime`.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime only writes into `ts`.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// Websocket handshake request carrying the identity cookie.
pub fn client_request(uri: &str, token: &str) -> UplinkResult<WsRequest> {
    let mut request = uri
        .into_client_request()
        .map_err(|e| UplinkError::InvalidParams(format!("bad websocket uri {uri}: {e}")))?;
    let cookie = HeaderValue::from_str(&format!("jwt={token}"))
        .map_err(|e| UplinkError::Other(format!("bad identity token: {e}")))?;
    request.headers_mut().insert(COOKIE, cookie);
    Ok(request)
}
