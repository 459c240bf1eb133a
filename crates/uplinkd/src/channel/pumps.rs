//! Send and receive pumps for the cloud websocket.
//!
//! The send pump writes raw frames so a long message goes out as one text
//! frame plus continuation frames of at most `frame_size` bytes. The receive
//! pump classifies inbound data and watches server pings for liveness.

use super::{monotonic_ns, InboundTx, OutboundRx};
use crate::params::{Params, LAST_PING_TIME};
use crate::signal::Signal;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::json;
use std::fmt::Display;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use uplink_core::{chunk_message, classify, Inbound, UplinkError, UplinkResult};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_POLL: Duration = Duration::from_secs(1);

/// Drain the outbound queues onto the socket, high priority first, until
/// `end` is set or every sender is gone.
pub async fn run_send<S>(
    mut sink: S,
    mut rx: OutboundRx,
    frame_size: usize,
    end: Signal,
) -> UplinkResult<()>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut high_closed = false;
    let mut low_closed = false;
    while !(high_closed && low_closed) {
        let msg = tokio::select! {
            biased;
            _ = end.wait() => return Ok(()),
            msg = rx.high.recv(), if !high_closed => match msg {
                Some(msg) => msg,
                None => {
                    high_closed = true;
                    continue;
                }
            },
            msg = rx.low.recv(), if !low_closed => match msg {
                Some(msg) => msg,
                None => {
                    low_closed = true;
                    continue;
                }
            },
        };
        for chunk in chunk_message(msg.as_bytes(), frame_size) {
            let opcode = if chunk.first {
                OpCode::Data(Data::Text)
            } else {
                OpCode::Data(Data::Continue)
            };
            let frame = Frame::message(chunk.payload.to_vec(), opcode, chunk.last);
            sink.feed(Message::Frame(frame))
                .await
                .map_err(|e| UplinkError::Transport(format!("ws send failed: {e}")))?;
        }
        sink.flush()
            .await
            .map_err(|e| UplinkError::Transport(format!("ws flush failed: {e}")))?;
    }
    debug!("outbound queues closed");
    Ok(())
}

/// Read from the socket until `end` is set. Returns an error when the
/// connection fails or no ping arrived within `reconnect_timeout`.
pub async fn run_recv<S>(
    mut stream: S,
    inbound: InboundTx,
    params: Params,
    reconnect_timeout: Duration,
    end: Signal,
) -> UplinkResult<()>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut last_ping = Instant::now();
    while !end.is_set() {
        match tokio::time::timeout(RECV_POLL, stream.next()).await {
            Err(_) => {}
            Ok(None) => return Err(UplinkError::Transport("connection closed".into())),
            Ok(Some(Err(e))) => return Err(UplinkError::Transport(format!("ws recv failed: {e}"))),
            Ok(Some(Ok(msg))) => match msg {
                Message::Text(text) => route(&inbound, &text),
                Message::Binary(data) => route(&inbound, &String::from_utf8_lossy(&data)),
                Message::Ping(_) => {
                    last_ping = Instant::now();
                    if let Err(e) = params.put_string(LAST_PING_TIME, &monotonic_ns().to_string()) {
                        debug!(error = %e, "failed to record ping time");
                    }
                }
                Message::Close(frame) => {
                    debug!(?frame, "server closed the channel");
                    return Err(UplinkError::Transport("closed by server".into()));
                }
                Message::Pong(_) | Message::Frame(_) => {}
            },
        }
        if last_ping.elapsed() > reconnect_timeout {
            warn!(timeout_s = reconnect_timeout.as_secs(), "no ping from server");
            return Err(UplinkError::Timeout);
        }
    }
    Ok(())
}

/// Hand one inbound data message to the right queue.
pub(crate) fn route(inbound: &InboundTx, text: &str) {
    match classify(text) {
        Inbound::Call(req) => {
            let _ = inbound.calls.send(req);
        }
        Inbound::Reply(reply) => {
            let _ = inbound.replies.send(reply);
        }
        Inbound::Invalid(error) => {
            warn!(%error, "unroutable message");
            inbound.outbound.send_high(json!({ "error": error }).to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelQueues;
    use futures_util::stream;

    fn frames(sent: &[Message]) -> Vec<(bool, bool, Vec<u8>)> {
        sent.iter()
            .map(|m| match m {
                Message::Frame(f) => (
                    f.header().opcode == OpCode::Data(Data::Text),
                    f.header().is_final,
                    f.payload()[..].to_vec(),
                ),
                other => panic!("unexpected message {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn high_priority_goes_first() {
        let q = ChannelQueues::new();
        q.outbound.send_low("low".into());
        q.outbound.send_high("high".into());
        let ChannelQueues {
            outbound,
            outbound_rx,
            inbound,
            ..
        } = q;
        drop(outbound);
        drop(inbound);

        let mut sent: Vec<Message> = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            run_send(&mut sent, outbound_rx, 4096, Signal::new()),
        )
        .await
        .unwrap()
        .unwrap();
        let f = frames(&sent);
        assert_eq!(f[0].2, b"high");
        assert_eq!(f[1].2, b"low");
    }

    #[tokio::test]
    async fn send_returns_once_every_sender_is_gone() {
        let q = ChannelQueues::new();
        let ChannelQueues {
            outbound,
            outbound_rx,
            inbound,
            ..
        } = q;
        let end = Signal::new();
        let mut sent: Vec<Message> = Vec::new();
        {
            let pump = run_send(&mut sent, outbound_rx, 4096, end.clone());
            tokio::pin!(pump);

            // Still open: the pump keeps waiting.
            let early = tokio::time::timeout(Duration::from_millis(100), &mut pump).await;
            assert!(early.is_err());

            drop(outbound);
            drop(inbound);
            tokio::time::timeout(Duration::from_secs(5), &mut pump)
                .await
                .unwrap()
                .unwrap();
        }
        assert!(!end.is_set());
        assert!(sent.is_empty());
    }

    #[tokio::test]
    async fn long_message_is_split_into_frames() {
        let q = ChannelQueues::new();
        let msg = "x".repeat(10_000);
        q.outbound.send_high(msg.clone());
        let ChannelQueues {
            outbound,
            outbound_rx,
            inbound,
            ..
        } = q;
        drop(outbound);
        drop(inbound);

        let mut sent: Vec<Message> = Vec::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            run_send(&mut sent, outbound_rx, 4096, Signal::new()),
        )
        .await
        .unwrap()
        .unwrap();
        let f = frames(&sent);
        assert_eq!(f.len(), 3);
        assert_eq!(
            f.iter().map(|(text, fin, p)| (*text, *fin, p.len())).collect::<Vec<_>>(),
            vec![(true, false, 4096), (false, false, 4096), (false, true, 1808)]
        );
        let joined: Vec<u8> = f.into_iter().flat_map(|(_, _, p)| p).collect();
        assert_eq!(joined, msg.as_bytes());
    }

    #[tokio::test]
    async fn recv_routes_calls_replies_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let params = Params::open(dir.path()).unwrap();
        let mut q = ChannelQueues::new();
        let incoming = stream::iter(vec![
            Ok(Message::Text(r#"{"jsonrpc":"2.0","method":"echo","params":["a"],"id":1}"#.into())),
            Ok(Message::Binary(br#"{"id":"log1","result":{"success":true}}"#.to_vec().into())),
            Ok(Message::Text("[1,2]".into())),
            Ok(Message::Ping(Vec::new().into())),
        ]);

        let err = run_recv(
            incoming,
            q.inbound.clone(),
            params.clone(),
            Duration::from_secs(70),
            Signal::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UplinkError::Transport(_)));

        let call = q.calls.lock().await.try_recv().unwrap();
        assert_eq!(call.method, "echo");
        let reply = q.replies.try_recv().unwrap();
        assert_eq!(reply.id_str(), Some("log1"));
        assert!(reply.is_success());
        let error = q.outbound_rx.high.try_recv().unwrap();
        assert!(error.contains("\"error\""));
        assert!(params.get_u64(LAST_PING_TIME).is_some());
    }

    #[tokio::test]
    async fn missing_pings_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let params = Params::open(dir.path()).unwrap();
        let q = ChannelQueues::new();
        let err = run_recv(
            stream::pending(),
            q.inbound.clone(),
            params,
            Duration::from_millis(10),
            Signal::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, UplinkError::Timeout));
    }
}
