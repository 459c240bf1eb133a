//! Bridges a second cloud websocket to a local TCP service (sshd).

use super::manage::{set_opt, socket_fd};
use super::{client_request, WsStream};
use crate::signal::Signal;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uplink_core::{UplinkError, UplinkResult};

pub const LOCAL_PORT_WHITELIST: [u16; 1] = [22];
/// AF42 with the minimum-delay flag, keeps the session snappy under load.
const SSH_TOS: u32 = 0x90;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 4096;

/// Map legacy port numbers and refuse anything not whitelisted.
pub fn resolve_port(local_port: i64) -> UplinkResult<u16> {
    let port = if local_port == 8022 { 22 } else { local_port };
    u16::try_from(port)
        .ok()
        .filter(|p| LOCAL_PORT_WHITELIST.contains(p))
        .ok_or_else(|| UplinkError::Other("Requested local port not whitelisted".into()))
}

/// Open `remote_ws_uri` with the identity cookie, connect to the local
/// port, and bridge the two in the background until either side closes or
/// `end` is set.
pub async fn start_local_proxy(
    remote_ws_uri: &str,
    local_port: i64,
    token: &str,
    end: Signal,
) -> UplinkResult<Value> {
    debug!(uri = %remote_ws_uri, "starting local proxy");
    let port = resolve_port(local_port)?;

    let request = client_request(remote_ws_uri, token)?;

    let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
        .await
        .map_err(|_| UplinkError::Timeout)?
        .map_err(|e| UplinkError::Transport(format!("proxy connect failed: {e}")))?;

    if let Some(fd) = socket_fd(&ws) {
        if let Err(e) = set_opt(fd, libc::IPPROTO_IP, libc::IP_TOS, SSH_TOS) {
            debug!(error = %e, "failed to set proxy TOS");
        }
    }

    let local = TcpStream::connect(("127.0.0.1", port)).await?;
    tokio::spawn(bridge(ws, local, end));
    info!(port, "local proxy started");
    Ok(json!({"success": 1}))
}

pub(crate) async fn bridge(ws: WsStream, local: TcpStream, end: Signal) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut local_rd, mut local_wr) = local.into_split();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        tokio::select! {
            _ = end.wait() => break,
            msg = ws_rx.next() => {
                let data = match msg {
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "proxy websocket receive failed");
                        break;
                    }
                };
                if let Err(e) = local_wr.write_all(&data).await {
                    warn!(error = %e, "proxy local write failed");
                    break;
                }
            }
            n = local_rd.read(&mut buf) => match n {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = ws_tx.send(Message::Binary(buf[..n].to_vec().into())).await {
                        warn!(error = %e, "proxy websocket send failed");
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "proxy local read failed");
                    break;
                }
            },
        }
    }

    let _ = ws_tx.close().await;
    let _ = local_wr.shutdown().await;
    debug!("local proxy closed");
}
