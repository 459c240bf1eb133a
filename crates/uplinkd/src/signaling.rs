//! Relay for live-video session negotiation.
//!
//! Three queues of opaque payloads connect the RPC methods with the media
//! pipeline: SDP offers going out, answers coming in, and ICE candidates
//! going out. Payloads are never inspected. When a pipeline command is
//! configured, the relay runs it and speaks JSON lines over its stdio:
//! `{"kind": "sdp" | "ice", "payload": ...}`.

use crate::signal::Signal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Sdp,
    Ice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMessage {
    pub kind: PayloadKind,
    pub payload: Value,
}

#[derive(Default)]
struct Queue {
    items: Mutex<VecDeque<Value>>,
    notify: Notify,
}

impl Queue {
    fn push(&self, v: Value) {
        self.items
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(v);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<Value> {
        self.items
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }

    fn drain(&self) -> Vec<Value> {
        self.items
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect()
    }

    async fn pop(&self) -> Value {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(v) = self.try_pop() {
                return v;
            }
            notified.await;
        }
    }

    /// Put back at the head (delivery failed).
    fn unpop(&self, v: Value) {
        self.items
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_front(v);
        self.notify.notify_one();
    }
}

#[derive(Default)]
pub struct SignalingRelay {
    sdp_out: Queue,
    inbound: Queue,
    ice_out: Queue,
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer from the cloud, handed to the pipeline verbatim.
    pub fn push_answer(&self, answer: Value) {
        self.inbound.push(answer);
    }

    /// Next offer from the pipeline, or `None` after `timeout`.
    pub async fn next_sdp(&self, timeout: Duration) -> Option<Value> {
        let raw = tokio::time::timeout(timeout, self.sdp_out.pop()).await.ok()?;
        Some(decode_json_string(raw))
    }

    /// All ICE candidates gathered so far.
    pub fn drain_ice(&self) -> Vec<Value> {
        self.ice_out.drain().into_iter().map(decode_json_string).collect()
    }

    /// Pipeline side: publish an outbound payload.
    pub fn publish(&self, msg: PipelineMessage) {
        match msg.kind {
            PayloadKind::Sdp => self.sdp_out.push(msg.payload),
            PayloadKind::Ice => self.ice_out.push(msg.payload),
        }
    }

    /// Pipeline side: wait for the next inbound payload.
    pub async fn next_inbound(&self) -> Value {
        self.inbound.pop().await
    }

    /// Run the configured pipeline process until `exit`, restarting it
    /// after `restart_delay` whenever it stops. Without a command this just
    /// idles, leaving inbound payloads queued for an in-process consumer.
    pub async fn run(
        self: Arc<Self>,
        command: Option<Vec<String>>,
        restart_delay: Duration,
        exit: Signal,
    ) {
        let Some(command) = command.filter(|c| !c.is_empty()) else {
            exit.wait().await;
            return;
        };
        while !exit.is_set() {
            if let Err(e) = self.bridge_once(&command, &exit).await {
                warn!(error = %e, program = %command[0], "signaling pipeline failed");
            }
            if exit.sleep(restart_delay).await {
                break;
            }
            info!(program = %command[0], "restarting signaling pipeline");
        }
    }

    async fn bridge_once(&self, command: &[String], exit: &Signal) -> std::io::Result<()> {
        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        info!(pid = ?child.id(), program = %command[0], "signaling pipeline started");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("pipeline stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("pipeline stdout unavailable"))?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match serde_json::from_str::<PipelineMessage>(&line) {
                        Ok(msg) => {
                            debug!(kind = ?msg.kind, "pipeline payload");
                            self.publish(msg);
                        }
                        Err(e) => warn!(error = %e, "malformed pipeline line"),
                    },
                    None => break,
                },
                payload = self.inbound.pop() => {
                    let msg = PipelineMessage { kind: PayloadKind::Sdp, payload };
                    let mut line = serde_json::to_vec(&msg)?;
                    line.push(b'\n');
                    if let Err(e) = stdin.write_all(&line).await {
                        self.inbound.unpop(msg.payload);
                        return Err(e);
                    }
                    stdin.flush().await?;
                }
                _ = exit.wait() => {
                    let _ = child.kill().await;
                    return Ok(());
                }
            }
        }

        let status = child.wait().await?;
        info!(status = %status, "signaling pipeline exited");
        Ok(())
    }
}

/// Payloads arrive as JSON text more often than not; parse when possible.
fn decode_json_string(v: Value) -> Value {
    match &v {
        Value::String(s) => serde_json::from_str(s).unwrap_or(v),
        _ => v,
    }
}
