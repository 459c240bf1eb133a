//! Connection supervisor.
//!
//! Keeps one control channel open to the cloud, serving it with a fixed set
//! of tasks, and reconnects with randomized backoff whenever any of them
//! reports the channel broken. The device monitor and signaling relay run
//! beside it for the whole process lifetime.

use crate::channel::manage::socket_fd;
use crate::channel::{client_request, run_manage, run_recv, run_send, ChannelQueues, WsStream};
use crate::context::DaemonContext;
use crate::device::{self, DEVICE_STATE_UPDATE_INTERVAL};
use crate::forward::{LogForwarder, StatForwarder, XattrMarker, LOG_ATTR_NAME};
use crate::params::LAST_PING_TIME;
use crate::rpc::{run_worker, Dispatcher};
use crate::signal::Signal;
use crate::upload::UploadWorker;
use futures_util::StreamExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uplink_core::{UplinkError, UplinkResult};

const MAX_BACKOFF_SECS: u64 = 128;
/// How long connection tasks get to wind down before they are aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

type TaskResult = (String, UplinkResult<()>);

/// Random delay in `[0, min(128, 2^retries))` seconds.
pub fn backoff(retries: u32) -> Duration {
    let cap = 1u64
        .checked_shl(retries)
        .unwrap_or(u64::MAX)
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(rand::thread_rng().gen_range(0..cap))
}

/// Channel endpoint for this device.
pub fn channel_uri(host: &str, dongle_id: &str) -> String {
    format!("{}/ws/v2/{}", host.trim_end_matches('/'), dongle_id)
}

/// Open the control channel with the identity cookie.
pub async fn connect(ctx: &DaemonContext) -> UplinkResult<WsStream> {
    let uri = channel_uri(&ctx.config.host, &ctx.dongle_id);
    let token = ctx.identity.token(&ctx.dongle_id)?;
    let request = client_request(&uri, &token)?;
    info!(uri = %uri, "connecting");
    let (ws, _) = tokio::time::timeout(
        ctx.config.connect_timeout,
        tokio_tungstenite::connect_async(request),
    )
    .await
    .map_err(|_| UplinkError::Timeout)?
    .map_err(|e| UplinkError::Transport(format!("connect failed: {e}")))?;
    Ok(ws)
}

/// Supervise the control channel until `exit` is set.
pub async fn run(ctx: Arc<DaemonContext>, exit: Signal) -> UplinkResult<()> {
    let mut background = JoinSet::new();
    background.spawn(device::run_monitor(
        ctx.device.clone(),
        ctx.device_status_tx.clone(),
        ctx.bus.clone(),
        DEVICE_STATE_UPDATE_INTERVAL,
        exit.clone(),
    ));
    background.spawn(ctx.signaling.clone().run(
        ctx.config.pipeline_command.clone(),
        ctx.config.pipeline_restart_delay,
        exit.clone(),
    ));

    let mut retries: u32 = 0;
    while !exit.is_set() {
        match connect(&ctx).await {
            Ok(ws) => {
                info!("connected");
                retries = 0;
                if let Err(e) = serve_connection(ctx.clone(), ws, &exit).await {
                    warn!(error = %e, "channel lost");
                }
            }
            Err(e) => warn!(error = %e, "connection failed"),
        }

        let shells = ctx.shells.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || shells.close_all()).await {
            warn!(error = %e, "failed to close shell sessions");
        }
        if exit.is_set() {
            break;
        }

        retries = retries.saturating_add(1);
        if let Err(e) = ctx.params.remove(LAST_PING_TIME) {
            debug!(error = %e, "failed to clear ping time");
        }
        let delay = backoff(retries);
        info!(retries, delay_s = delay.as_secs(), "reconnecting after backoff");
        if exit.sleep(delay).await {
            break;
        }
    }

    info!("supervisor stopping");
    while background.join_next().await.is_some() {}
    Ok(())
}

/// Serve one open channel until a task fails or `exit` is set. Returns the
/// first task error, if any.
pub async fn serve_connection(
    ctx: Arc<DaemonContext>,
    ws: WsStream,
    exit: &Signal,
) -> UplinkResult<()> {
    let config = &ctx.config;
    let marker = Arc::new(XattrMarker::new(LOG_ATTR_NAME)?);
    ctx.uploads.reset_in_flight();

    let fd = socket_fd(&ws);
    let (sink, stream) = ws.split();
    let queues = ChannelQueues::new();
    let end = Signal::new();
    let mut tasks: JoinSet<TaskResult> = JoinSet::new();

    tasks.spawn(named(
        "send",
        run_send(sink, queues.outbound_rx, config.frame_size, end.clone()),
    ));
    tasks.spawn(named(
        "recv",
        run_recv(
            stream,
            queues.inbound,
            ctx.params.clone(),
            config.reconnect_timeout,
            end.clone(),
        ),
    ));

    let dispatcher = Arc::new(Dispatcher::new(ctx.clone(), end.clone()));
    for id in 0..config.rpc_workers {
        tasks.spawn(named(
            format!("rpc-{id}"),
            run_worker(
                id,
                dispatcher.clone(),
                queues.calls.clone(),
                queues.outbound.clone(),
                end.clone(),
            ),
        ));
    }

    let uploader = Arc::new(UploadWorker {
        queue: ctx.uploads.clone(),
        uploader: ctx.uploader.clone(),
        device_status: ctx.device_status(),
        retry_delay: config.retry_delay,
        max_retry_count: config.max_retry_count,
    });
    for id in 0..config.upload_workers {
        let worker = uploader.clone().run(id, end.clone());
        tasks.spawn(named(format!("upload-{id}"), async move {
            worker.await;
            Ok(())
        }));
    }

    let logs = LogForwarder {
        dir: config.swaglog_dir.clone(),
        marker,
        outbound: queues.outbound.clone(),
        compress: config.forward_compress,
        max_message_bytes: config.forward_max_bytes,
        scan_interval: config.forward_interval,
        response_wait: config.forward_response_wait,
    };
    tasks.spawn(named("log-forwarder", logs.run(queues.replies, end.clone())));

    let stats = StatForwarder {
        dir: config.stats_dir.clone(),
        outbound: queues.outbound.clone(),
        compress: config.forward_compress,
        interval: config.forward_interval,
    };
    tasks.spawn(named("stat-forwarder", stats.run(end.clone())));
    tasks.spawn(named(
        "manage",
        run_manage(ctx.params.clone(), fd, end.clone()),
    ));

    let first = tokio::select! {
        res = tasks.join_next() => res,
        _ = exit.wait() => None,
    };
    end.set();

    let mut outcome = Ok(());
    if let Some(res) = first {
        outcome = task_outcome(res);
    }
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = task_outcome(res) {
                debug!(error = %e, "task error during shutdown");
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("connection tasks did not stop in time, aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    outcome
}

async fn named<F>(name: impl Into<String>, fut: F) -> TaskResult
where
    F: std::future::Future<Output = UplinkResult<()>>,
{
    (name.into(), fut.await)
}

fn task_outcome(res: Result<TaskResult, tokio::task::JoinError>) -> UplinkResult<()> {
    match res {
        Ok((name, Ok(()))) => {
            debug!(task = %name, "connection task finished");
            Ok(())
        }
        Ok((name, Err(e))) => {
            warn!(task = %name, error = %e, "connection task failed");
            Err(e)
        }
        Err(e) => {
            error!(error = %e, "connection task panicked");
            Err(UplinkError::Other(format!("task panicked: {e}")))
        }
    }
}
