//! Upload worker loop.

use super::queue::{Requeue, UploadItem, UploadQueue, MAX_AGE};
use super::transfer::{ProgressFn, TransferError, Uploader};
use crate::device::DeviceStatus;
use crate::signal::Signal;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Statuses that end an item's life: accepted, or permanently refused.
const TERMINAL_STATUS: [u16; 5] = [200, 201, 401, 403, 412];
const POP_WAIT: Duration = Duration::from_secs(1);

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared state of the upload worker pool.
pub struct UploadWorker {
    pub queue: Arc<UploadQueue>,
    pub uploader: Arc<dyn Uploader>,
    pub device_status: watch::Receiver<DeviceStatus>,
    pub retry_delay: Duration,
    pub max_retry_count: u32,
}

impl UploadWorker {
    /// Drain the queue as worker `id` until `end` is set.
    pub async fn run(self: Arc<Self>, id: usize, end: Signal) {
        debug!(worker = id, "upload worker started");
        while !end.is_set() {
            let Some(item) = self.queue.pop(id, POP_WAIT).await else {
                continue;
            };
            self.handle(id, item, &end).await;
        }
        debug!(worker = id, "upload worker stopped");
    }

    async fn handle(&self, id: usize, item: UploadItem, end: &Signal) {
        if self.queue.take_cancelled(&item.id) {
            info!(id = %item.id, "upload cancelled");
            self.queue.finish(id);
            return;
        }

        if item.age(now_ms()) > MAX_AGE {
            warn!(id = %item.id, path = %item.path, "upload expired");
            self.queue.finish(id);
            return;
        }

        let status = *self.device_status.borrow();
        if status.metered && !item.allow_cellular {
            debug!(id = %item.id, "metered network, deferring upload");
            self.retry(id, &item, false, end).await;
            return;
        }

        let size = std::fs::metadata(&item.path).map(|m| m.len()).ok();
        info!(
            path = %item.path,
            size = ?size,
            network_type = ?status.network_type,
            metered = status.metered,
            retry_count = item.retry_count,
            "upload start"
        );

        let progress = self.progress_fn(id, item.allow_cellular, end.clone());
        match self.uploader.put(&item, progress).await {
            Ok(code) if TERMINAL_STATUS.contains(&code) => {
                info!(path = %item.path, status = code, "upload success");
                self.queue.finish(id);
            }
            Ok(code) => {
                warn!(path = %item.path, status = code, "upload retry");
                self.retry(id, &item, true, end).await;
            }
            Err(TransferError::Aborted) => {
                info!(path = %item.path, "upload abort");
                self.retry(id, &item, false, end).await;
            }
            Err(TransferError::Network(e)) => {
                warn!(path = %item.path, error = %e, "upload timeout");
                self.retry(id, &item, true, end).await;
            }
            Err(TransferError::InvalidRequest(e)) => {
                warn!(path = %item.path, error = %e, "upload request invalid, dropping");
                self.queue.finish(id);
            }
            Err(TransferError::Io(e)) => {
                warn!(path = %item.path, error = %e, "upload source unreadable, dropping");
                self.queue.finish(id);
            }
        }
    }

    /// Records progress; stops the transfer when the network turns metered
    /// for a wifi-only item or the connection is ending.
    fn progress_fn(&self, id: usize, allow_cellular: bool, end: Signal) -> ProgressFn {
        let queue = self.queue.clone();
        let status = self.device_status.clone();
        Arc::new(move |sent, total| {
            if total > 0 {
                queue.set_progress(id, sent as f64 / total as f64);
            }
            let metered = status.borrow().metered;
            if end.is_set() || (metered && !allow_cellular) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    async fn retry(&self, id: usize, item: &UploadItem, count_failure: bool, end: &Signal) {
        match self.queue.requeue(id, count_failure, self.max_retry_count) {
            Requeue::Requeued { retry_count } => {
                debug!(id = %item.id, retry_count, "upload requeued");
            }
            Requeue::Exhausted => {
                warn!(id = %item.id, path = %item.path, "upload retries exhausted, dropping");
            }
            Requeue::NotInFlight => {}
        }
        end.sleep(self.retry_delay).await;
    }
}
