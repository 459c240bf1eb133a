//! Priority queue of pending uploads with a durable cache.
//!
//! Lower `priority` values are served first. Items of equal priority come
//! out in heap order, which is not FIFO. Every mutation rewrites the
//! `UploadQueue` parameter with all queued and in-flight items that have
//! not been cancelled, and the queue is rebuilt from it at startup.

use crate::params::{Params, UPLOAD_QUEUE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

pub const DEFAULT_UPLOAD_PRIORITY: u32 = 99;
pub const MAX_AGE: Duration = Duration::from_secs(31 * 24 * 3600);

fn default_priority() -> u32 {
    DEFAULT_UPLOAD_PRIORITY
}

/// One pending transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadItem {
    pub path: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Milliseconds since the unix epoch.
    pub created_at: u64,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(rename = "current", default)]
    pub in_flight: bool,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub allow_cellular: bool,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

impl UploadItem {
    pub fn new(
        path: String,
        url: String,
        headers: BTreeMap<String, String>,
        created_at: u64,
        allow_cellular: bool,
        priority: u32,
    ) -> Self {
        let mut item = Self {
            path,
            url,
            headers,
            created_at,
            id: String::new(),
            retry_count: 0,
            in_flight: false,
            progress: 0.0,
            allow_cellular,
            priority,
        };
        item.id = item.content_hash();
        item
    }

    /// Hex SHA-256 over the item's identifying content.
    fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.path.as_bytes());
        hasher.update([0]);
        hasher.update(self.url.as_bytes());
        hasher.update([0]);
        for (k, v) in &self.headers {
            hasher.update(k.as_bytes());
            hasher.update([b'=']);
            hasher.update(v.as_bytes());
            hasher.update([0]);
        }
        hasher.update(self.created_at.to_be_bytes());
        hasher.update([self.allow_cellular as u8]);
        hasher.update(self.priority.to_be_bytes());
        hex::encode(hasher.finalize())
    }

    /// URL without its query string, used for de-duplication.
    pub fn url_base(&self) -> &str {
        strip_query(&self.url)
    }

    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.created_at))
    }
}

pub fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

/// Heap entry ordered by priority only (lowest first).
#[derive(Debug)]
struct Queued(UploadItem);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.priority.cmp(&self.0.priority)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Queued>,
    in_flight: HashMap<usize, UploadItem>,
    cancelled: HashSet<String>,
}

impl QueueState {
    fn visible(&self) -> Vec<UploadItem> {
        self.heap
            .iter()
            .map(|q| &q.0)
            .chain(self.in_flight.values())
            .filter(|item| !self.cancelled.contains(&item.id))
            .cloned()
            .collect()
    }

    fn knows_url(&self, base: &str) -> bool {
        self.heap
            .iter()
            .map(|q| &q.0)
            .chain(self.in_flight.values())
            .any(|item| item.url_base() == base)
    }
}

/// What happened to an item handed back after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Requeued { retry_count: u32 },
    Exhausted,
    NotInFlight,
}

pub struct UploadQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    params: Params,
    persist_lock: Mutex<()>,
}

impl UploadQueue {
    /// Queue rebuilt from the persisted cache (empty if absent or corrupt).
    pub fn load(params: Params) -> Self {
        let queue = Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            params,
            persist_lock: Mutex::new(()),
        };
        let cached: Vec<UploadItem> = queue.params.get_json(UPLOAD_QUEUE).unwrap_or_default();
        if !cached.is_empty() {
            info!(count = cached.len(), "restored upload queue");
            let mut state = queue.lock();
            for mut item in cached {
                item.in_flight = false;
                item.progress = 0.0;
                state.heap.push(Queued(item));
            }
        }
        queue
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn persist(&self) {
        let _guard = self.persist_lock.lock().unwrap_or_else(|p| p.into_inner());
        let snapshot = self.lock().visible();
        if let Err(e) = self.params.put_json(UPLOAD_QUEUE, &snapshot) {
            warn!(error = %e, "failed to persist upload queue");
        }
    }

    /// Insert items whose URL (query stripped) is not already queued or
    /// in flight. Returns the items actually inserted.
    pub fn enqueue_unique(&self, items: Vec<UploadItem>) -> Vec<UploadItem> {
        let mut added = Vec::new();
        {
            let mut state = self.lock();
            for item in items {
                if state.knows_url(item.url_base()) {
                    continue;
                }
                state.heap.push(Queued(item.clone()));
                added.push(item);
            }
        }
        self.persist();
        for _ in &added {
            self.notify.notify_one();
        }
        added
    }

    fn try_pop(&self, worker: usize) -> Option<UploadItem> {
        let item = {
            let mut state = self.lock();
            let Queued(mut item) = state.heap.pop()?;
            item.in_flight = true;
            state.in_flight.insert(worker, item.clone());
            item
        };
        self.persist();
        Some(item)
    }

    /// Take the most urgent item for `worker`, waiting up to `wait`.
    pub async fn pop(&self, worker: usize, wait: Duration) -> Option<UploadItem> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(item) = self.try_pop(worker) {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop(worker);
            }
        }
    }

    pub fn set_progress(&self, worker: usize, progress: f64) {
        if let Some(item) = self.lock().in_flight.get_mut(&worker) {
            item.progress = progress;
        }
    }

    /// The worker is done with its item, for good.
    pub fn finish(&self, worker: usize) -> Option<UploadItem> {
        let item = self.lock().in_flight.remove(&worker);
        self.persist();
        item
    }

    /// Put the worker's item back, optionally counting one more failure.
    pub fn requeue(&self, worker: usize, count_failure: bool, max_retry_count: u32) -> Requeue {
        let outcome = {
            let mut state = self.lock();
            let Some(mut item) = state.in_flight.remove(&worker) else {
                return Requeue::NotInFlight;
            };
            let retry_count = item.retry_count + u32::from(count_failure);
            if retry_count >= max_retry_count {
                Requeue::Exhausted
            } else {
                item.retry_count = retry_count;
                item.in_flight = false;
                item.progress = 0.0;
                state.heap.push(Queued(item));
                Requeue::Requeued { retry_count }
            }
        };
        self.persist();
        if matches!(outcome, Requeue::Requeued { .. }) {
            self.notify.notify_one();
        }
        outcome
    }

    /// Return items left in flight by a previous connection to the queue.
    pub fn reset_in_flight(&self) {
        let returned = {
            let mut state = self.lock();
            let items: Vec<_> = state.in_flight.drain().map(|(_, item)| item).collect();
            let n = items.len();
            for mut item in items {
                item.in_flight = false;
                item.progress = 0.0;
                state.heap.push(Queued(item));
            }
            n
        };
        if returned > 0 {
            info!(count = returned, "returned stale in-flight uploads to queue");
            self.persist();
        }
    }

    /// Consume a pending cancellation for `id`.
    pub fn take_cancelled(&self, id: &str) -> bool {
        self.lock().cancelled.remove(id)
    }

    /// Mark queued (not in-flight) ids cancelled. Returns whether any matched.
    pub fn cancel(&self, ids: &[String]) -> bool {
        let matched = {
            let mut state = self.lock();
            let queued: HashSet<&str> = state.heap.iter().map(|q| q.0.id.as_str()).collect();
            let hits: Vec<String> = ids
                .iter()
                .filter(|id| queued.contains(id.as_str()))
                .cloned()
                .collect();
            let any = !hits.is_empty();
            state.cancelled.extend(hits);
            any
        };
        if matched {
            self.persist();
        }
        matched
    }

    /// All queued and in-flight items, minus cancelled ones.
    pub fn list(&self) -> Vec<UploadItem> {
        self.lock().visible()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.heap.is_empty() && state.in_flight.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(url: &str, priority: u32) -> UploadItem {
        UploadItem::new(
            format!("/data/{url}"),
            url.to_string(),
            BTreeMap::new(),
            1_700_000_000_000,
            false,
            priority,
        )
    }

    fn queue() -> (tempfile::TempDir, UploadQueue) {
        let dir = tempfile::tempdir().unwrap();
        let params = Params::open(dir.path()).unwrap();
        (dir, UploadQueue::load(params))
    }

    #[tokio::test]
    async fn lower_priority_value_first() {
        let (_dir, q) = queue();
        q.enqueue_unique(vec![
            item("https://h/a", 10),
            item("https://h/b", 50),
            item("https://h/c", 10),
        ]);
        let first = q.pop(0, Duration::ZERO).await.unwrap();
        let second = q.pop(1, Duration::ZERO).await.unwrap();
        let third = q.pop(2, Duration::ZERO).await.unwrap();
        assert_eq!(
            [first.priority, second.priority, third.priority],
            [10, 10, 50]
        );
        assert!(q.pop(3, Duration::from_millis(5)).await.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_enqueue() {
        let (_dir, q) = queue();
        let q = std::sync::Arc::new(q);
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.pop(0, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue_unique(vec![item("https://h/late", 1)]);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.url, "https://h/late");
        assert!(got.in_flight);
    }

    #[test]
    fn dedupes_by_url_without_query() {
        let (_dir, q) = queue();
        let added = q.enqueue_unique(vec![item("https://h/a?sig=1", 1)]);
        assert_eq!(added.len(), 1);
        let added = q.enqueue_unique(vec![
            item("https://h/a?sig=2", 1),
            item("https://h/b", 1),
            item("https://h/b?x", 1),
        ]);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].url, "https://h/b");
        assert_eq!(q.list().len(), 2);
    }

    #[tokio::test]
    async fn requeue_counts_exactly_one_failure() {
        let (_dir, q) = queue();
        q.enqueue_unique(vec![item("https://h/a", 1)]);
        let popped = q.pop(0, Duration::ZERO).await.unwrap();
        assert_eq!(popped.retry_count, 0);

        assert_eq!(q.requeue(0, true, 30), Requeue::Requeued { retry_count: 1 });
        let again = q.pop(0, Duration::ZERO).await.unwrap();
        assert_eq!(again.retry_count, 1);

        assert_eq!(q.requeue(0, false, 30), Requeue::Requeued { retry_count: 1 });
        assert_eq!(q.list()[0].retry_count, 1);
        assert!(!q.list()[0].in_flight);
    }

    #[tokio::test]
    async fn exhausted_items_disappear() {
        let (_dir, q) = queue();
        q.enqueue_unique(vec![item("https://h/a", 1)]);
        for attempt in 1..3 {
            q.pop(0, Duration::ZERO).await.unwrap();
            assert_eq!(
                q.requeue(0, true, 3),
                Requeue::Requeued {
                    retry_count: attempt
                }
            );
        }
        q.pop(0, Duration::ZERO).await.unwrap();
        assert_eq!(q.requeue(0, true, 3), Requeue::Exhausted);
        assert!(q.list().is_empty());
        assert_eq!(q.requeue(0, true, 3), Requeue::NotInFlight);
    }

    #[tokio::test]
    async fn cancel_only_matches_queued_ids() {
        let (_dir, q) = queue();
        let added = q.enqueue_unique(vec![item("https://h/a", 1), item("https://h/b", 2)]);
        let in_flight = q.pop(0, Duration::ZERO).await.unwrap();
        assert_eq!(in_flight.id, added[0].id);

        assert!(!q.cancel(&["nope".to_string()]));
        assert!(!q.cancel(&[in_flight.id.clone()]));
        assert_eq!(q.list().len(), 2);

        assert!(q.cancel(&[added[1].id.clone(), "nope".to_string()]));
        let listed = q.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, in_flight.id);

        let cancelled = q.pop(1, Duration::ZERO).await.unwrap();
        assert!(q.take_cancelled(&cancelled.id));
        assert!(!q.take_cancelled(&cancelled.id));
    }

    #[tokio::test]
    async fn persisted_and_restored() {
        let dir = tempfile::tempdir().unwrap();
        let params = Params::open(dir.path()).unwrap();
        {
            let q = UploadQueue::load(params.clone());
            q.enqueue_unique(vec![item("https://h/a", 5), item("https://h/b", 7)]);
            q.pop(0, Duration::ZERO).await.unwrap();
            q.set_progress(0, 0.5);
        }
        let raw: Vec<serde_json::Value> = params.get_json(UPLOAD_QUEUE).unwrap();
        assert_eq!(raw.len(), 2);
        assert!(raw.iter().any(|v| v["current"] == true));

        let restored = UploadQueue::load(params);
        let items = restored.list();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| !i.in_flight));
    }

    #[tokio::test]
    async fn reset_in_flight_returns_items() {
        let (_dir, q) = queue();
        q.enqueue_unique(vec![item("https://h/a", 1)]);
        q.pop(3, Duration::ZERO).await.unwrap();
        q.reset_in_flight();
        let again = q.pop(0, Duration::ZERO).await.unwrap();
        assert_eq!(again.url, "https://h/a");
    }

    #[test]
    fn item_wire_names() {
        let v = serde_json::to_value(item("https://h/a", 99)).unwrap();
        assert!(v.get("current").is_some());
        assert!(v.get("in_flight").is_none());
        assert_eq!(v["id"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn age_in_ms() {
        let it = item("https://h/a", 1);
        assert_eq!(it.age(it.created_at + 1500), Duration::from_millis(1500));
        assert_eq!(it.age(0), Duration::ZERO);
    }
}
