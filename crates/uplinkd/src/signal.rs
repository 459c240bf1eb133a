//! One-shot stop signals shared between tasks.
//!
//! The supervisor owns one process-wide exit signal and creates a fresh
//! end signal per connection. Setting a signal is idempotent and wakes
//! every waiter.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct Signal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is set (immediately if it already is).
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Sleep for `dur`, returning early with `true` if the signal fires.
    pub async fn sleep(&self, dur: std::time::Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(dur) => self.is_set(),
            _ = self.wait() => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_returns_after_set() {
        let sig = Signal::new();
        let waiter = {
            let sig = sig.clone();
            tokio::spawn(async move { sig.wait().await })
        };
        assert!(!sig.is_set());
        sig.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(sig.is_set());
    }

    #[tokio::test]
    async fn sleep_is_interrupted() {
        let sig = Signal::new();
        sig.set();
        let start = std::time::Instant::now();
        assert!(sig.sleep(Duration::from_secs(30)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn sleep_runs_out_when_unset() {
        let sig = Signal::new();
        assert!(!sig.sleep(Duration::from_millis(10)).await);
    }
}
