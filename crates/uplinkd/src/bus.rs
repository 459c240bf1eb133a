//! In-process publish/subscribe bus with named topics.
//!
//! Each topic keeps only its latest value. Readers wait for the next
//! publication, which is what `getMessage` exposes to the cloud.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use uplink_core::{UplinkError, UplinkResult};

pub const DEVICE_STATE: &str = "deviceState";

#[derive(Debug, Default)]
pub struct Bus {
    topics: Mutex<HashMap<String, watch::Sender<Option<Value>>>>,
}

impl Bus {
    /// Bus with the topics this daemon publishes.
    pub fn new() -> Self {
        let bus = Self::default();
        bus.register(DEVICE_STATE);
        bus
    }

    pub fn register(&self, topic: &str) {
        let mut topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| watch::channel(None).0);
    }

    pub fn publish(&self, topic: &str, value: Value) {
        let topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(tx) = topics.get(topic) {
            tx.send_replace(Some(value));
        }
    }

    pub fn subscribe(&self, topic: &str) -> Option<watch::Receiver<Option<Value>>> {
        let topics = self.topics.lock().unwrap_or_else(|p| p.into_inner());
        topics.get(topic).map(|tx| tx.subscribe())
    }

    /// Wait for the next value published on `topic`.
    pub async fn next_message(&self, topic: &str, timeout: Duration) -> UplinkResult<Value> {
        let mut rx = self
            .subscribe(topic)
            .ok_or_else(|| UplinkError::InvalidParams("invalid service".into()))?;
        match tokio::time::timeout(timeout, rx.changed()).await {
            Ok(Ok(())) => Ok(rx.borrow_and_update().clone().unwrap_or(Value::Null)),
            Ok(Err(_)) => Err(UplinkError::Other(format!("{topic} closed"))),
            Err(_) => Err(UplinkError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn unknown_topic_is_invalid_service() {
        let bus = Bus::new();
        let err = bus
            .next_message("carState", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid params: invalid service");
    }

    #[tokio::test]
    async fn waits_for_next_publication() {
        let bus = Arc::new(Bus::new());
        bus.publish(DEVICE_STATE, json!({"old": true}));

        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.next_message(DEVICE_STATE, Duration::from_secs(2)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.publish(DEVICE_STATE, json!({"networkType": "wifi"}));

        let value = reader.await.unwrap().unwrap();
        assert_eq!(value, json!({"networkType": "wifi"}));
    }

    #[tokio::test]
    async fn times_out_without_publication() {
        let bus = Bus::new();
        let err = bus
            .next_message(DEVICE_STATE, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, UplinkError::Timeout));
    }
}
