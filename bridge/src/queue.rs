//! The rate-limited publish queue.
//!
//! An insertion-ordered topic-to-payload map: re-enqueueing a topic replaces
//! the pending payload and moves the topic to the tail, so bus churn
//! coalesces to the final value while distinct topics drain fairly. A `None`
//! payload is a tombstone and publishes as an empty retained message.

use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::mqtt::Broker;

/// The stable portal identifier for subscribers; survives its service.
pub(crate) const PROTECTED_TOPIC_SUFFIX: &str = "/system/0/Serial";

/// Items published per drain run.
pub(crate) const DRAIN_BATCH: usize = 5;

/// Minimum spacing between timer-triggered drains.
const MIN_DRAIN_INTERVAL: Duration = Duration::from_millis(1500);

#[derive(Debug, Default)]
pub(crate) struct PublishQueue {
    entries: IndexMap<String, Option<String>>,
    last_drain: Option<Instant>,
}

impl PublishQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&mut self, topic: &str, payload: String) {
        self.enqueue(topic, Some(payload));
    }

    pub(crate) fn tombstone(&mut self, topic: &str) {
        if topic.ends_with(PROTECTED_TOPIC_SUFFIX) {
            return;
        }
        self.enqueue(topic, None);
    }

    fn enqueue(&mut self, topic: &str, payload: Option<String>) {
        self.entries.shift_remove(topic);
        self.entries.insert(topic.to_string(), payload);
    }

    /// Whether the 1 Hz timer should drain now.
    pub(crate) fn should_timer_drain(&self, now: Instant) -> bool {
        !self.entries.is_empty()
            && self
                .last_drain
                .map(|last| now.duration_since(last) > MIN_DRAIN_INTERVAL)
                .unwrap_or(true)
    }

    /// Publishes up to `max` pending entries, oldest first. Failures are
    /// logged and dropped: the entry was already removed and the next change
    /// on that topic supersedes it. Returns whether entries remain.
    pub(crate) async fn drain<K: Broker>(&mut self, broker: &K, max: usize) -> bool {
        self.last_drain = Some(Instant::now());
        for _ in 0..max {
            let Some((topic, payload)) = self.entries.shift_remove_index(0) else {
                return false;
            };
            let payload = payload.map(String::into_bytes).unwrap_or_default();
            if let Err(error) = broker.publish_retained(&topic, payload).await {
                tracing::error!(%error, %topic, "failed to publish");
            }
        }
        !self.entries.is_empty()
    }

    pub(crate) fn depth(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> Vec<(String, Option<String>)> {
        self.entries
            .iter()
            .map(|(topic, payload)| (topic.clone(), payload.clone()))
            .collect()
    }
}
