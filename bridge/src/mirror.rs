//! The canonical mapping between bus items and broker topics.
//!
//! One entry per `(service, path)` pair, keyed internally by the uid
//! `service + path`. The uid-to-topic mapping stays bijective for the
//! lifetime of the owning service; the last value seen on the bus is stored
//! per topic so a broker reconnect can republish everything.

use std::collections::HashMap;

use crate::{queue::PublishQueue, registry, topics};

/// Items that must never be mirrored: their semantics do not fit a retained
/// publish (byte tunnels, latched threshold controls).
const BLOCKED_ITEMS: &[(&str, &str)] = &[
    ("vebus", "/Interfaces/Mk2/Tunnel"),
    ("paygo", "/LVD/Threshold"),
];

#[derive(Debug)]
pub(crate) struct MirrorTable {
    portal_id: String,
    /// uid (`service + path`) to notification topic.
    topics: HashMap<String, String>,
    /// Notification topic to last value seen on the bus.
    values: HashMap<String, serde_json::Value>,
}

impl MirrorTable {
    pub(crate) fn new(portal_id: String) -> Self {
        Self {
            portal_id,
            topics: HashMap::new(),
            values: HashMap::new(),
        }
    }

    /// Installs an entry for `(service, path)` and returns its topic. An
    /// existing entry keeps its topic and value; blocked items get no entry.
    pub(crate) fn add(
        &mut self,
        service: &str,
        instance: u32,
        path: &str,
        value: serde_json::Value,
    ) -> Option<String> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let uid = format!("{service}{path}");
        if let Some(topic) = self.topics.get(&uid) {
            return Some(topic.clone());
        }

        let service_type = registry::service_type(service)?;
        if BLOCKED_ITEMS.contains(&(service_type, path.as_str())) {
            return None;
        }

        let topic = topics::notification_topic(&self.portal_id, service_type, instance, &path);
        self.topics.insert(uid, topic.clone());
        self.values.insert(topic.clone(), value);
        Some(topic)
    }

    pub(crate) fn topic_for_uid(&self, uid: &str) -> Option<&String> {
        self.topics.get(uid)
    }

    /// Overwrites the last-seen value of an existing entry.
    pub(crate) fn update(&mut self, topic: &str, value: serde_json::Value) {
        if let Some(slot) = self.values.get_mut(topic) {
            *slot = value;
        }
    }

    /// Tears down every entry belonging to `service`, enqueueing one
    /// tombstone per topic.
    pub(crate) fn remove_service(&mut self, service: &str, queue: &mut PublishQueue) {
        let prefix = format!("{service}/");
        let removed: Vec<(String, String)> = self
            .topics
            .iter()
            .filter(|(uid, _)| uid.starts_with(&prefix))
            .map(|(uid, topic)| (uid.clone(), topic.clone()))
            .collect();

        for (uid, topic) in removed {
            queue.tombstone(&topic);
            self.topics.remove(&uid);
            self.values.remove(&topic);
        }
    }

    /// All entries as `(topic, value)`, sorted by topic. Used by the
    /// publish-all that follows a broker (re)connect.
    pub(crate) fn snapshot_sorted(&self) -> Vec<(String, serde_json::Value)> {
        let mut entries: Vec<(String, serde_json::Value)> = self
            .values
            .iter()
            .map(|(topic, value)| (topic.clone(), value.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.topics.len()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SERVICE: &str = "com.victronenergy.system";

    fn table() -> MirrorTable {
        MirrorTable::new("abc123".to_string())
    }

    #[test]
    fn mints_topics_and_normalizes_the_path() {
        let mut table = table();
        let topic = table
            .add(SERVICE, 0, "Ac/Grid/L1/Power", json!(123.4))
            .unwrap();

        assert_eq!(topic, "N/abc123/system/0/Ac/Grid/L1/Power");
        assert_eq!(
            table.topic_for_uid("com.victronenergy.system/Ac/Grid/L1/Power"),
            Some(&topic)
        );
    }

    #[test]
    fn existing_entries_keep_their_topic_and_value() {
        let mut table = table();
        let first = table.add(SERVICE, 0, "/Serial", json!("hq1")).unwrap();
        let second = table.add(SERVICE, 0, "/Serial", json!("other")).unwrap();

        assert_eq!(first, second);
        assert_eq!(table.snapshot_sorted(), vec![(first, json!("hq1"))]);
    }

    #[test]
    fn blocked_items_get_no_entry() {
        let mut table = table();
        assert_eq!(
            table.add(
                "com.victronenergy.vebus.ttyO1",
                257,
                "/Interfaces/Mk2/Tunnel",
                json!(null),
            ),
            None
        );
        assert_eq!(table.entry_count(), 0);
    }

    #[test]
    fn removing_a_service_tombstones_each_topic_once() {
        let mut table = table();
        let mut queue = PublishQueue::new();
        let topic = table.add(SERVICE, 0, "/Dc/Battery/Soc", json!(80)).unwrap();
        table
            .add("com.victronenergy.vebus.ttyO1", 257, "/Mode", json!(3))
            .unwrap();

        table.remove_service(SERVICE, &mut queue);

        assert_eq!(queue.pending(), vec![(topic, None)]);
        assert_eq!(table.entry_count(), 1);
        assert_eq!(table.topic_for_uid("com.victronenergy.system/Dc/Battery/Soc"), None);
    }

    #[test]
    fn every_value_topic_is_the_image_of_a_uid() {
        let mut table = table();
        table.add(SERVICE, 0, "/A", json!(1)).unwrap();
        table.add(SERVICE, 0, "/B", json!(2)).unwrap();
        let mut queue = PublishQueue::new();
        table.remove_service(SERVICE, &mut queue);

        assert!(table.snapshot_sorted().is_empty());
    }
}
