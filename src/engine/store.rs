//! Partition-local key-value state stores.
//!
//! A store belongs to exactly one task, so it is only ever touched by the
//! worker driving that task and needs no locking. Every mutation is captured
//! for the store's changelog topic; replaying that topic from the earliest
//! offset rebuilds the store.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::trace;

use crate::error::StoreError;
use crate::log::Record;

/// A mutation waiting to be written to the changelog. `None` deletes the key.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangelogEntry {
    pub key: String,
    pub value: Option<Value>,
}

#[derive(Debug)]
pub struct KeyValueStore {
    name: String,
    changelog_topic: String,
    partition: u32,
    entries: BTreeMap<String, Value>,
    pending: Vec<ChangelogEntry>,
}

impl KeyValueStore {
    pub fn new(name: &str, changelog_topic: &str, partition: u32) -> Self {
        Self {
            name: name.to_string(),
            changelog_topic: changelog_topic.to_string(),
            partition,
            entries: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn changelog_topic(&self) -> &str {
        &self.changelog_topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>, StoreError> {
        self.entries
            .get(key)
            .map(|value| self.decode(key, value))
            .transpose()
    }

    pub fn put<V: Serialize>(&mut self, key: &str, value: &V) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|source| StoreError::Encode {
            store: self.name.clone(),
            key: key.to_string(),
            source,
        })?;
        trace!(store = %self.name, key, "put");
        self.entries.insert(key.to_string(), value.clone());
        self.pending.push(ChangelogEntry {
            key: key.to_string(),
            value: Some(value),
        });
        Ok(())
    }

    /// Removes `key`. Returns whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        let existed = self.entries.remove(key).is_some();
        if existed {
            trace!(store = %self.name, key, "delete");
            self.pending.push(ChangelogEntry {
                key: key.to_string(),
                value: None,
            });
        }
        existed
    }

    /// All entries in key order.
    pub fn all<V: DeserializeOwned>(&self) -> Result<Vec<(String, V)>, StoreError> {
        self.entries
            .iter()
            .map(|(key, value)| Ok((key.clone(), self.decode(key, value)?)))
            .collect()
    }

    /// Entries whose key starts with `prefix`, in key order.
    pub fn prefix<V: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, V)>, StoreError> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| Ok((key.clone(), self.decode(key, value)?)))
            .collect()
    }

    pub(crate) fn take_changelog(&mut self) -> Vec<ChangelogEntry> {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Applies one changelog record without capturing it again.
    pub(crate) fn restore(&mut self, record: &Record) {
        match &record.value {
            Some(value) => {
                self.entries.insert(record.key.clone(), value.clone());
            }
            None => {
                self.entries.remove(&record.key);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.clone()
    }

    pub(crate) fn load_snapshot(&mut self, entries: BTreeMap<String, Value>) {
        self.entries = entries;
        self.pending.clear();
    }

    fn decode<V: DeserializeOwned>(&self, key: &str, value: &Value) -> Result<V, StoreError> {
        V::deserialize(value).map_err(|source| StoreError::Corrupt {
            store: self.name.clone(),
            key: key.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn store() -> KeyValueStore {
        KeyValueStore::new("counts", "app-counts-changelog", 1)
    }

    #[test]
    fn test_get_put_delete() {
        let mut store = store();
        assert_eq!(store.get::<u32>("a").unwrap(), None);

        store.put("a", &3u32).unwrap();
        assert_eq!(store.get::<u32>("a").unwrap(), Some(3));

        assert!(store.delete("a"));
        assert!(!store.delete("a"));
        assert_eq!(store.get::<u32>("a").unwrap(), None);
    }

    #[test]
    fn test_mutations_are_captured_for_changelog() {
        let mut store = store();
        store.put("a", &1u32).unwrap();
        store.put("a", &2u32).unwrap();
        store.delete("a");

        let changelog = store.take_changelog();
        assert_eq!(changelog.len(), 3);
        assert_eq!(changelog[1].value, Some(json!(2)));
        assert_eq!(changelog[2].value, None);
        assert!(!store.has_pending());
    }

    #[test]
    fn test_restore_replays_without_recapturing() {
        let mut store = store();
        let record = |offset, key: &str, value: Option<Value>| Record {
            topic: "app-counts-changelog".to_string(),
            partition: 1,
            offset,
            key: key.to_string(),
            value,
            timestamp: Utc::now(),
        };

        store.restore(&record(0, "a", Some(json!(1))));
        store.restore(&record(1, "b", Some(json!(5))));
        store.restore(&record(2, "a", None));

        assert_eq!(store.get::<u32>("a").unwrap(), None);
        assert_eq!(store.get::<u32>("b").unwrap(), Some(5));
        assert!(!store.has_pending());
    }

    #[test]
    fn test_corrupt_value_is_reported() {
        let mut store = store();
        store.put("a", &"not a number").unwrap();
        let err = store.get::<u32>("a").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_prefix_scan() {
        let mut store = store();
        store.put("w1|a", &1u32).unwrap();
        store.put("w1|b", &2u32).unwrap();
        store.put("w2|a", &3u32).unwrap();

        let rows: Vec<(String, u32)> = store.prefix("w1|").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], ("w1|b".to_string(), 2));
    }
}
