//! Synchronized key/value store
//!
//! Every key carries the metadata of its last accepted write. Whole-value
//! writes go through the lease rule. Deltas merge into map values regardless
//! of the lease, and the key keeps whichever metadata supersedes the other,
//! so replicas that see the same deltas in any order agree on the owner.

use std::collections::{BTreeMap, HashMap};

use crate::codec::{MapKey, Value};
use crate::mesh::MeshEvent;

use super::lease::{lease_permits, Metadata};

/// A write that went through
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Updated {
        key: Vec<u8>,
        value: Value,
        meta: Metadata,
    },
    Deleted {
        key: Vec<u8>,
    },
}

impl Change {
    pub fn into_event(self) -> MeshEvent {
        match self {
            Change::Updated { key, value, meta } => MeshEvent::Update {
                key,
                value,
                owner: meta.owner,
                timestamp: meta.timestamp,
            },
            Change::Deleted { key } => MeshEvent::Delete { key },
        }
    }
}

/// Why a write was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Another node holds the lease
    Leased,
    /// A delta targeted a value that is not a map
    NotAMap,
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    value: Value,
    meta: Metadata,
}

/// Data plus per-key metadata
#[derive(Debug, Default)]
pub struct SyncStore {
    entries: HashMap<Vec<u8>, Entry>,
    leasing: bool,
}

impl SyncStore {
    pub fn new(leasing: bool) -> Self {
        Self {
            entries: HashMap::new(),
            leasing,
        }
    }

    pub fn leasing(&self) -> bool {
        self.leasing
    }

    /// Write `value` at `key`; `Value::Nil` removes the key.
    ///
    /// Returns `Ok(None)` when a removal found nothing to remove.
    pub fn store(&mut self, key: Vec<u8>, value: Value, meta: Metadata, now: i64) -> Result<Option<Change>, Rejection> {
        let current = self.entries.get(&key).map(|e| &e.meta);
        if !lease_permits(current, &meta, now, self.leasing) {
            return Err(Rejection::Leased);
        }

        if value.is_nil() {
            return Ok(self
                .entries
                .remove(&key)
                .map(|_| Change::Deleted { key }));
        }
        self.entries.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                meta: meta.clone(),
            },
        );
        Ok(Some(Change::Updated { key, value, meta }))
    }

    /// Merge `delta` into the map at `key`, creating it when absent
    pub fn delta(&mut self, key: Vec<u8>, delta: BTreeMap<MapKey, Value>, meta: Metadata) -> Result<Change, Rejection> {
        let Some(entry) = self.entries.get_mut(&key) else {
            let value = Value::Map(delta);
            self.entries.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    meta: meta.clone(),
                },
            );
            return Ok(Change::Updated { key, value, meta });
        };

        let Value::Map(map) = &mut entry.value else {
            return Err(Rejection::NotAMap);
        };
        map.extend(delta);
        if meta.supersedes(&entry.meta) {
            entry.meta = meta;
        }
        Ok(Change::Updated {
            key,
            value: entry.value.clone(),
            meta: entry.meta.clone(),
        })
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn metadata(&self, key: &[u8]) -> Option<&Metadata> {
        self.entries.get(key).map(|e| &e.meta)
    }

    /// Keys in byte order
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the data, without metadata
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Value> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// Every key with its value and metadata, for full-state sync
    pub fn entries(&self) -> Vec<(Vec<u8>, Value, Metadata)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone(), e.meta.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
