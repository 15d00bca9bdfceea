// Requests - whispers waiting for a route to their target
//
// A whisper first waits in the RequestTable for a response naming a route,
// then in HeldWhispers until the dial to that route completes its handshake.

use std::collections::HashMap;

use sha2::{Digest, Sha384};

use crate::codec::{base58, Value};

/// Unanswered requests are dropped after this long
pub const REQUEST_TTL_SECS: i64 = 60;

/// Id of a route request: base-58 SHA-384 over `target || base58(now)`
pub fn request_id(target: &str, now: i64) -> String {
    let mut hasher = Sha384::new();
    hasher.update(target.as_bytes());
    hasher.update(base58::encode_u64(now.max(0) as u64).as_bytes());
    base58::encode(&hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingRequest {
    pub target: String,
    /// Whisper payload, sub-flag included
    pub payload: Vec<Value>,
    pub created: i64,
}

#[derive(Debug, Default)]
pub struct RequestTable {
    entries: HashMap<String, PendingRequest>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, request_id: String, request: PendingRequest) {
        self.entries.insert(request_id, request);
    }

    pub fn take(&mut self, request_id: &str) -> Option<PendingRequest> {
        self.entries.remove(request_id)
    }

    /// Drop requests older than the TTL; returns how many went
    pub fn expire(&mut self, now: i64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, req| req.created >= now - REQUEST_TTL_SECS);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whispers held for a target until it finishes a handshake
#[derive(Debug, Default)]
pub struct HeldWhispers {
    entries: HashMap<String, Vec<(i64, Vec<Value>)>>,
}

impl HeldWhispers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&mut self, target: &str, payload: Vec<Value>, now: i64) {
        self.entries
            .entry(target.to_string())
            .or_default()
            .push((now, payload));
    }

    /// Every payload held for `target`, oldest first
    pub fn release(&mut self, target: &str) -> Vec<Vec<Value>> {
        self.entries
            .remove(target)
            .map(|held| held.into_iter().map(|(_, payload)| payload).collect())
            .unwrap_or_default()
    }

    /// Forget `target`'s whispers; returns how many went
    pub fn discard(&mut self, target: &str) -> usize {
        self.entries.remove(target).map_or(0, |held| held.len())
    }

    /// Drop whispers held longer than the request TTL; returns how many went
    pub fn expire(&mut self, now: i64) -> usize {
        let mut dropped = 0;
        self.entries.retain(|_, held| {
            let before = held.len();
            held.retain(|(since, _)| *since >= now - REQUEST_TTL_SECS);
            dropped += before - held.len();
            !held.is_empty()
        });
        dropped
    }

    /// Number of held whispers across every target
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
