// Leasing - who may overwrite a synchronized key, and when

use serde::{Deserialize, Serialize};

/// A writer holds a key for this long after its last write
pub const LEASE_SECS: i64 = 3600;

/// Owner and write time of a stored key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    /// Node id of the last writer
    pub owner: String,
    /// Unix seconds of the last write
    pub timestamp: i64,
}

impl Metadata {
    pub fn new(owner: impl Into<String>, timestamp: i64) -> Self {
        Self {
            owner: owner.into(),
            timestamp,
        }
    }

    /// Whether the lease has run out at `now`
    pub fn lapsed(&self, now: i64) -> bool {
        self.timestamp < now - LEASE_SECS
    }

    /// Total order used when two writers merge into one key: the later write
    /// wins, and on equal timestamps the lower owner id does, matching the
    /// tiebreak of [`lease_permits`].
    pub fn supersedes(&self, other: &Metadata) -> bool {
        self.timestamp > other.timestamp
            || (self.timestamp == other.timestamp && self.owner.as_bytes() < other.owner.as_bytes())
    }
}

/// Decide whether a write carrying `incoming` may replace `current`.
///
/// Accepted when the key is free, the writer already owns it, the lease has
/// lapsed, the timestamps tie and the current owner sorts higher, or (with
/// leasing off) the incoming write is newer.
pub fn lease_permits(current: Option<&Metadata>, incoming: &Metadata, now: i64, leasing: bool) -> bool {
    let Some(current) = current else {
        return true;
    };
    current.owner == incoming.owner
        || current.lapsed(now)
        || (current.timestamp == incoming.timestamp
            && current.owner.as_bytes() > incoming.owner.as_bytes())
        || (!leasing && current.timestamp < incoming.timestamp)
}
