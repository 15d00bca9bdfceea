// Waterfall - seen-set for flooded broadcasts
//
// Keyed by (message id, timestamp). Entries older than WATERFALL_TTL_SECS are
// pruned after every insert; a broadcast that old is refused outright, so a
// pruned entry can never be accepted again.

use std::collections::HashSet;

use crate::codec::MessageId;

/// How long a broadcast stays live
pub const WATERFALL_TTL_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaterfallVerdict {
    /// Seen before; drop
    Duplicate,
    /// Older than the TTL; drop without forwarding
    Expired,
    /// First sighting; forward and deliver
    Fresh,
}

#[derive(Debug, Default)]
pub struct Waterfall {
    seen: HashSet<(MessageId, i64)>,
}

impl Waterfall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a broadcast and remember it if it is fresh
    pub fn check(&mut self, id: &MessageId, timestamp: i64, now: i64) -> WaterfallVerdict {
        if self.seen.contains(&(*id, timestamp)) {
            return WaterfallVerdict::Duplicate;
        }
        if timestamp < now - WATERFALL_TTL_SECS {
            return WaterfallVerdict::Expired;
        }
        self.seen.insert((*id, timestamp));
        self.prune(now);
        WaterfallVerdict::Fresh
    }

    /// Remember a broadcast this node originated
    pub fn record(&mut self, id: &MessageId, timestamp: i64) {
        self.seen.insert((*id, timestamp));
    }

    pub fn prune(&mut self, now: i64) {
        let cutoff = now - WATERFALL_TTL_SECS;
        self.seen.retain(|(_, ts)| *ts >= cutoff);
    }

    pub fn contains(&self, id: &MessageId, timestamp: i64) -> bool {
        self.seen.contains(&(*id, timestamp))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
