use std::sync::Arc;

use crate::codec::Value;

use super::message::Message;

/// Something that happened on a node, delivered to every listener
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// The first peer completed its handshake
    Connect,
    /// A whisper or broadcast was queued for `recv`
    Message(Message),
    /// A synchronized key was written
    Update {
        key: Vec<u8>,
        value: Value,
        owner: String,
        timestamp: i64,
    },
    /// A synchronized key was removed
    Delete { key: Vec<u8> },
    /// A handshaken peer was dropped
    Disconnect { peer_id: String },
}

/// Callback registered with `on_event`
pub type Listener = Arc<dyn Fn(&MeshEvent) + Send + Sync>;
