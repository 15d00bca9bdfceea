use std::fmt;
use std::sync::Weak;

use crate::codec::{InternalMessage, MessageId, Value};

use super::{MeshCore, MeshError};

/// A whisper or broadcast delivered to the application
#[derive(Clone)]
pub struct Message {
    msg: InternalMessage,
    mesh: Weak<MeshCore>,
}

impl Message {
    pub(crate) fn new(msg: InternalMessage, mesh: Weak<MeshCore>) -> Self {
        Self { msg, mesh }
    }

    /// Node id of the originator
    pub fn sender(&self) -> &str {
        self.msg.sender()
    }

    pub fn timestamp(&self) -> i64 {
        self.msg.timestamp()
    }

    pub fn id(&self) -> &MessageId {
        self.msg.id()
    }

    /// Application payload, without the leading sub-flag
    pub fn payload(&self) -> &[Value] {
        self.msg.payload().get(1..).unwrap_or(&[])
    }

    pub fn internal(&self) -> &InternalMessage {
        &self.msg
    }

    /// Whisper back to the sender, through a route request if not directly connected
    pub fn reply(&self, payload: Vec<Value>) -> Result<(), MeshError> {
        let mesh = self.mesh.upgrade().ok_or(MeshError::Closed)?;
        mesh.whisper(self.sender(), payload)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("sender", &self.msg.sender())
            .field("timestamp", &self.msg.timestamp())
            .field("id", &self.msg.short_id())
            .field("payload", &self.payload())
            .finish()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.msg == other.msg
    }
}
