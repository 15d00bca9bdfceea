//! Sync: a key/value map replicated over the mesh
//!
//! Writes are applied locally, then broadcast with sub-flag `STORE` (whole
//! values) or `DELTA` (map merges). Each key is leased to its last writer for
//! an hour unless the socket was bound with leasing off. A peer that finishes
//! its handshake is sent every key this node holds, owner and timestamp
//! included.

pub mod lease;
pub mod store;

pub use lease::{lease_permits, Metadata, LEASE_SECS};
pub use store::{Change, Rejection, SyncStore};

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::codec::{base58, flags, now_secs, CodecError, InternalMessage, MapKey, Value};
use crate::config::MeshConfig;
use crate::mesh::{HandlerOutcome, MeshCore, MeshError, MeshSocket, MessageHandler};
use crate::transport::Connection;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Key {} is leased by another node", String::from_utf8_lossy(.key))]
    LeaseDenied { key: Vec<u8> },

    #[error("Value at {} is not a map", String::from_utf8_lossy(.key))]
    NotAMap { key: Vec<u8> },

    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl SyncError {
    fn rejected(rejection: Rejection, key: Vec<u8>) -> Self {
        match rejection {
            Rejection::Leased => SyncError::LeaseDenied { key },
            Rejection::NotAMap => SyncError::NotAMap { key },
        }
    }
}

/// A mesh node carrying a synchronized map
#[derive(Debug)]
pub struct SyncSocket {
    mesh: MeshSocket,
    store: Arc<Mutex<SyncStore>>,
}

impl SyncSocket {
    /// Bind a node whose subnet is suffixed `"1"` (leasing) or `"0"`, so
    /// leasing and non-leasing nodes never share a mesh
    pub async fn bind(mut config: MeshConfig, leasing: bool) -> Result<Self, SyncError> {
        let suffix = if leasing { "1" } else { "0" };
        config.protocol = config.protocol.with_subnet_suffix(suffix);
        let store = Arc::new(Mutex::new(SyncStore::new(leasing)));
        let handler: Arc<dyn MessageHandler> = Arc::new(SyncHandler {
            store: Arc::clone(&store),
        });
        let mesh = MeshSocket::bind_with(config, vec![handler]).await?;
        Ok(Self { mesh, store })
    }

    pub fn mesh(&self) -> &MeshSocket {
        &self.mesh
    }

    pub fn leasing(&self) -> bool {
        self.store.lock().leasing()
    }

    /// Write `value` at `key` and broadcast it. `Value::Nil` deletes.
    pub fn set(&self, key: impl Into<Vec<u8>>, value: impl Into<Value>) -> Result<(), SyncError> {
        let key = key.into();
        let value = value.into();
        let meta = Metadata::new(self.mesh.id(), now_secs());
        let result = self
            .store
            .lock()
            .store(key.clone(), value.clone(), meta.clone(), meta.timestamp);
        let change = result.map_err(|r| SyncError::rejected(r, key.clone()))?;
        if let Some(change) = change {
            self.mesh.emit(change.into_event());
        }
        self.mesh
            .send_with(flags::BROADCAST, flags::STORE, vec![Value::Bytes(key), value])?;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.store.lock().get(key).cloned()
    }

    /// Merge `delta` into the map at `key` and broadcast the delta.
    ///
    /// Deltas are not subject to leasing; they fail only when the current
    /// value is not a map.
    pub fn apply_delta(&self, key: impl Into<Vec<u8>>, delta: BTreeMap<MapKey, Value>) -> Result<(), SyncError> {
        let key = key.into();
        let meta = Metadata::new(self.mesh.id(), now_secs());
        let result = self
            .store
            .lock()
            .delta(key.clone(), delta.clone(), meta);
        let change = result.map_err(|r| SyncError::rejected(r, key.clone()))?;
        self.mesh.emit(change.into_event());
        self.mesh.send_with(
            flags::BROADCAST,
            flags::DELTA,
            vec![Value::Bytes(key), Value::Map(delta)],
        )?;
        Ok(())
    }

    /// `set` for each pair, stopping at the first failure
    pub fn update<K, V, I>(&self, pairs: I) -> Result<(), SyncError>
    where
        K: Into<Vec<u8>>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in pairs {
            self.set(key, value)?;
        }
        Ok(())
    }

    pub fn delete(&self, key: impl Into<Vec<u8>>) -> Result<(), SyncError> {
        self.set(key, Value::Nil)
    }

    /// Remove `key` and return what it held
    pub fn pop(&self, key: impl Into<Vec<u8>>) -> Result<Option<Value>, SyncError> {
        let key = key.into();
        let Some(value) = self.get(&key) else {
            return Ok(None);
        };
        self.delete(key)?;
        Ok(Some(value))
    }

    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.store.lock().keys()
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    pub fn metadata(&self, key: &[u8]) -> Option<Metadata> {
        self.store.lock().metadata(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Value> {
        self.store.lock().snapshot()
    }
}

impl Deref for SyncSocket {
    type Target = MeshSocket;

    fn deref(&self) -> &MeshSocket {
        &self.mesh
    }
}

// ============================================================================
// HANDLER
// ============================================================================

/// Applies `STORE` and `DELTA` messages from peers; denied writes are dropped
struct SyncHandler {
    store: Arc<Mutex<SyncStore>>,
}

impl SyncHandler {
    fn handle_store(&self, mesh: &MeshCore, msg: &InternalMessage) {
        let payload = msg.payload();
        let Some(key) = payload.get(1).and_then(Value::as_bytes).map(<[u8]>::to_vec) else {
            debug!("Store without a key from {}", msg.sender());
            return;
        };
        let value = payload.get(2).cloned().unwrap_or_default();

        // Five fields means full-state sync carrying the original lineage
        let meta = if payload.len() == 5 {
            if self.store.lock().contains(&key) {
                return;
            }
            let owner = payload.get(3).and_then(Value::as_str);
            let timestamp = payload
                .get(4)
                .and_then(Value::as_str)
                .and_then(|ts| base58::decode_u64(ts).ok());
            match (owner, timestamp) {
                (Some(owner), Some(ts)) => Metadata::new(owner, ts as i64),
                _ => {
                    debug!("Malformed state sync from {}", msg.sender());
                    return;
                }
            }
        } else {
            Metadata::new(msg.sender(), msg.timestamp())
        };

        let result = self.store.lock().store(key, value, meta, now_secs());
        match result {
            Ok(Some(change)) => mesh.emit(change.into_event()),
            Ok(None) => {}
            Err(rejection) => debug!("Store from {} refused: {:?}", msg.sender(), rejection),
        }
    }

    fn handle_delta(&self, mesh: &MeshCore, msg: &InternalMessage) {
        let payload = msg.payload();
        let key = payload.get(1).and_then(Value::as_bytes).map(<[u8]>::to_vec);
        let delta = payload.get(2).and_then(Value::as_map).cloned();
        let (Some(key), Some(delta)) = (key, delta) else {
            debug!("Malformed delta from {}", msg.sender());
            return;
        };
        let meta = Metadata::new(msg.sender(), msg.timestamp());

        let result = self.store.lock().delta(key, delta, meta);
        match result {
            Ok(change) => mesh.emit(change.into_event()),
            Err(rejection) => debug!("Delta from {} refused: {:?}", msg.sender(), rejection),
        }
    }
}

impl MessageHandler for SyncHandler {
    fn name(&self) -> &'static str {
        "sync"
    }

    fn handle(&self, mesh: &MeshCore, msg: &InternalMessage, _conn: &Arc<Connection>) -> HandlerOutcome {
        match msg.sub_flag() {
            Some(flags::STORE) => self.handle_store(mesh, msg),
            Some(flags::DELTA) => self.handle_delta(mesh, msg),
            _ => return HandlerOutcome::Passthrough,
        }
        HandlerOutcome::Consumed
    }

    fn on_peer_joined(&self, mesh: &MeshCore, peer_id: &str, conn: &Arc<Connection>) {
        let entries = self.store.lock().entries();
        if entries.is_empty() {
            return;
        }
        debug!("Sending {} keys to {}", entries.len(), peer_id);
        for (key, value, meta) in entries {
            let payload = vec![
                Value::from(flags::STORE),
                Value::Bytes(key),
                value,
                Value::Bytes(meta.owner.into_bytes()),
                Value::from(base58::encode_u64(meta.timestamp.max(0) as u64)),
            ];
            if let Err(e) = conn.send(flags::WHISPER, mesh.id(), payload) {
                debug!("State sync to {} failed: {}", peer_id, e);
                return;
            }
        }
    }
}
