//! Mesh: the local node of the overlay
//!
//! A [`MeshSocket`] owns a listener, a routing table of handshaken peers, a
//! list of links still awaiting their handshake, and the waterfall seen-set
//! that keeps flooded broadcasts from looping. Incoming messages run through
//! an ordered list of [`MessageHandler`]s; whatever no handler consumes is
//! queued for [`MeshCore::recv`].

pub mod events;
pub mod handlers;
pub mod message;
pub mod peers;
pub mod requests;
pub mod waterfall;

pub use events::{Listener, MeshEvent};
pub use handlers::{HandlerOutcome, MessageHandler};
pub use message::Message;
pub use peers::PeerInfo;
pub use waterfall::{WaterfallVerdict, WATERFALL_TTL_SECS};

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::codec::{compress, flags, now_secs, CodecError, Compression, InternalMessage, Value};
use crate::config::MeshConfig;
use crate::identity::{self, Protocol};
use crate::transport::{Connection, ConnectionObserver, Daemon};

use requests::{HeldWhispers, PendingRequest, RequestTable};
use waterfall::Waterfall;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Socket is closed")]
    Closed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Could not resolve address: {0}")]
    AddressResolution(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

// ============================================================================
// NODE STATE
// ============================================================================

#[derive(Default)]
pub(crate) struct MeshState {
    pub(crate) routing: HashMap<String, Arc<Connection>>,
    pub(crate) awaiting: Vec<Arc<Connection>>,
    pub(crate) waterfall: Waterfall,
    pub(crate) requests: RequestTable,
    pub(crate) held: HeldWhispers,
    pub(crate) dialing: HashSet<(String, u16)>,
    pub(crate) queue: VecDeque<Message>,
}

/// Shared core of a node. Reached through [`MeshSocket`] (or a `SyncSocket`),
/// and handed to every [`MessageHandler`].
pub struct MeshCore {
    me: Weak<MeshCore>,
    id: String,
    protocol: Protocol,
    protocol_id: String,
    out_addr: (String, u16),
    self_addrs: Vec<SocketAddr>,
    compression: Vec<Compression>,
    max_outgoing: usize,
    frame_timeout: Duration,
    daemon: Arc<Daemon>,
    pub(crate) state: Mutex<MeshState>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    listeners: RwLock<Vec<Listener>>,
}

impl MeshCore {
    /// This node's id
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Address advertised to peers
    pub fn out_addr(&self) -> &(String, u16) {
        &self.out_addr
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.daemon.local_addr()
    }

    /// Advertised compression methods, most preferred first
    pub fn compression(&self) -> &[Compression] {
        &self.compression
    }

    pub fn max_outgoing(&self) -> usize {
        self.max_outgoing
    }

    pub fn is_alive(&self) -> bool {
        self.daemon.is_alive()
    }

    /// Ids of every handshaken peer
    pub fn peers(&self) -> Vec<String> {
        self.state.lock().routing.keys().cloned().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().routing.len()
    }

    pub fn awaiting_count(&self) -> usize {
        self.state.lock().awaiting.len()
    }

    pub fn connection(&self, peer_id: &str) -> Option<Arc<Connection>> {
        self.state.lock().routing.get(peer_id).cloned()
    }

    /// Outgoing links, counting dials still in flight
    pub fn outgoing_count(&self) -> usize {
        let state = self.state.lock();
        state.routing.values().filter(|c| c.is_outgoing()).count()
            + state.awaiting.iter().filter(|c| c.is_outgoing()).count()
            + state.dialing.len()
    }

    pub fn waterfall_len(&self) -> usize {
        self.state.lock().waterfall.len()
    }

    pub fn pending_requests(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Routed whispers waiting for their target's handshake
    pub fn held_whispers(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Errors recorded by the daemon; empty means nominal
    pub fn status(&self) -> Vec<String> {
        self.daemon.exceptions()
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Broadcast `payload` to the whole mesh
    pub fn send(&self, payload: Vec<Value>) -> Result<(), MeshError> {
        self.send_with(flags::BROADCAST, flags::BROADCAST, payload)
    }

    /// Send `[sub_flag, *payload]` with top-level flag `msg_type` to every peer.
    ///
    /// Broadcasts are recorded in this node's waterfall so echoes are dropped.
    pub fn send_with(&self, msg_type: u8, sub_flag: u8, payload: Vec<Value>) -> Result<(), MeshError> {
        self.ensure_open()?;
        let mut full = Vec::with_capacity(payload.len() + 1);
        full.push(Value::from(sub_flag));
        full.extend(payload);
        let msg = InternalMessage::new(msg_type, self.id.as_str(), full, Vec::new())?;

        let peers: Vec<Arc<Connection>> = {
            let mut state = self.state.lock();
            if msg_type == flags::BROADCAST {
                state.waterfall.record(msg.id(), msg.timestamp());
            }
            state.routing.values().cloned().collect()
        };
        debug!(
            "Sending {} {} ({}) to {} peers",
            flags::msg_type_name(msg_type),
            flags::sub_flag_name(sub_flag),
            msg.short_id(),
            peers.len()
        );
        for conn in peers {
            if let Err(e) = conn.send_message(&msg) {
                debug!("Send to {:?} failed: {}", conn.id(), e);
            }
        }
        Ok(())
    }

    /// Whisper `payload` to one node.
    ///
    /// Goes direct when `target` is in the routing table. Otherwise a route
    /// request is broadcast and the payload waits for the response.
    pub fn whisper(&self, target: &str, payload: Vec<Value>) -> Result<(), MeshError> {
        self.ensure_open()?;
        let mut full = Vec::with_capacity(payload.len() + 1);
        full.push(Value::from(flags::WHISPER));
        full.extend(payload);

        let direct = self.state.lock().routing.get(target).cloned();
        if let Some(conn) = direct {
            conn.send(flags::WHISPER, &self.id, full)?;
            return Ok(());
        }

        let now = now_secs();
        let request_id = requests::request_id(target, now);
        debug!("No route to {}; requesting one ({})", target, request_id);
        self.state.lock().requests.insert(
            request_id.clone(),
            PendingRequest {
                target: target.to_string(),
                payload: full,
                created: now,
            },
        );
        self.send_with(
            flags::BROADCAST,
            flags::REQUEST,
            vec![
                Value::Bytes(request_id.into_bytes()),
                Value::Bytes(target.as_bytes().to_vec()),
            ],
        )
    }

    /// Ask every peer for its routing table
    pub fn request_peers(&self) -> Result<(), MeshError> {
        self.send_with(flags::WHISPER, flags::REQUEST, vec![Value::from(b"*")])
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Oldest queued message, if any. Never blocks.
    pub fn recv(&self) -> Option<Message> {
        self.state.lock().queue.pop_front()
    }

    /// Up to `n` queued messages, oldest first
    pub fn recv_many(&self, n: usize) -> Vec<Message> {
        let mut state = self.state.lock();
        let take = n.min(state.queue.len());
        state.queue.drain(..take).collect()
    }

    /// Run a decoded message through the handler chain.
    ///
    /// Whispers and broadcasts no handler consumed are queued for `recv`;
    /// anything else is dropped.
    pub fn handle_msg(&self, msg: InternalMessage, conn: &Arc<Connection>) {
        let handlers = self.handlers.read().clone();
        for handler in handlers {
            if handler.handle(self, &msg, conn) == HandlerOutcome::Consumed {
                debug!("Message {} consumed by {}", msg.short_id(), handler.name());
                return;
            }
        }

        match msg.sub_flag() {
            Some(flags::WHISPER) | Some(flags::BROADCAST) => {
                let message = Message::new(msg, self.me.clone());
                self.state.lock().queue.push_back(message.clone());
                self.emit(MeshEvent::Message(message));
            }
            other => debug!("Ignoring message with sub-flag {:?}", other),
        }
    }

    /// Flood a received broadcast onward.
    ///
    /// Fresh broadcasts go to every peer but their originator, unchanged.
    pub fn waterfall(&self, msg: &InternalMessage) -> WaterfallVerdict {
        let (verdict, peers) = {
            let mut state = self.state.lock();
            let verdict = state.waterfall.check(msg.id(), msg.timestamp(), now_secs());
            let peers: Vec<Arc<Connection>> = if verdict == WaterfallVerdict::Fresh {
                state
                    .routing
                    .iter()
                    .filter(|(id, _)| id.as_str() != msg.sender())
                    .map(|(_, conn)| Arc::clone(conn))
                    .collect()
            } else {
                Vec::new()
            };
            (verdict, peers)
        };

        match verdict {
            WaterfallVerdict::Duplicate => debug!("Broadcast {} already seen", msg.short_id()),
            WaterfallVerdict::Expired => debug!("Broadcast {} expired", msg.short_id()),
            WaterfallVerdict::Fresh => {
                for conn in peers {
                    if let Err(e) = conn.send_message(msg) {
                        debug!("Forward to {:?} failed: {}", conn.id(), e);
                    }
                }
            }
        }
        verdict
    }

    // ------------------------------------------------------------------------
    // Handlers and events
    // ------------------------------------------------------------------------

    /// Append a handler; handlers run in registration order
    pub fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().push(handler);
    }

    pub(crate) fn handlers(&self) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers.read().clone()
    }

    /// Names of the handler chain, in the order messages visit it
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.read().iter().map(|h| h.name()).collect()
    }

    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&MeshEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Channel fed with every event from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MeshEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.on_event(move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Deliver an event to every listener. Callers must not hold the state lock.
    pub fn emit(&self, event: MeshEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&event);
        }
    }

    // ------------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------------

    /// Dial a node. Returns false when the address is this node or already linked.
    pub async fn connect(&self, host: &str, port: u16) -> Result<bool, MeshError> {
        self.ensure_open()?;
        if !self.try_reserve_dial(host, port, None) {
            debug!("Connection to {}:{} already established", host, port);
            return Ok(false);
        }
        let result = self.dial(host, port).await;
        self.state.lock().dialing.remove(&(host.to_string(), port));
        result
    }

    /// Dial in the background; used from handlers, which must not block.
    ///
    /// When the dial for a known `id` fails, whispers held for it are dropped.
    pub(crate) fn spawn_dial(&self, host: String, port: u16, id: Option<String>) {
        if !self.is_alive() || !self.try_reserve_dial(&host, port, id.as_deref()) {
            return;
        }
        let Some(core) = self.me.upgrade() else {
            self.state.lock().dialing.remove(&(host, port));
            return;
        };
        tokio::spawn(async move {
            let result = core.dial(&host, port).await;
            core.state.lock().dialing.remove(&(host.clone(), port));
            if let Err(e) = result {
                debug!("Could not connect to {}:{}: {}", host, port, e);
                if let Some(id) = id {
                    let dropped = core.state.lock().held.discard(&id);
                    if dropped > 0 {
                        debug!("Dropped {} whispers held for {}", dropped, id);
                    }
                }
            }
        });
    }

    fn try_reserve_dial(&self, host: &str, port: u16, id: Option<&str>) -> bool {
        if host == self.out_addr.0 && port == self.out_addr.1 {
            return false;
        }
        let key = (host.to_string(), port);
        let mut state = self.state.lock();
        if let Some(id) = id {
            if id == self.id || state.routing.contains_key(id) {
                return false;
            }
        }
        if state
            .routing
            .values()
            .any(|conn| conn.addr().as_ref() == Some(&key))
        {
            return false;
        }
        state.dialing.insert(key)
    }

    async fn dial(&self, host: &str, port: u16) -> Result<bool, MeshError> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| MeshError::AddressResolution(format!("{}:{}", host, port)))?;
        if self.is_self_addr(&addr) {
            return Ok(false);
        }
        info!("Connecting to {}:{}", host, port);
        self.daemon.connect(addr).await?;
        Ok(true)
    }

    fn is_self_addr(&self, addr: &SocketAddr) -> bool {
        let local = self.daemon.local_addr();
        self.self_addrs.contains(addr)
            || (local.ip().is_unspecified() && addr.port() == local.port() && addr.ip().is_loopback())
    }

    /// Close a link and forget it
    pub fn disconnect(&self, conn: &Arc<Connection>) {
        conn.close();
        let removed = {
            let mut state = self.state.lock();
            state.awaiting.retain(|c| c.handle() != conn.handle());
            match conn.id() {
                Some(id) if state.routing.get(&id).map(|c| c.handle()) == Some(conn.handle()) => {
                    state.routing.remove(&id);
                    Some(id)
                }
                _ => None,
            }
        };
        if let Some(peer_id) = removed {
            info!("Connection to node {} has been closed", peer_id);
            self.emit(MeshEvent::Disconnect { peer_id });
        }
    }

    /// Stop the daemon and drop every link. Idempotent.
    pub fn close(&self) {
        if !self.daemon.shutdown() {
            return;
        }
        let conns: Vec<Arc<Connection>> = {
            let mut state = self.state.lock();
            state.dialing.clear();
            let mut conns: Vec<_> = state.routing.drain().map(|(_, c)| c).collect();
            conns.append(&mut state.awaiting);
            conns
        };
        for conn in conns {
            conn.close();
        }
        info!("Node {} closed", self.id);
    }

    fn ensure_open(&self) -> Result<(), MeshError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(MeshError::Closed)
        }
    }

    /// Shuffled `(address, id)` of every peer except `exclude`
    pub(crate) fn peer_list(&self, exclude: Option<&str>) -> Vec<PeerInfo> {
        let mut list: Vec<PeerInfo> = {
            let state = self.state.lock();
            state
                .routing
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != exclude)
                .filter_map(|(id, conn)| {
                    conn.addr().map(|addr| PeerInfo {
                        addr,
                        id: id.clone(),
                    })
                })
                .collect()
        };
        list.shuffle(&mut rand::thread_rng());
        list
    }

    fn handshake_payload(&self) -> Vec<Value> {
        vec![
            Value::from(flags::HANDSHAKE),
            Value::Bytes(self.id.as_bytes().to_vec()),
            Value::Bytes(self.protocol_id.as_bytes().to_vec()),
            peers::encode_addr(&self.out_addr),
            Value::List(
                self.compression
                    .iter()
                    .map(|c| Value::from(c.as_u8()))
                    .collect(),
            ),
        ]
    }

    pub(crate) fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    fn handle_renegotiate(&self, msg: &InternalMessage, conn: &Arc<Connection>) {
        match msg.sub_flag() {
            Some(flags::COMPRESSION) => {
                let methods = compress::from_ids(
                    msg.payload()
                        .get(1)
                        .and_then(Value::as_list)
                        .unwrap_or(&[])
                        .iter()
                        .filter_map(Value::as_int),
                );
                if methods != conn.compression() {
                    debug!("Compression on {:?} changed to {:?}", conn.id(), methods);
                    conn.set_compression(methods.clone());
                    let reply = compress::intersect(&self.compression, &methods);
                    let reply = reply.iter().map(|c| Value::from(c.as_u8())).collect();
                    if let Err(e) = conn.send(
                        flags::RENEGOTIATE,
                        &self.id,
                        vec![Value::from(flags::COMPRESSION), Value::List(reply)],
                    ) {
                        debug!("Renegotiate reply failed: {}", e);
                    }
                }
            }
            Some(flags::RESEND) => {
                if let Err(e) = conn.resend() {
                    debug!("Resend failed: {}", e);
                }
            }
            other => debug!("Unknown renegotiate sub-flag {:?}", other),
        }
    }

    fn request_renegotiation(&self, conn: &Arc<Connection>) {
        conn.set_compression(Vec::new());
        let sent = conn
            .send(
                flags::RENEGOTIATE,
                &self.id,
                vec![Value::from(flags::COMPRESSION), Value::List(Vec::new())],
            )
            .and_then(|_| conn.send(flags::RENEGOTIATE, &self.id, vec![Value::from(flags::RESEND)]));
        if let Err(e) = sent {
            debug!("Could not request renegotiation: {}", e);
        }
    }
}

impl ConnectionObserver for MeshCore {
    fn on_connect(&self, conn: &Arc<Connection>) {
        self.state.lock().awaiting.push(Arc::clone(conn));
        if let Err(e) = conn.send(flags::WHISPER, &self.id, self.handshake_payload()) {
            warn!("Handshake to {} failed: {}", conn.peer_addr(), e);
            self.disconnect(conn);
        }
    }

    fn on_frame(&self, conn: &Arc<Connection>, frame: Vec<u8>) {
        let msg = match InternalMessage::feed_string(&frame, false, &conn.compression()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(
                    "Failed to decode message from {}: {}. Expected compression: {:?}",
                    conn.peer_addr(),
                    e,
                    conn.compression().first()
                );
                self.request_renegotiation(conn);
                return;
            }
        };
        debug!(
            "Received {} {} ({}) from {}",
            flags::msg_type_name(msg.msg_type()),
            msg.sub_flag().map(flags::sub_flag_name).unwrap_or("-"),
            msg.short_id(),
            msg.sender()
        );

        match msg.msg_type() {
            flags::RENEGOTIATE => {
                self.handle_renegotiate(&msg, conn);
                return;
            }
            flags::BROADCAST => {
                if self.waterfall(&msg) != WaterfallVerdict::Fresh {
                    return;
                }
            }
            flags::PING => {
                let _ = conn.send(flags::PONG, &self.id, Vec::new());
                return;
            }
            flags::PONG => return,
            _ => {}
        }
        self.handle_msg(msg, conn);
    }

    fn on_disconnect(&self, conn: &Arc<Connection>, remote: bool) {
        self.disconnect(conn);
        if remote && self.is_alive() {
            let _ = self.request_peers();
        }
    }

    fn on_tick(&self) {
        let stale: Vec<Arc<Connection>> = {
            let state = self.state.lock();
            state
                .routing
                .values()
                .chain(state.awaiting.iter())
                .filter(|c| c.is_stale(self.frame_timeout))
                .cloned()
                .collect()
        };
        for conn in stale {
            info!("Dropping {}: frame incomplete for {:?}", conn.peer_addr(), self.frame_timeout);
            self.disconnect(&conn);
        }

        let now = now_secs();
        let mut state = self.state.lock();
        state.waterfall.prune(now);
        let expired = state.requests.expire(now);
        if expired > 0 {
            debug!("Expired {} unanswered requests", expired);
        }
        let expired = state.held.expire(now);
        if expired > 0 {
            debug!("Expired {} whispers whose target never connected", expired);
        }
    }
}

impl std::fmt::Debug for MeshCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshCore")
            .field("id", &self.id)
            .field("out_addr", &self.out_addr)
            .field("local_addr", &self.local_addr())
            .field("peers", &self.peer_count())
            .finish()
    }
}

// ============================================================================
// SOCKET HANDLE
// ============================================================================

/// Owning handle to a mesh node. Dropping it closes the node.
#[derive(Debug)]
pub struct MeshSocket {
    core: Arc<MeshCore>,
}

impl MeshSocket {
    /// Bind a listener and start the daemon
    pub async fn bind(config: MeshConfig) -> Result<Self, MeshError> {
        Self::bind_with(config, Vec::new()).await
    }

    /// Bind with `handlers` appended to the built-in chain before the first
    /// connection can be accepted
    pub async fn bind_with(
        config: MeshConfig,
        handlers: Vec<Arc<dyn MessageHandler>>,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let listener = TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;

        let out_addr = match &config.out_addr {
            Some(addr) => addr.clone(),
            None if config.bind_addr == "0.0.0.0" => {
                (identity::lan_ip().await.to_string(), local_addr.port())
            }
            None => (config.bind_addr.clone(), local_addr.port()),
        };
        let mut self_addrs: Vec<SocketAddr> = tokio::net::lookup_host((out_addr.0.as_str(), out_addr.1))
            .await
            .map(|addrs| addrs.collect())
            .unwrap_or_default();
        self_addrs.push(local_addr);

        let protocol_id = config.protocol.id();
        let id = identity::node_id(&out_addr, &config.protocol);
        let mut chain = handlers::builtin();
        chain.extend(handlers);

        let core = Arc::new_cyclic(|me: &Weak<MeshCore>| {
            let observer: Weak<dyn ConnectionObserver> = me.clone();
            MeshCore {
                me: me.clone(),
                id,
                protocol: config.protocol.clone(),
                protocol_id,
                out_addr,
                self_addrs,
                compression: config.compression.clone(),
                max_outgoing: config.max_outgoing,
                frame_timeout: Duration::from_secs(config.frame_timeout_secs),
                daemon: Arc::new(Daemon::new(local_addr, observer)),
                state: Mutex::new(MeshState::default()),
                handlers: RwLock::new(chain),
                listeners: RwLock::new(Vec::new()),
            }
        });
        core.daemon.start(listener);
        info!(
            "Node {} up on {} (advertising {}:{})",
            core.id, local_addr, core.out_addr.0, core.out_addr.1
        );
        Ok(Self { core })
    }

    /// Shared core, for handlers and wrappers that outlive a borrow
    pub fn core(&self) -> &Arc<MeshCore> {
        &self.core
    }
}

impl Deref for MeshSocket {
    type Target = MeshCore;

    fn deref(&self) -> &MeshCore {
        &self.core
    }
}

impl Drop for MeshSocket {
    fn drop(&mut self) {
        self.core.close();
    }
}
