//! Message handlers
//!
//! Each handler looks at the leading sub-flag of a payload and either consumes
//! the message or lets it pass to the next handler. The built-in chain is
//! handshake, peers, response, request; anything registered later runs after
//! them.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info};

use crate::codec::{base58, compress, flags, now_secs, InternalMessage, Value};
use crate::transport::{Connection, ConnectionState};

use super::events::MeshEvent;
use super::peers;
use super::MeshCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Consumed,
    Passthrough,
}

pub trait MessageHandler: Send + Sync {
    /// Name for logs
    fn name(&self) -> &'static str;

    fn handle(&self, mesh: &MeshCore, msg: &InternalMessage, conn: &Arc<Connection>) -> HandlerOutcome;

    /// Called once a peer finishes its handshake, after the peer list is sent
    fn on_peer_joined(&self, _mesh: &MeshCore, _peer_id: &str, _conn: &Arc<Connection>) {}
}

pub(crate) fn builtin() -> Vec<Arc<dyn MessageHandler>> {
    vec![
        Arc::new(HandshakeHandler),
        Arc::new(PeersHandler),
        Arc::new(ResponseHandler),
        Arc::new(RequestHandler),
    ]
}

fn id_at(payload: &[Value], idx: usize) -> Option<String> {
    payload.get(idx).and_then(Value::as_str).map(str::to_string)
}

/// `[HANDSHAKE, id, protocol_id, [host, port], [compression ids]]`
pub struct HandshakeHandler;

impl MessageHandler for HandshakeHandler {
    fn name(&self) -> &'static str {
        "handshake"
    }

    fn handle(&self, mesh: &MeshCore, msg: &InternalMessage, conn: &Arc<Connection>) -> HandlerOutcome {
        if msg.sub_flag() != Some(flags::HANDSHAKE) {
            return HandlerOutcome::Passthrough;
        }
        let payload = msg.payload();
        let (Some(peer_id), Some(protocol_id)) = (id_at(payload, 1), id_at(payload, 2)) else {
            debug!("Malformed handshake from {}", conn.peer_addr());
            return HandlerOutcome::Consumed;
        };
        if protocol_id != mesh.protocol_id() {
            info!("Protocol mismatch with {}; disconnecting", conn.peer_addr());
            mesh.disconnect(conn);
            return HandlerOutcome::Consumed;
        }
        if peer_id == mesh.id() {
            debug!("Connected to self through {}; disconnecting", conn.peer_addr());
            mesh.disconnect(conn);
            return HandlerOutcome::Consumed;
        }

        let advertised = compress::from_ids(
            payload
                .get(4)
                .and_then(Value::as_list)
                .unwrap_or(&[])
                .iter()
                .filter_map(Value::as_int),
        );
        let previous_id = conn.id().filter(|id| *id != peer_id);
        conn.set_id(peer_id.as_str());
        if let Some(addr) = payload.get(3).and_then(peers::decode_addr) {
            conn.set_addr(addr);
        }
        conn.set_compression(compress::intersect(mesh.compression(), &advertised));

        let mut replaced = None;
        let mut renamed = None;
        let (first_peer, held) = {
            let mut state = mesh.state.lock();
            state.awaiting.retain(|c| c.handle() != conn.handle());
            let first_peer = state.routing.is_empty();
            // A link that handshakes again under a new id leaves its old entry
            if let Some(old_id) = previous_id {
                if state.routing.get(&old_id).map(|c| c.handle()) == Some(conn.handle()) {
                    state.routing.remove(&old_id);
                    renamed = Some(old_id);
                }
            }
            if let Some(existing) = state.routing.get(&peer_id).cloned() {
                if existing.handle() != conn.handle() {
                    let own_greater = base58::compare(mesh.id(), &peer_id) == Ordering::Greater;
                    if own_greater ^ conn.is_outgoing() {
                        drop(state);
                        info!("Resolving conflict with {}: keeping existing link", peer_id);
                        conn.close();
                        if let Some(old_id) = renamed {
                            mesh.emit(MeshEvent::Disconnect { peer_id: old_id });
                        }
                        return HandlerOutcome::Consumed;
                    }
                    info!("Resolving conflict with {}: keeping new link", peer_id);
                    replaced = Some(existing);
                }
            }
            state.routing.insert(peer_id.clone(), Arc::clone(conn));
            conn.set_state(ConnectionState::Active);
            (first_peer, state.held.release(&peer_id))
        };
        if let Some(old) = replaced {
            old.close();
        }
        if let Some(old_id) = renamed {
            info!("Link {} now claims id {} instead of {}", conn.peer_addr(), peer_id, old_id);
            mesh.emit(MeshEvent::Disconnect { peer_id: old_id });
        }
        info!("Handshake complete with {} ({})", peer_id, conn.peer_addr());

        let list = peers::encode_peer_list(&mesh.peer_list(Some(&peer_id)));
        if let Err(e) = conn.send(flags::WHISPER, mesh.id(), vec![Value::from(flags::PEERS), list]) {
            debug!("Peer list to {} failed: {}", peer_id, e);
        }
        if first_peer {
            mesh.emit(MeshEvent::Connect);
        }
        for handler in mesh.handlers() {
            handler.on_peer_joined(mesh, &peer_id, conn);
        }
        for payload in held {
            if let Err(e) = conn.send(flags::WHISPER, mesh.id(), payload) {
                debug!("Held whisper to {} failed: {}", peer_id, e);
            }
        }
        HandlerOutcome::Consumed
    }
}

/// `[PEERS, [[[host, port], id], ...]]`: dial peers we do not know yet
pub struct PeersHandler;

impl MessageHandler for PeersHandler {
    fn name(&self) -> &'static str {
        "peers"
    }

    fn handle(&self, mesh: &MeshCore, msg: &InternalMessage, _conn: &Arc<Connection>) -> HandlerOutcome {
        if msg.sub_flag() != Some(flags::PEERS) {
            return HandlerOutcome::Passthrough;
        }
        let Some(list) = msg.payload().get(1) else {
            return HandlerOutcome::Consumed;
        };
        for peer in peers::decode_peer_list(list) {
            if mesh.outgoing_count() >= mesh.max_outgoing() {
                break;
            }
            if peer.id == mesh.id() || mesh.connection(&peer.id).is_some() {
                continue;
            }
            debug!("Learned of {} at {}:{}", peer.id, peer.addr.0, peer.addr.1);
            mesh.spawn_dial(peer.addr.0, peer.addr.1, Some(peer.id));
        }
        HandlerOutcome::Consumed
    }
}

/// `[RESPONSE, request_id, [[host, port], target]]`: a route to a whisper target
pub struct ResponseHandler;

impl MessageHandler for ResponseHandler {
    fn name(&self) -> &'static str {
        "response"
    }

    fn handle(&self, mesh: &MeshCore, msg: &InternalMessage, _conn: &Arc<Connection>) -> HandlerOutcome {
        if msg.sub_flag() != Some(flags::RESPONSE) {
            return HandlerOutcome::Passthrough;
        }
        let payload = msg.payload();
        let Some(request_id) = id_at(payload, 1) else {
            return HandlerOutcome::Consumed;
        };
        let Some(request) = mesh.state.lock().requests.take(&request_id) else {
            return HandlerOutcome::Consumed;
        };
        let Some(peer) = payload.get(2).and_then(peers::decode_peer) else {
            debug!("Malformed response for request {}", request_id);
            return HandlerOutcome::Consumed;
        };
        debug!("Route to {} found at {}:{}", peer.id, peer.addr.0, peer.addr.1);

        match mesh.connection(&request.target) {
            Some(target) => {
                if let Err(e) = target.send(flags::WHISPER, mesh.id(), request.payload) {
                    debug!("Whisper to {} failed: {}", request.target, e);
                }
            }
            None => {
                mesh.state
                    .lock()
                    .held
                    .hold(&request.target, request.payload, now_secs());
                mesh.spawn_dial(peer.addr.0, peer.addr.1, Some(request.target));
            }
        }
        HandlerOutcome::Consumed
    }
}

/// `[REQUEST, "*"]` asks for a peer list; `[REQUEST, request_id, target]`
/// asks whoever is linked to `target` for its address
pub struct RequestHandler;

impl MessageHandler for RequestHandler {
    fn name(&self) -> &'static str {
        "request"
    }

    fn handle(&self, mesh: &MeshCore, msg: &InternalMessage, conn: &Arc<Connection>) -> HandlerOutcome {
        if msg.sub_flag() != Some(flags::REQUEST) {
            return HandlerOutcome::Passthrough;
        }
        let payload = msg.payload();
        let Some(request_id) = id_at(payload, 1) else {
            return HandlerOutcome::Consumed;
        };

        if request_id == "*" {
            let list = peers::encode_peer_list(&mesh.peer_list(conn.id().as_deref()));
            if let Err(e) = conn.send(flags::WHISPER, mesh.id(), vec![Value::from(flags::PEERS), list]) {
                debug!("Peer list reply failed: {}", e);
            }
            return HandlerOutcome::Consumed;
        }

        let Some(target) = id_at(payload, 2) else {
            return HandlerOutcome::Consumed;
        };
        let Some(addr) = mesh.connection(&target).and_then(|c| c.addr()) else {
            return HandlerOutcome::Consumed;
        };
        let answer = vec![
            Value::from(flags::RESPONSE),
            Value::Bytes(request_id.into_bytes()),
            peers::encode_peer(&peers::PeerInfo { addr, id: target }),
        ];
        match conn.send(flags::BROADCAST, mesh.id(), answer) {
            Ok(sent) => mesh.state.lock().waterfall.record(sent.id(), sent.timestamp()),
            Err(e) => debug!("Response failed: {}", e),
        }
        HandlerOutcome::Consumed
    }
}
