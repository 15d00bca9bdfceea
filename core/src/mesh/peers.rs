//! Peer lists exchanged after a handshake
//!
//! On the wire a peer list is `[[[host, port], id], ...]` with ids carried as
//! byte strings.

use crate::codec::Value;

/// A peer as advertised by another node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: (String, u16),
    pub id: String,
}

pub fn encode_addr(addr: &(String, u16)) -> Value {
    Value::List(vec![Value::from(addr.0.as_str()), Value::from(addr.1)])
}

pub fn decode_addr(value: &Value) -> Option<(String, u16)> {
    match value.as_list()? {
        [host, port] => {
            let host = host.as_str()?.to_string();
            let port = u16::try_from(port.as_int()?).ok()?;
            Some((host, port))
        }
        _ => None,
    }
}

pub fn encode_peer(peer: &PeerInfo) -> Value {
    Value::List(vec![
        encode_addr(&peer.addr),
        Value::Bytes(peer.id.as_bytes().to_vec()),
    ])
}

pub fn decode_peer(value: &Value) -> Option<PeerInfo> {
    match value.as_list()? {
        [addr, id] => Some(PeerInfo {
            addr: decode_addr(addr)?,
            id: id.as_str()?.to_string(),
        }),
        _ => None,
    }
}

pub fn encode_peer_list(peers: &[PeerInfo]) -> Value {
    Value::List(peers.iter().map(encode_peer).collect())
}

/// Decode a peer list, skipping malformed entries
pub fn decode_peer_list(value: &Value) -> Vec<PeerInfo> {
    value
        .as_list()
        .map(|items| items.iter().filter_map(decode_peer).collect())
        .unwrap_or_default()
}
