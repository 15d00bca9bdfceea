//! Connection: one TCP link to a peer
//!
//! The socket itself lives in the Daemon's reader and writer tasks. A
//! `Connection` is the shared handle to that link: outbound frames go through
//! an unbounded channel to the writer task, and the per-link state (peer id,
//! compression, liveness) sits behind a lock.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::codec::{flags, CodecError, Compression, InternalMessage, Value, LENGTH_PREFIX_LEN, MAX_FRAME_LEN};
use crate::mesh::MeshError;

/// Which side dialed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Lifecycle of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Connected, handshake not yet received
    Awaiting,
    /// Handshake accepted, listed in the routing table
    Active,
    Closed,
}

/// Assembles frames out of an arbitrary byte stream.
///
/// Starts out expecting the 4-byte length prefix. Once that arrives it flips
/// to `active` and expects the whole frame; when the frame completes it is
/// handed back and the reader resets. A prefix announcing more than
/// `MAX_FRAME_LEN` bytes is an error; the link should be dropped.
#[derive(Debug)]
pub struct FrameReader {
    buffer: Vec<u8>,
    expected: usize,
    active: bool,
}

impl FrameReader {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            expected: LENGTH_PREFIX_LEN,
            active: false,
        }
    }

    /// Feed received bytes; returns every frame they complete, length prefix included
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        while self.buffer.len() >= self.expected {
            if !self.active {
                let len = u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(CodecError::FrameTooLarge {
                        len,
                        max: MAX_FRAME_LEN,
                    });
                }
                self.expected = LENGTH_PREFIX_LEN + len;
                self.active = true;
            } else {
                let rest = self.buffer.split_off(self.expected);
                frames.push(std::mem::replace(&mut self.buffer, rest));
                self.expected = LENGTH_PREFIX_LEN;
                self.active = false;
            }
        }
        Ok(frames)
    }

    /// Bytes still needed before the current stage completes
    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True while a frame has started but not finished
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct LinkState {
    state: ConnectionState,
    id: Option<String>,
    addr: Option<(String, u16)>,
    compression: Vec<Compression>,
    last_sent: Option<InternalMessage>,
    last_activity: Instant,
    partial: bool,
}

/// Shared handle to one peer link
#[derive(Debug)]
pub struct Connection {
    handle: u64,
    peer_addr: SocketAddr,
    direction: Direction,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: watch::Sender<bool>,
    link: Mutex<LinkState>,
}

impl Connection {
    /// Create a link handle and the receiving end of its outbound queue
    pub fn new(
        handle: u64,
        peer_addr: SocketAddr,
        direction: Direction,
    ) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let conn = Self {
            handle,
            peer_addr,
            direction,
            outbound,
            closed,
            link: Mutex::new(LinkState {
                state: ConnectionState::Awaiting,
                id: None,
                addr: None,
                compression: Vec::new(),
                last_sent: None,
                last_activity: Instant::now(),
                partial: false,
            }),
        };
        (conn, rx)
    }

    /// Process-local handle, unique per Daemon
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Direction::Outgoing
    }

    pub fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    pub fn set_state(&self, state: ConnectionState) {
        let mut link = self.link.lock();
        if link.state != ConnectionState::Closed {
            link.state = state;
        }
    }

    /// Remote node id, known once the handshake lands
    pub fn id(&self) -> Option<String> {
        self.link.lock().id.clone()
    }

    pub fn set_id(&self, id: impl Into<String>) {
        self.link.lock().id = Some(id.into());
    }

    /// Outward address the peer advertised in its handshake
    pub fn addr(&self) -> Option<(String, u16)> {
        self.link.lock().addr.clone()
    }

    pub fn set_addr(&self, addr: (String, u16)) {
        self.link.lock().addr = Some(addr);
    }

    /// Compression used on this link, most preferred first
    pub fn compression(&self) -> Vec<Compression> {
        self.link.lock().compression.clone()
    }

    pub fn set_compression(&self, compression: Vec<Compression>) {
        self.link.lock().compression = compression;
    }

    /// Record inbound activity
    pub fn touch(&self, partial: bool) {
        let mut link = self.link.lock();
        link.last_activity = Instant::now();
        link.partial = partial;
    }

    /// A frame started more than `timeout` ago and never finished
    pub fn is_stale(&self, timeout: Duration) -> bool {
        let link = self.link.lock();
        link.partial && link.last_activity.elapsed() > timeout
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Signal raised when the link closes
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Close the link. Returns false if it was already closed.
    pub fn close(&self) -> bool {
        self.link.lock().state = ConnectionState::Closed;
        !self.closed.send_replace(true)
    }

    /// Build and send a message from `sender`
    pub fn send(
        &self,
        msg_type: u8,
        sender: &str,
        payload: Vec<Value>,
    ) -> Result<InternalMessage, MeshError> {
        let msg = InternalMessage::new(msg_type, sender, payload, self.compression())?;
        self.send_message(&msg)?;
        Ok(msg)
    }

    /// Send an existing message, re-encoded for this link.
    ///
    /// Renegotiate messages always travel uncompressed.
    pub fn send_message(&self, msg: &InternalMessage) -> Result<(), MeshError> {
        let compression = if msg.msg_type() == flags::RENEGOTIATE {
            Vec::new()
        } else {
            self.compression()
        };
        let msg = msg.clone().with_compression(compression);
        self.push(msg.serialize()?)?;

        if matches!(msg.msg_type(), flags::WHISPER | flags::BROADCAST) {
            self.link.lock().last_sent = Some(msg);
        }
        Ok(())
    }

    /// Retransmit the last whisper or broadcast, uncompressed and with its id intact
    pub fn resend(&self) -> Result<bool, MeshError> {
        let last = self.link.lock().last_sent.clone();
        match last {
            Some(msg) => {
                self.push(msg.with_compression(Vec::new()).serialize()?)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn push(&self, frame: Vec<u8>) -> Result<(), MeshError> {
        if self.is_closed() {
            return Err(MeshError::ConnectionClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| MeshError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn test_conn() -> (Connection, mpsc::UnboundedReceiver<Vec<u8>>) {
        Connection::new(1, "127.0.0.1:4444".parse().unwrap(), Direction::Outgoing)
    }

    #[test]
    fn test_reader_whole_frame() {
        let mut reader = FrameReader::new();
        let frames = reader.feed(&frame(b"hello")).unwrap();
        assert_eq!(frames, vec![frame(b"hello")]);
        assert!(!reader.has_partial());
        assert_eq!(reader.expected(), 4);
    }

    #[test]
    fn test_reader_byte_at_a_time() {
        let mut reader = FrameReader::new();
        let data = frame(b"hello world");
        for (i, b) in data.iter().enumerate() {
            let frames = reader.feed(&[*b]).unwrap();
            if i + 1 < data.len() {
                assert!(frames.is_empty());
                assert!(reader.has_partial());
            } else {
                assert_eq!(frames, vec![data.clone()]);
            }
            if i == 3 {
                assert!(reader.is_active());
                assert_eq!(reader.expected(), data.len());
            }
        }
    }

    #[test]
    fn test_reader_several_frames_in_one_read() {
        let mut reader = FrameReader::new();
        let mut data = frame(b"one");
        data.extend(frame(b"two"));
        data.extend(&frame(b"three")[..5]);
        let frames = reader.feed(&data).unwrap();
        assert_eq!(frames, vec![frame(b"one"), frame(b"two")]);
        assert!(reader.has_partial());
        let frames = reader.feed(&frame(b"three")[5..]).unwrap();
        assert_eq!(frames, vec![frame(b"three")]);
    }

    #[test]
    fn test_reader_rejects_oversized_prefix() {
        let mut reader = FrameReader::new();
        let prefix = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        assert!(matches!(
            reader.feed(&prefix),
            Err(CodecError::FrameTooLarge { len, .. }) if len == MAX_FRAME_LEN + 1
        ));

        let mut reader = FrameReader::new();
        let at_limit = (MAX_FRAME_LEN as u32).to_be_bytes();
        assert!(reader.feed(&at_limit).unwrap().is_empty());
        assert!(reader.is_active());
    }

    #[test]
    fn test_send_uses_link_compression() {
        let (conn, mut rx) = test_conn();
        conn.set_compression(vec![Compression::Zlib]);
        let msg = conn.send(flags::WHISPER, "me", vec![Value::from(b"hi")]).unwrap();
        let bytes = rx.try_recv().unwrap();
        let parsed = InternalMessage::feed_string(&bytes, false, &[Compression::Zlib]).unwrap();
        assert_eq!(parsed.id(), msg.id());
        // raw decode must fail since the body is compressed
        assert!(InternalMessage::feed_string(&bytes, false, &[]).is_err());
    }

    #[test]
    fn test_renegotiate_always_uncompressed() {
        let (conn, mut rx) = test_conn();
        conn.set_compression(vec![Compression::Gzip]);
        conn.send(
            flags::RENEGOTIATE,
            "me",
            vec![Value::from(flags::COMPRESSION), Value::List(vec![])],
        )
        .unwrap();
        let bytes = rx.try_recv().unwrap();
        assert!(InternalMessage::feed_string(&bytes, false, &[]).is_ok());
    }

    #[test]
    fn test_resend_preserves_id_uncompressed() {
        let (conn, mut rx) = test_conn();
        assert!(!conn.resend().unwrap());
        conn.set_compression(vec![Compression::Snappy]);
        let msg = conn.send(flags::BROADCAST, "me", vec![Value::from(b"x")]).unwrap();
        let _ = rx.try_recv().unwrap();
        assert!(conn.resend().unwrap());
        let bytes = rx.try_recv().unwrap();
        let parsed = InternalMessage::feed_string(&bytes, false, &[]).unwrap();
        assert_eq!(parsed.id(), msg.id());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (conn, _rx) = test_conn();
        assert!(conn.close());
        assert!(!conn.close());
        assert_eq!(conn.state(), ConnectionState::Closed);
        conn.set_state(ConnectionState::Active);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.send(flags::WHISPER, "me", vec![]),
            Err(MeshError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_staleness_needs_partial_frame() {
        let (conn, _rx) = test_conn();
        conn.touch(false);
        assert!(!conn.is_stale(Duration::ZERO));
        conn.touch(true);
        std::thread::sleep(Duration::from_millis(5));
        assert!(conn.is_stale(Duration::from_millis(1)));
    }
}
