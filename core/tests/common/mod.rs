// Shared helpers for the loopback integration tests
#![allow(dead_code)]

use std::time::{Duration, Instant};

use meshsync_core::codec::flags;
use meshsync_core::transport::FrameReader;
use meshsync_core::{InternalMessage, MeshConfig, MeshSocket, Message, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const HOST: &str = "127.0.0.1";

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("warn")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Node on an OS-assigned loopback port
pub async fn node() -> MeshSocket {
    MeshSocket::bind(MeshConfig::local(0))
        .await
        .expect("Failed to bind node")
}

pub fn port_of(node: &MeshSocket) -> u16 {
    node.local_addr().port()
}

/// Poll `cond` until it holds or `timeout` passes
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// First queued message within `timeout`
pub async fn recv_within(node: &MeshSocket, timeout: Duration) -> Option<Message> {
    let mut got = None;
    wait_until(timeout, || {
        got = node.recv();
        got.is_some()
    })
    .await;
    got
}

/// Everything queued on `node` once `settle` has passed
pub async fn drain_after(node: &MeshSocket, settle: Duration) -> Vec<Message> {
    tokio::time::sleep(settle).await;
    node.recv_many(usize::MAX)
}

/// A bare socket that speaks just enough of the protocol to be routed.
///
/// It advertises no compression, so everything the node sends it is plain.
pub struct RawPeer {
    pub id: String,
    stream: TcpStream,
    reader: FrameReader,
    ready: Vec<Vec<u8>>,
}

impl RawPeer {
    /// Open a socket without handshaking
    pub async fn dial(port: u16) -> Self {
        let stream = TcpStream::connect((HOST, port)).await.expect("raw dial failed");
        Self {
            id: String::new(),
            stream,
            reader: FrameReader::new(),
            ready: Vec::new(),
        }
    }

    /// Dial `node` and handshake as `id`
    pub async fn join(node: &MeshSocket, id: &str) -> Self {
        let mut peer = Self::dial(port_of(node)).await;
        peer.handshake(&node.protocol().id(), id).await;
        peer
    }

    pub async fn handshake(&mut self, protocol_id: &str, id: &str) {
        self.id = id.to_string();
        let hello = InternalMessage::new(
            flags::WHISPER,
            id,
            vec![
                Value::from(flags::HANDSHAKE),
                Value::from(id.as_bytes()),
                Value::from(protocol_id.as_bytes()),
                Value::List(vec![Value::from(HOST), Value::from(1u16)]),
                Value::List(Vec::new()),
            ],
            Vec::new(),
        )
        .unwrap();
        self.send(&hello).await;
    }

    /// Build and send an uncompressed message from this peer
    pub async fn send_as(&mut self, msg_type: u8, payload: Vec<Value>) -> InternalMessage {
        let msg = InternalMessage::new(msg_type, self.id.as_str(), payload, Vec::new()).unwrap();
        self.send(&msg).await;
        msg
    }

    pub async fn send(&mut self, msg: &InternalMessage) {
        self.write(&msg.serialize().unwrap()).await;
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("raw write failed");
    }

    /// Next message from the node, or None on timeout or a closed link
    pub async fn next(&mut self, timeout: Duration) -> Option<InternalMessage> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = [0u8; 4096];
        loop {
            if !self.ready.is_empty() {
                let frame = self.ready.remove(0);
                return Some(InternalMessage::feed_string(&frame, false, &[]).expect("undecodable frame"));
            }
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await;
            match read {
                Ok(Ok(n)) if n > 0 => {
                    let frames = self.reader.feed(&buf[..n]).expect("oversized frame");
                    self.ready.extend(frames);
                }
                _ => return None,
            }
        }
    }

    /// First message within `timeout` that matches `pred`; others are skipped
    pub async fn expect<F>(&mut self, timeout: Duration, mut pred: F) -> Option<InternalMessage>
    where
        F: FnMut(&InternalMessage) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let msg = self.next(left).await?;
            if pred(&msg) {
                return Some(msg);
            }
        }
    }

    /// Every message that arrives within `window`
    pub async fn collect(&mut self, window: Duration) -> Vec<InternalMessage> {
        let deadline = Instant::now() + window;
        let mut out = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.next(left).await {
                Some(msg) => out.push(msg),
                None => return out,
            }
        }
    }

    /// True once the node has closed the link, within `timeout`
    pub async fn closed_within(&mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }
}
