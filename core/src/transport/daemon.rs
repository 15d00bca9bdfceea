//! Daemon: the background I/O driver
//!
//! One accept loop, one maintenance tick, and a reader plus a writer task per
//! connection. Everything the tasks learn is reported to a
//! [`ConnectionObserver`] held weakly, so the daemon never keeps its node alive.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::connection::{Connection, Direction, FrameReader};
use crate::mesh::MeshError;

/// Most exceptions kept for `status()`
pub const MAX_EXCEPTIONS: usize = 64;

/// Period of the maintenance tick
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 8192;

/// Receives everything the daemon's tasks observe
pub trait ConnectionObserver: Send + Sync + 'static {
    /// A link was accepted or dialed. Called before any of its frames are delivered.
    fn on_connect(&self, conn: &Arc<Connection>);

    /// A complete frame, length prefix included
    fn on_frame(&self, conn: &Arc<Connection>, frame: Vec<u8>);

    /// The reader stopped. `remote` is true when the peer hung up or the
    /// socket failed, false when the link was closed from this side.
    fn on_disconnect(&self, conn: &Arc<Connection>, remote: bool);

    /// Maintenance tick
    fn on_tick(&self);
}

pub struct Daemon {
    local_addr: SocketAddr,
    observer: Weak<dyn ConnectionObserver>,
    shutdown: watch::Sender<bool>,
    next_handle: AtomicU64,
    exceptions: Mutex<VecDeque<String>>,
}

impl Daemon {
    pub fn new(local_addr: SocketAddr, observer: Weak<dyn ConnectionObserver>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            local_addr,
            observer,
            shutdown,
            next_handle: AtomicU64::new(1),
            exceptions: Mutex::new(VecDeque::new()),
        }
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_alive(&self) -> bool {
        !*self.shutdown.borrow()
    }

    /// Start the accept loop and the maintenance tick
    pub fn start(self: &Arc<Self>, listener: TcpListener) {
        let daemon = Arc::clone(self);
        tokio::spawn(async move { daemon.accept_loop(listener).await });
        let daemon = Arc::clone(self);
        tokio::spawn(async move { daemon.tick_loop().await });
    }

    /// Stop every task. Returns false if already stopped.
    pub fn shutdown(&self) -> bool {
        !self.shutdown.send_replace(true)
    }

    /// Dial a peer and register the link
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> Result<Arc<Connection>, MeshError> {
        if !self.is_alive() {
            return Err(MeshError::Closed);
        }
        let stream = TcpStream::connect(addr).await?;
        info!("Connected to {}", addr);
        Ok(self.register(stream, addr, Direction::Outgoing))
    }

    /// Keep an error for `status()`; the oldest is dropped past the bound
    pub fn record_exception(&self, error: impl Into<String>) {
        let error = error.into();
        warn!("{}", error);
        let mut exceptions = self.exceptions.lock();
        if exceptions.len() == MAX_EXCEPTIONS {
            exceptions.pop_front();
        }
        exceptions.push_back(error);
    }

    pub fn exceptions(&self) -> Vec<String> {
        self.exceptions.lock().iter().cloned().collect()
    }

    fn register(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, direction: Direction) -> Arc<Connection> {
        let _ = stream.set_nodelay(true);
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let (conn, rx) = Connection::new(handle, addr, direction);
        let conn = Arc::new(conn);
        let (read_half, write_half) = stream.into_split();

        let daemon = Arc::clone(self);
        let writer_conn = Arc::clone(&conn);
        tokio::spawn(async move { daemon.write_loop(writer_conn, rx, write_half).await });

        // The observer must see the link before any frame from it
        if let Some(observer) = self.observer.upgrade() {
            observer.on_connect(&conn);
        }

        let daemon = Arc::clone(self);
        let reader_conn = Arc::clone(&conn);
        tokio::spawn(async move { daemon.read_loop(reader_conn, read_half).await });

        conn
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        info!("Listening on {}", self.local_addr);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("Incoming connection from {}", addr);
                        self.register(stream, addr, Direction::Incoming);
                    }
                    Err(e) => {
                        self.record_exception(format!("accept failed: {}", e));
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("Accept loop on {} stopped", self.local_addr);
    }

    async fn tick_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = interval.tick() => match self.observer.upgrade() {
                    Some(observer) => observer.on_tick(),
                    None => break,
                },
            }
        }
    }

    async fn read_loop(self: Arc<Self>, conn: Arc<Connection>, mut reader: OwnedReadHalf) {
        let mut shutdown = self.shutdown.subscribe();
        let mut closed = conn.closed_signal();
        let mut frames = FrameReader::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut remote = false;

        loop {
            if *shutdown.borrow() || *closed.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = closed.changed() => {}
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("Peer {} closed the connection", conn.peer_addr());
                        remote = true;
                        break;
                    }
                    Ok(n) => {
                        let complete = match frames.feed(&buf[..n]) {
                            Ok(complete) => complete,
                            Err(e) => {
                                self.record_exception(format!(
                                    "dropping {} (id {:?}): {}",
                                    conn.peer_addr(),
                                    conn.id(),
                                    e
                                ));
                                remote = true;
                                break;
                            }
                        };
                        conn.touch(frames.has_partial());
                        let Some(observer) = self.observer.upgrade() else { break };
                        for frame in complete {
                            observer.on_frame(&conn, frame);
                        }
                    }
                    Err(e) => {
                        self.record_exception(format!(
                            "read from {} (id {:?}) failed: {}",
                            conn.peer_addr(),
                            conn.id(),
                            e
                        ));
                        remote = true;
                        break;
                    }
                },
            }
        }

        conn.close();
        if let Some(observer) = self.observer.upgrade() {
            observer.on_disconnect(&conn, remote);
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut writer: OwnedWriteHalf,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let mut closed = conn.closed_signal();

        loop {
            if *shutdown.borrow() || *closed.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = closed.changed() => {}
                frame = rx.recv() => match frame {
                    Some(bytes) => {
                        if let Err(e) = writer.write_all(&bytes).await {
                            self.record_exception(format!(
                                "write to {} (id {:?}) failed: {}",
                                conn.peer_addr(),
                                conn.id(),
                                e
                            ));
                            conn.close();
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        let _ = writer.shutdown().await;
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("local_addr", &self.local_addr)
            .field("alive", &self.is_alive())
            .finish()
    }
}
