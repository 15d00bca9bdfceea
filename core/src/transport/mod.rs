// Transport module - TCP links and the daemon that drives them

pub mod connection;
pub mod daemon;

pub use connection::{Connection, ConnectionState, Direction, FrameReader};
pub use daemon::{ConnectionObserver, Daemon, MAX_EXCEPTIONS, TICK_INTERVAL};
