// MeshSync Core: gossip mesh with a synchronized map on top
//
// Nodes flood broadcasts through a waterfall seen-set, whisper to single
// peers, and replicate a leased key/value map.

pub mod codec;
pub mod config;
pub mod identity;
pub mod mesh;
pub mod sync;
pub mod transport;

pub use codec::{CodecError, Compression, InternalMessage, MapKey, MessageId, Value};
pub use config::MeshConfig;
pub use identity::{Protocol, PROTOCOL_VERSION};
pub use mesh::{
    HandlerOutcome, Listener, MeshCore, MeshError, MeshEvent, MeshSocket, Message, MessageHandler,
    PeerInfo, WaterfallVerdict,
};
pub use sync::{Metadata, SyncError, SyncSocket};
pub use transport::Connection;
