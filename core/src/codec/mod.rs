//! Wire codec: framing, checksums, compression and MessagePack payloads
//!
//! Every frame on the wire is:
//!
//! ```text
//! [4 bytes]  length of body (BE u32)
//! [N bytes]  body = compress?( sha256(packed) || packed )
//! ```
//!
//! where `packed` is the MessagePack array `[msg_type, sender, timestamp, *payload]`.

pub mod base58;
pub mod compress;
pub mod flags;
pub mod message;
pub mod value;

pub use compress::{compress, decompress, intersect, Compression};
pub use message::{InternalMessage, MessageId};
pub use value::{MapKey, Value};

use thiserror::Error;

/// Codec errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("Buffer too short: need {need} bytes, got {got}")]
    BufferTooShort { need: usize, got: usize },

    #[error("Length header says {declared} bytes, body has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Unknown compression method: {0:#04x}")]
    UnknownCompression(u8),

    #[error("Pack error: {0}")]
    Pack(String),

    #[error("Unpack error: {0}")]
    Unpack(String),

    #[error("Unsupported type: {0}")]
    UnsupportedType(String),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Invalid base58: {0}")]
    InvalidBase58(String),

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
}

/// Length of the checksum that leads every body
pub const CHECKSUM_LEN: usize = 32;

/// Length of the size header
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Largest body a length prefix may announce
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Current unix time in whole seconds
pub fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
