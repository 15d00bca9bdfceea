//! Protocol flag bytes
//!
//! Top-level flags go in `msg_type`. Sub-flags lead the payload. The two
//! namespaces overlap on purpose (`broadcast` and `whisper` are both).

// Top-level flags
pub const BROADCAST: u8 = 0x00;
pub const RENEGOTIATE: u8 = 0x01;
pub const WHISPER: u8 = 0x02;
pub const PING: u8 = 0x03;
pub const PONG: u8 = 0x04;

// Sub-flags
pub const COMPRESSION: u8 = 0x01;
pub const HANDSHAKE: u8 = 0x05;
pub const NOTIFY: u8 = 0x06;
pub const PEERS: u8 = 0x07;
pub const REQUEST: u8 = 0x08;
pub const RESEND: u8 = 0x09;
pub const RESPONSE: u8 = 0x0A;
pub const STORE: u8 = 0x0B;
pub const RETRIEVE: u8 = 0x0C;
pub const RETRIEVED: u8 = 0x0D;
pub const FORWARD: u8 = 0x0E;
pub const DELTA: u8 = 0x11;

/// Human-readable name of a sub-flag, for logs
pub fn sub_flag_name(flag: u8) -> &'static str {
    match flag {
        BROADCAST => "broadcast",
        COMPRESSION => "compression",
        WHISPER => "whisper",
        PING => "ping",
        PONG => "pong",
        HANDSHAKE => "handshake",
        NOTIFY => "notify",
        PEERS => "peers",
        REQUEST => "request",
        RESEND => "resend",
        RESPONSE => "response",
        STORE => "store",
        RETRIEVE => "retrieve",
        RETRIEVED => "retrieved",
        FORWARD => "forward",
        DELTA => "delta",
        _ => "unknown",
    }
}

/// Human-readable name of a top-level flag, for logs
pub fn msg_type_name(flag: u8) -> &'static str {
    match flag {
        BROADCAST => "broadcast",
        RENEGOTIATE => "renegotiate",
        WHISPER => "whisper",
        PING => "ping",
        PONG => "pong",
        _ => "unknown",
    }
}
