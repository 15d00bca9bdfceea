//! InternalMessage: the unit of transport

use sha2::{Digest, Sha256};

use super::compress::{self, Compression};
use super::value::{self, Value};
use super::{now_secs, CodecError, CHECKSUM_LEN, LENGTH_PREFIX_LEN, MAX_FRAME_LEN};

/// SHA-256 of the packed tuple
pub type MessageId = [u8; 32];

/// A message as it travels between two nodes
///
/// Format on the wire:
/// [4 bytes]  length of body (BE u32)
/// [N bytes]  body = compress?( id || packed )
///
/// `packed` is the MessagePack array `[msg_type, sender, timestamp, *payload]`
/// and `id` is its SHA-256. The packed bytes are cached at construction, so a
/// message forwarded verbatim keeps its id.
#[derive(Debug, Clone, PartialEq)]
pub struct InternalMessage {
    msg_type: u8,
    sender: String,
    timestamp: i64,
    payload: Vec<Value>,
    compression: Vec<Compression>,
    packed: Vec<u8>,
    id: MessageId,
}

impl InternalMessage {
    /// Build a message stamped with the current time
    pub fn new(
        msg_type: u8,
        sender: impl Into<String>,
        payload: Vec<Value>,
        compression: Vec<Compression>,
    ) -> Result<Self, CodecError> {
        Self::with_timestamp(msg_type, sender, now_secs(), payload, compression)
    }

    pub fn with_timestamp(
        msg_type: u8,
        sender: impl Into<String>,
        timestamp: i64,
        payload: Vec<Value>,
        compression: Vec<Compression>,
    ) -> Result<Self, CodecError> {
        let sender = sender.into();
        let mut tuple = Vec::with_capacity(payload.len() + 3);
        tuple.push(Value::Int(msg_type as i64));
        tuple.push(Value::Bytes(sender.as_bytes().to_vec()));
        tuple.push(Value::Int(timestamp));
        tuple.extend(payload.iter().cloned());
        let packed = value::pack(&Value::List(tuple))?;
        let id = checksum(&packed);

        Ok(Self {
            msg_type,
            sender,
            timestamp,
            payload,
            compression,
            packed,
            id,
        })
    }

    /// Parse a frame.
    ///
    /// With `sizeless` the input is the body alone; otherwise it must start
    /// with a length prefix matching the rest of the input. The body is tried
    /// against each method in `compressions`, then as raw bytes. The parsed
    /// message remembers `compressions` as its own compression list.
    pub fn feed_string(
        data: &[u8],
        sizeless: bool,
        compressions: &[Compression],
    ) -> Result<Self, CodecError> {
        let body = if sizeless {
            data
        } else {
            if data.len() < LENGTH_PREFIX_LEN {
                return Err(CodecError::BufferTooShort {
                    need: LENGTH_PREFIX_LEN,
                    got: data.len(),
                });
            }
            let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            let actual = data.len() - LENGTH_PREFIX_LEN;
            if declared != actual {
                return Err(CodecError::LengthMismatch { declared, actual });
            }
            &data[LENGTH_PREFIX_LEN..]
        };

        let mut decompressed = None;
        for method in compressions {
            if let Ok(plain) = compress::decompress(body, *method) {
                if verify(&plain) {
                    decompressed = Some(plain);
                    break;
                }
            }
        }
        let plain = match decompressed {
            Some(plain) => plain,
            None if verify(body) => body.to_vec(),
            None if body.len() < CHECKSUM_LEN => {
                return Err(CodecError::BufferTooShort {
                    need: CHECKSUM_LEN,
                    got: body.len(),
                })
            }
            None => return Err(CodecError::ChecksumMismatch),
        };

        Self::from_packed(plain[CHECKSUM_LEN..].to_vec(), compressions.to_vec())
    }

    fn from_packed(packed: Vec<u8>, compression: Vec<Compression>) -> Result<Self, CodecError> {
        let mut items = match value::unpack(&packed)? {
            Value::List(items) => items,
            other => {
                return Err(CodecError::MalformedPacket(format!(
                    "expected list, got {}",
                    other.type_name()
                )))
            }
        };
        if items.len() < 3 {
            return Err(CodecError::MalformedPacket(format!(
                "header has {} fields, need 3",
                items.len()
            )));
        }
        let payload = items.split_off(3);

        let msg_type = items[0]
            .as_int()
            .and_then(|t| u8::try_from(t).ok())
            .ok_or_else(|| CodecError::MalformedPacket("msg_type is not a flag byte".into()))?;
        let sender = items[1]
            .as_str()
            .ok_or_else(|| CodecError::MalformedPacket("sender is not an id".into()))?
            .to_string();
        let timestamp = items[2]
            .as_int()
            .ok_or_else(|| CodecError::MalformedPacket("timestamp is not an integer".into()))?;
        let id = checksum(&packed);

        Ok(Self {
            msg_type,
            sender,
            timestamp,
            payload,
            compression,
            packed,
            id,
        })
    }

    /// Frame the message, compressed with the first method of its compression list
    pub fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::with_capacity(CHECKSUM_LEN + self.packed.len());
        body.extend_from_slice(&self.id);
        body.extend_from_slice(&self.packed);
        if let Some(method) = self.compression.first() {
            body = compress::compress(&body, *method)?;
        }

        if body.len() > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge {
                len: body.len(),
                max: MAX_FRAME_LEN,
            });
        }
        let len = body.len() as u32;
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn msg_type(&self) -> u8 {
        self.msg_type
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn payload(&self) -> &[Value] {
        &self.payload
    }

    pub fn compression(&self) -> &[Compression] {
        &self.compression
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Leading sub-flag of the payload, if it has one
    pub fn sub_flag(&self) -> Option<u8> {
        self.payload
            .first()
            .and_then(Value::as_int)
            .and_then(|f| u8::try_from(f).ok())
    }

    /// Same message, encoded with a different compression list
    pub fn with_compression(mut self, compression: Vec<Compression>) -> Self {
        self.compression = compression;
        self
    }

    /// First bytes of the id in hex, for logs
    pub fn short_id(&self) -> String {
        hex::encode(&self.id[..6])
    }
}

fn checksum(packed: &[u8]) -> MessageId {
    let mut id = [0u8; 32];
    id.copy_from_slice(&Sha256::digest(packed));
    id
}

fn verify(plain: &[u8]) -> bool {
    plain.len() >= CHECKSUM_LEN && checksum(&plain[CHECKSUM_LEN..])[..] == plain[..CHECKSUM_LEN]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::flags;

    fn sample(compression: Vec<Compression>) -> InternalMessage {
        InternalMessage::with_timestamp(
            flags::BROADCAST,
            "2vC4aR9u",
            1_700_000_000,
            vec![Value::from(b"hello"), Value::Int(5), Value::from("text")],
            compression,
        )
        .unwrap()
    }

    #[test]
    fn test_id_is_checksum_of_packed_tuple() {
        let msg = sample(vec![]);
        let frame = msg.serialize().unwrap();
        assert_eq!(&frame[4..36], msg.id());
        assert_eq!(msg.id()[..], Sha256::digest(&frame[36..])[..]);
    }

    #[test]
    fn test_length_prefix() {
        let frame = sample(vec![]).serialize().unwrap();
        let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(declared, frame.len() - 4);
    }

    #[test]
    fn test_id_deterministic() {
        assert_eq!(sample(vec![]).id(), sample(vec![Compression::Zlib]).id());
        let other = InternalMessage::with_timestamp(
            flags::BROADCAST,
            "2vC4aR9u",
            1_700_000_001,
            vec![Value::from(b"hello")],
            vec![],
        )
        .unwrap();
        assert_ne!(sample(vec![]).id(), other.id());
    }

    #[test]
    fn test_roundtrip_uncompressed() {
        let msg = sample(vec![]);
        let parsed = InternalMessage::feed_string(&msg.serialize().unwrap(), false, &[]).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.sub_flag(), None);
    }

    #[test]
    fn test_roundtrip_each_compression() {
        for method in Compression::supported() {
            let msg = sample(vec![method]);
            let frame = msg.serialize().unwrap();
            let parsed = InternalMessage::feed_string(&frame, false, &[method]).unwrap();
            assert_eq!(parsed.id(), msg.id(), "method {}", method);
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn test_compressed_frame_needs_matching_method() {
        let frame = sample(vec![Compression::Lzma]).serialize().unwrap();
        let result = InternalMessage::feed_string(&frame, false, &[Compression::Gzip]);
        assert!(result.is_err());
    }

    #[test]
    fn test_raw_body_accepted_with_any_link_set() {
        let msg = sample(vec![]);
        let parsed =
            InternalMessage::feed_string(&msg.serialize().unwrap(), false, &Compression::supported())
                .unwrap();
        assert_eq!(parsed.id(), msg.id());
    }

    #[test]
    fn test_sizeless() {
        let msg = sample(vec![]);
        let frame = msg.serialize().unwrap();
        let parsed = InternalMessage::feed_string(&frame[4..], true, &[]).unwrap();
        assert_eq!(parsed.id(), msg.id());
    }

    #[test]
    fn test_any_corrupted_byte_rejected() {
        let frame = sample(vec![]).serialize().unwrap();
        for i in 4..frame.len() {
            let mut bad = frame.clone();
            bad[i] ^= 0x01;
            assert!(
                InternalMessage::feed_string(&bad, false, &[]).is_err(),
                "corruption at byte {} not detected",
                i
            );
        }
    }

    #[test]
    fn test_length_mismatch() {
        let mut frame = sample(vec![]).serialize().unwrap();
        frame.push(0);
        assert!(matches!(
            InternalMessage::feed_string(&frame, false, &[]),
            Err(CodecError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_short_inputs() {
        assert!(matches!(
            InternalMessage::feed_string(&[0, 0], false, &[]),
            Err(CodecError::BufferTooShort { .. })
        ));
        assert!(matches!(
            InternalMessage::feed_string(&[0, 0, 0, 2, 1, 2], false, &[]),
            Err(CodecError::BufferTooShort { .. })
        ));
    }

    #[test]
    fn test_malformed_header() {
        let packed = value::pack(&Value::List(vec![Value::Int(0), Value::from(b"id")])).unwrap();
        let mut body = checksum(&packed).to_vec();
        body.extend_from_slice(&packed);
        assert!(matches!(
            InternalMessage::feed_string(&body, true, &[]),
            Err(CodecError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_sub_flag() {
        let msg = InternalMessage::new(
            flags::WHISPER,
            "abc",
            vec![Value::from(flags::PEERS), Value::List(vec![])],
            vec![],
        )
        .unwrap();
        assert_eq!(msg.sub_flag(), Some(flags::PEERS));
    }
}
