//! Base-58 with integer semantics
//!
//! Values are treated as big-endian unsigned integers: leading zero bytes carry
//! no weight, so they are not rendered, and zero encodes as `"1"`. Node ids
//! and timestamps are both rendered this way, which lets ids be compared
//! numerically.

use std::cmp::Ordering;

use super::CodecError;

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Encode a big-endian integer
pub fn encode(bytes: &[u8]) -> String {
    let digits = strip_leading_zeros(bytes);
    if digits.is_empty() {
        return "1".to_string();
    }
    bs58::encode(digits).into_string()
}

/// Encode an unsigned integer
pub fn encode_u64(n: u64) -> String {
    encode(&n.to_be_bytes())
}

/// Decode to the minimal big-endian byte form (zero decodes to an empty vec)
pub fn decode(s: &str) -> Result<Vec<u8>, CodecError> {
    let raw = bs58::decode(s)
        .into_vec()
        .map_err(|e| CodecError::InvalidBase58(e.to_string()))?;
    Ok(strip_leading_zeros(&raw).to_vec())
}

pub fn decode_u64(s: &str) -> Result<u64, CodecError> {
    let digits = decode(s)?;
    if digits.len() > 8 {
        return Err(CodecError::InvalidBase58(format!("{} does not fit in u64", s)));
    }
    let mut buf = [0u8; 8];
    buf[8 - digits.len()..].copy_from_slice(&digits);
    Ok(u64::from_be_bytes(buf))
}

/// Numeric comparison of two base-58 strings.
///
/// Strings that fail to decode compare by their raw bytes instead.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (decode(a), decode(b)) {
        (Ok(x), Ok(y)) => x.len().cmp(&y.len()).then_with(|| x.cmp(&y)),
        _ => a.as_bytes().cmp(b.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_small_numbers() {
        assert_eq!(encode_u64(0), "1");
        assert_eq!(encode_u64(1), "2");
        assert_eq!(encode_u64(57), "z");
        assert_eq!(encode_u64(58), "21");
        assert_eq!(decode_u64("21").unwrap(), 58);
        assert_eq!(decode_u64("1").unwrap(), 0);
    }

    #[test]
    fn test_leading_zero_bytes_ignored() {
        assert_eq!(encode(&[0, 0, 1]), encode(&[1]));
        assert_eq!(encode(&[]), "1");
    }

    #[test]
    fn test_invalid_alphabet() {
        assert!(matches!(decode("0OIl"), Err(CodecError::InvalidBase58(_))));
    }

    #[test]
    fn test_u64_overflow() {
        let big = encode(&[0xff; 9]);
        assert!(decode_u64(&big).is_err());
    }

    #[test]
    fn test_compare_is_numeric() {
        // "z" (57) is lexicographically greater than "21" (58) but numerically smaller
        assert_eq!(compare("z", "21"), Ordering::Less);
        assert_eq!(compare("21", "21"), Ordering::Equal);
        assert_eq!(compare(&encode_u64(1000), &encode_u64(999)), Ordering::Greater);
    }

    proptest! {
        #[test]
        fn prop_u64_involution(n in any::<u64>()) {
            prop_assert_eq!(decode_u64(&encode_u64(n)).unwrap(), n);
        }

        #[test]
        fn prop_bytes_involution(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let minimal = strip_leading_zeros(&bytes).to_vec();
            prop_assert_eq!(decode(&encode(&bytes)).unwrap(), minimal);
        }

        #[test]
        fn prop_compare_matches_integers(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(compare(&encode_u64(a), &encode_u64(b)), a.cmp(&b));
        }
    }
}
