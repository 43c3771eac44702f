//! Token codec for the textual array grammar.
//!
//! A serialized array is a flat run of base64 tokens separated by
//! [`VAL_SEP`] and terminated by one of the structural separators (or the end
//! of the buffer). Each token is the big-endian byte form of a 64-bit value
//! with leading zero bytes stripped, encoded with the standard alphabet and no
//! padding, so no token can contain a separator byte.

use crate::error::{Result, StoreError};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;

/// Separates values inside one array.
pub const VAL_SEP: u8 = b':';
/// Ends a chunk.
pub const CHUNK_SEP: u8 = b'#';
/// Ends an attribute inside a chunk.
pub const CHUNK_ESEP: u8 = b'$';
/// Ends a nested node inside a chunk.
pub const CHUNK_ENODE_SEP: u8 = b'%';

#[inline]
pub fn is_terminator(byte: u8) -> bool {
    byte == CHUNK_SEP || byte == CHUNK_ESEP || byte == CHUNK_ENODE_SEP
}

pub fn encode_u64(value: u64, out: &mut String) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count().min(7);
    STANDARD_NO_PAD.encode_string(&bytes[skip..], out);
}

pub fn encode_i64(value: i64, out: &mut String) {
    encode_u64(value as u64, out);
}

/// Decodes one token. The empty token decodes to zero.
pub fn decode_u64(token: &[u8]) -> Result<u64> {
    if token.is_empty() {
        return Ok(0);
    }
    let bytes = STANDARD_NO_PAD
        .decode(token)
        .map_err(|e| StoreError::Codec(format!("bad token {:?}: {}", String::from_utf8_lossy(token), e)))?;
    if bytes.len() > 8 {
        return Err(StoreError::Codec(format!(
            "token {:?} exceeds 64 bits",
            String::from_utf8_lossy(token)
        )));
    }
    let mut buf = [0u8; 8];
    buf[8 - bytes.len()..].copy_from_slice(&bytes);
    Ok(u64::from_be_bytes(buf))
}

pub fn decode_i64(token: &[u8]) -> Result<i64> {
    decode_u64(token).map(|v| v as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: i64) -> String {
        let mut out = String::new();
        encode_i64(value, &mut out);
        out
    }

    #[test]
    fn test_small_values_are_short() {
        assert_eq!(encoded(0), "AA");
        assert_eq!(encoded(1), "AQ");
        assert_eq!(encoded(255), "/w");
    }

    #[test]
    fn test_negative_and_extreme_values() {
        for v in [-1i64, i64::MIN, i64::MAX, 1 << 40] {
            assert_eq!(decode_i64(encoded(v).as_bytes()).unwrap(), v);
        }
    }

    #[test]
    fn test_tokens_never_contain_separators() {
        for v in [-1i64, 62, 63, 1 << 33, i64::MIN] {
            let token = encoded(v);
            assert!(!token.bytes().any(|b| b == VAL_SEP || is_terminator(b)));
        }
    }

    #[test]
    fn test_empty_token_is_zero() {
        assert_eq!(decode_u64(b"").unwrap(), 0);
    }

    #[test]
    fn test_oversized_token_is_rejected() {
        assert!(matches!(decode_u64(b"AAAAAAAAAAAAAA"), Err(StoreError::Codec(_))));
    }
}
