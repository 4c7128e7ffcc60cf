//! Token pack/unpack.
//!
//! Layout: one version byte, `created_at` as little-endian `u64` seconds,
//! three length-prefixed blobs (serialized state, output schema, input
//! schema), then 32 bytes of HMAC-SHA-256 over everything before it. The
//! whole token is base64. The schemas ride along so the server can
//! validate the next exchange batch without replaying init.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use vgi_types::RpcError;

use crate::key::{SigningKey, MAC_LEN};

/// Current token layout version.
pub const TOKEN_VERSION: u8 = 2;

/// Smallest well-formed token: version + timestamp + three empty
/// length-prefixed blobs + MAC.
pub const MIN_TOKEN_LEN: usize = 1 + 8 + 4 + 4 + 4 + MAC_LEN;

/// A verified, decoded token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedToken {
    pub state: Vec<u8>,
    pub output_schema: Vec<u8>,
    pub input_schema: Vec<u8>,
    pub created_at: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn pack_at(
    state: &[u8],
    output_schema: &[u8],
    input_schema: &[u8],
    key: &SigningKey,
    created_at: u64,
) -> String {
    let mut payload = Vec::with_capacity(
        MIN_TOKEN_LEN + state.len() + output_schema.len() + input_schema.len(),
    );
    payload.push(TOKEN_VERSION);
    payload.extend_from_slice(&created_at.to_le_bytes());
    for blob in [state, output_schema, input_schema] {
        payload.extend_from_slice(&(blob.len() as u32).to_le_bytes());
        payload.extend_from_slice(blob);
    }
    let tag = key.sign(&payload);
    payload.extend_from_slice(&tag);
    BASE64.encode(payload)
}

/// Pack serialized stream state and its cached schemas into a signed
/// token stamped with the current time.
pub fn pack_state_token(
    state: &[u8],
    output_schema: &[u8],
    input_schema: &[u8],
    key: &SigningKey,
) -> String {
    pack_at(state, output_schema, input_schema, key, unix_now())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], RpcError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(RpcError::protocol("state token is truncated")),
        }
    }

    fn take_blob(&mut self) -> Result<Vec<u8>, RpcError> {
        let len_bytes = self.take(4)?;
        let len = u32::from_le_bytes(len_bytes.try_into().expect("4 bytes")) as usize;
        Ok(self.take(len)?.to_vec())
    }
}

/// Verify and decode a token.
///
/// The MAC is checked in constant time before any field is read; a `ttl`
/// of zero disables the age check. Every failure is a `ProtocolError`.
pub fn unpack_state_token(
    token: &str,
    key: &SigningKey,
    ttl: u64,
) -> Result<UnpackedToken, RpcError> {
    let raw = BASE64
        .decode(token)
        .map_err(|_| RpcError::protocol("state token is not valid base64"))?;
    if raw.len() < MIN_TOKEN_LEN {
        return Err(RpcError::protocol("state token is truncated"));
    }

    let (payload, tag) = raw.split_at(raw.len() - MAC_LEN);
    key.verify(payload, tag)?;

    let mut cursor = Cursor {
        data: payload,
        pos: 0,
    };
    let version = cursor.take(1)?[0];
    if version != TOKEN_VERSION {
        return Err(RpcError::protocol(format!(
            "unsupported state token version {version}"
        )));
    }
    let created_at = u64::from_le_bytes(cursor.take(8)?.try_into().expect("8 bytes"));
    if ttl > 0 && unix_now().saturating_sub(created_at) > ttl {
        return Err(RpcError::protocol("state token expired"));
    }

    let state = cursor.take_blob()?;
    let output_schema = cursor.take_blob()?;
    let input_schema = cursor.take_blob()?;
    if cursor.pos != payload.len() {
        return Err(RpcError::protocol("state token has trailing bytes"));
    }

    Ok(UnpackedToken {
        state,
        output_schema,
        input_schema,
        created_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SigningKey {
        SigningKey::from_bytes([7u8; 32])
    }

    #[test]
    fn round_trip_preserves_every_blob() {
        let token = pack_state_token(b"state", b"out-schema", b"in-schema", &key());
        let unpacked = unpack_state_token(&token, &key(), 3600).unwrap();
        assert_eq!(unpacked.state, b"state");
        assert_eq!(unpacked.output_schema, b"out-schema");
        assert_eq!(unpacked.input_schema, b"in-schema");
        assert!(unpacked.created_at > 0);
    }

    #[test]
    fn empty_blobs_round_trip() {
        let token = pack_state_token(b"", b"", b"", &key());
        let unpacked = unpack_state_token(&token, &key(), 0).unwrap();
        assert!(unpacked.state.is_empty());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let token = pack_state_token(b"state", b"o", b"i", &key());
        let other = SigningKey::from_bytes([8u8; 32]);
        let err = unpack_state_token(&token, &other, 3600).unwrap_err();
        assert_eq!(err.to_string(), "ProtocolError: HMAC verification failed");
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let token = pack_state_token(b"state-bytes", b"out", b"in", &key());
        let raw = BASE64.decode(&token).unwrap();
        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut tampered = raw.clone();
                tampered[byte] ^= 1 << bit;
                let tampered = BASE64.encode(&tampered);
                assert!(
                    unpack_state_token(&tampered, &key(), 3600).is_err(),
                    "flip at byte {byte} bit {bit} was accepted"
                );
            }
        }
    }

    #[test]
    fn expired_token_is_rejected_and_zero_ttl_disables() {
        let old = pack_at(b"s", b"o", b"i", &key(), unix_now() - 7200);
        let err = unpack_state_token(&old, &key(), 3600).unwrap_err();
        assert!(err.to_string().contains("expired"));
        assert!(unpack_state_token(&old, &key(), 0).is_ok());
    }

    #[test]
    fn truncated_token_is_rejected_before_field_reads() {
        let token = pack_state_token(b"state", b"o", b"i", &key());
        let raw = BASE64.decode(&token).unwrap();
        let short = BASE64.encode(&raw[..MIN_TOKEN_LEN - 1]);
        let err = unpack_state_token(&short, &key(), 3600).unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn garbage_base64_is_rejected() {
        let err = unpack_state_token("not*base64*at*all", &key(), 3600).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}
