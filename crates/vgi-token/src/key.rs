//! The process-wide signing key.

use std::fmt;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use vgi_types::RpcError;

type HmacSha256 = Hmac<Sha256>;

/// Length of the key and of the MAC it produces.
pub(crate) const MAC_LEN: usize = 32;

/// 32-byte HMAC-SHA-256 key. Read-only after startup; derived from the OS
/// random source when the operator does not supply one.
#[derive(Clone)]
pub struct SigningKey([u8; MAC_LEN]);

impl SigningKey {
    pub fn from_bytes(bytes: [u8; MAC_LEN]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; MAC_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn mac(&self, payload: &[u8]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("hmac accepts any key length");
        mac.update(payload);
        mac
    }

    pub(crate) fn sign(&self, payload: &[u8]) -> [u8; MAC_LEN] {
        self.mac(payload).finalize().into_bytes().into()
    }

    /// Constant-time MAC check; nothing in the payload may be trusted
    /// before this succeeds.
    pub(crate) fn verify(&self, payload: &[u8], tag: &[u8]) -> Result<(), RpcError> {
        self.mac(payload)
            .verify_slice(tag)
            .map_err(|_| RpcError::protocol("HMAC verification failed"))
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(..)")
    }
}
