//! State tokens.
//!
//! The HTTP transport is stateless: everything a stream needs between
//! round trips travels in an HMAC-signed, TTL-bounded token the client
//! copies back verbatim. This crate owns the token layout, the signing
//! key, the [`StreamState`] map handlers mutate, and the pluggable state
//! serializer.

mod key;
mod state;
mod token;

pub use key::SigningKey;
pub use state::{JsonStateSerializer, StateSerializer, StreamState};
pub use token::{pack_state_token, unpack_state_token, UnpackedToken, MIN_TOKEN_LEN, TOKEN_VERSION};
