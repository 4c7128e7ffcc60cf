//! HTTP server configuration.

use vgi_token::SigningKey;

use crate::random_server_id;

/// Defaults: 16 MiB request cap, 4 MiB response byte budget, one-hour
/// token TTL, no compression, no CORS.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Identifier stamped on every response batch.
    pub server_id: String,
    /// Key signing the stream state tokens. Generated from the OS random
    /// source when not supplied.
    pub signing_key: SigningKey,
    /// Token lifetime in seconds; 0 disables the age check.
    pub token_ttl: u64,
    /// Largest accepted request body, advertised on the capabilities
    /// preflight.
    pub max_request_bytes: usize,
    /// Soft cap on the data bytes a producer accumulates per round trip
    /// before the server hands back a continuation token.
    pub response_byte_budget: usize,
    /// zstd level for response bodies; `None` disables compression.
    pub compression_level: Option<i32>,
    /// When set, every response carries CORS headers for this origin and
    /// `OPTIONS` preflights answer 204.
    pub cors_origin: Option<String>,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            server_id: random_server_id(),
            signing_key: SigningKey::random(),
            token_ttl: 3600,
            max_request_bytes: 16 * 1024 * 1024,
            response_byte_budget: 4 * 1024 * 1024,
            compression_level: None,
            cors_origin: None,
        }
    }
}

impl HttpServerConfig {
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    pub fn with_signing_key(mut self, key: SigningKey) -> Self {
        self.signing_key = key;
        self
    }

    pub fn with_token_ttl(mut self, seconds: u64) -> Self {
        self.token_ttl = seconds;
        self
    }

    pub fn with_max_request_bytes(mut self, bytes: usize) -> Self {
        self.max_request_bytes = bytes;
        self
    }

    pub fn with_response_byte_budget(mut self, bytes: usize) -> Self {
        self.response_byte_budget = bytes;
        self
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    pub fn with_cors_origin(mut self, origin: impl Into<String>) -> Self {
        self.cors_origin = Some(origin.into());
        self
    }
}
