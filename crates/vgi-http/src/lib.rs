//! The HTTP transport.
//!
//! Stateless by construction: every request is independent and stream
//! state travels in HMAC-signed tokens (`vgi-token`). The server is an
//! axum router with three routes per method — unary call, stream init,
//! stream exchange — plus the capabilities preflight; the client drives
//! the same protocol over reqwest. Bodies are Arrow IPC streams in both
//! directions, optionally wrapped in a transparent zstd filter.

mod client;
mod config;
mod router;
mod service;
mod session;

pub use client::HttpClient;
pub use config::HttpServerConfig;
pub use service::HttpService;
pub use session::HttpSession;

/// A fresh process-unique server id.
pub(crate) fn random_server_id() -> String {
    format!("vgi-{:016x}", rand::random::<u64>())
}
