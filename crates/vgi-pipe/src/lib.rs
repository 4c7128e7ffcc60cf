//! The process-pipe transport.
//!
//! One ordered duplex byte channel carries a sequence of IPC streams in
//! each direction: requests inbound, responses outbound. The server is a
//! single ordered loop — one request in flight at a time, EOF on the
//! inbound side is a clean shutdown. The client serializes everything
//! through a single-flight lock held for the lifetime of one call or one
//! stream session.
//!
//! Everything is generic over `AsyncRead + AsyncWrite + Unpin`, so the
//! same code drives subprocess stdio, `tokio::io::duplex` pairs in tests,
//! and sockets.

mod client;
mod dispatch;
mod server;
mod session;

pub use client::PipeClient;
pub use server::{serve, serve_stdio, PipeServerConfig};
pub use session::PipeSession;

/// A fresh process-unique server id.
pub(crate) fn random_server_id() -> String {
    format!("vgi-{:016x}", rand::random::<u64>())
}
