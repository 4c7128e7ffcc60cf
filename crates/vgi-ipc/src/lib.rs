//! Columnar IPC adapter.
//!
//! A thin façade over `arrow-ipc` that exposes the two concepts the rest of
//! the runtime works with: *streams* (one schema message, zero or more
//! record batches, an end-of-stream marker) and *batch metadata* (a
//! string-to-string map riding each batch). The bytes produced here are
//! plain Arrow IPC streaming format; the metadata travels as
//! `custom_metadata` on the record-batch message, which the high-level
//! arrow writers do not expose, so this crate frames encapsulated messages
//! itself.
//!
//! Sync halves ([`IpcStreamEncoder`], [`IpcBytesReader`]) serve the HTTP
//! transport and the describe blobs; async halves ([`IpcStreamWriter`],
//! [`IpcStreamReader`]) serve the pipe transport and work over anything
//! `AsyncRead`/`AsyncWrite`, including subprocess pipes and
//! `tokio::io::duplex` pairs.

mod batch;
mod decode;
mod encode;
mod frame;
mod stream;

pub use batch::{AnnotatedBatch, BatchMetadata};
pub use decode::{DecodedStream, IpcBytesReader};
pub use encode::{decode_schema_ipc, encode_stream, schema_ipc_bytes, IpcStreamEncoder};
pub use frame::EOS_MARKER;
pub use stream::{IpcStreamReader, IpcStreamWriter};
