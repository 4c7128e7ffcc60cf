//! The wire codec.
//!
//! Encodes requests and responses as annotated batches and classifies
//! incoming batches by their metadata. All value-level conversions between
//! [`Row`](vgi_types::Row)s and arrow columns live here; transports and
//! dispatchers never touch arrow arrays directly.

mod columns;
mod request;
mod response;

pub use columns::{batch_rows, build_batch, infer_schema, schema_fields_match};
pub use request::{build_request, parse_request, ParsedRequest};
pub use response::{
    build_error_batch, build_log_batch, build_result_batch, classify, dispatch_log_or_error,
    remote_error_from_batch, BatchKind, LogSink,
};
