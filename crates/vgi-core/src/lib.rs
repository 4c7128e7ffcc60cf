//! Protocol registry and dispatch core.
//!
//! A [`Protocol`] is a named, immutable set of [`Method`]s in three
//! flavors: unary, producer, and exchange. This crate owns the registry,
//! the handler traits both transports invoke, the per-call
//! [`OutputCollector`], the [`RpcContext`] handlers log through, the
//! describe batch, and the transport-independent parts of dispatch. The
//! transports themselves live in `vgi-pipe` and `vgi-http`.

use std::future::Future;
use std::pin::Pin;

mod collector;
mod context;
mod describe;
mod dispatch;
mod method;
mod protocol;

pub use collector::{CollectorOutput, OutputCollector};
pub use context::RpcContext;
pub use describe::{build_describe_batch, describe_schema, DescribeInfo, MethodInfo};
pub use dispatch::{
    dispatch_unary, resolve_stream_overrides, run_header_row, unknown_method_error,
    ResolvedStream, UnaryOutcome,
};
pub use method::{unary_fn, Method, StreamDef, StreamHandler, UnaryDef, UnaryHandler};
pub use protocol::Protocol;

/// Boxed future type for dyn-compatible async handler traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
