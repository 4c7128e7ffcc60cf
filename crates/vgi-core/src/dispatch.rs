//! Transport-independent dispatch.

use arrow_schema::{Schema, SchemaRef};

use vgi_ipc::AnnotatedBatch;
use vgi_token::StreamState;
use vgi_types::{keys, Row, RpcError, StreamMode};
use vgi_wire::{build_error_batch, build_result_batch, parse_request};

use crate::context::RpcContext;
use crate::describe::build_describe_batch;
use crate::method::{Method, StreamDef};
use crate::protocol::Protocol;

/// A complete unary response: the stream schema and its batches in order.
pub struct UnaryOutcome {
    pub schema: SchemaRef,
    pub batches: Vec<AnnotatedBatch>,
    /// Set when the outcome is an error, so transports can map a status.
    pub error: Option<RpcError>,
}

fn empty_schema() -> SchemaRef {
    SchemaRef::new(Schema::empty())
}

fn error_outcome(schema: SchemaRef, error: RpcError, server_id: &str, request_id: Option<&str>) -> UnaryOutcome {
    let batch = build_error_batch(&schema, &error, server_id, request_id);
    UnaryOutcome {
        schema,
        batches: vec![batch],
        error: Some(error),
    }
}

/// The unknown-method error, listing every registered name.
pub fn unknown_method_error(protocol: &Protocol, method: &str) -> RpcError {
    RpcError::protocol(format!(
        "unknown method {method:?}; available methods: {}",
        protocol.method_names().join(", ")
    ))
}

/// Run one unary request end to end: parse, look up, invoke, and shape
/// the response stream (logs first, then exactly one result or error
/// batch). The reserved `__describe__` method is answered here without
/// entering method dispatch.
pub async fn dispatch_unary(
    protocol: &Protocol,
    server_id: &str,
    request: &AnnotatedBatch,
) -> UnaryOutcome {
    let parsed = match parse_request(request) {
        Ok(parsed) => parsed,
        Err(e) => return error_outcome(empty_schema(), e, server_id, None),
    };
    let request_id = parsed.request_id.as_deref();

    if parsed.method == keys::DESCRIBE_METHOD {
        return match build_describe_batch(protocol, server_id) {
            Ok(batch) => UnaryOutcome {
                schema: batch.schema(),
                batches: vec![batch],
                error: None,
            },
            Err(e) => error_outcome(empty_schema(), e, server_id, request_id),
        };
    }

    let method = match protocol.get(&parsed.method) {
        Some(method) => method,
        None => {
            let e = unknown_method_error(protocol, &parsed.method);
            return error_outcome(empty_schema(), e, server_id, request_id);
        }
    };

    let def = match method {
        Method::Unary(def) => def,
        Method::Producer(_) | Method::Exchange(_) => {
            let e = RpcError::protocol(format!(
                "method {:?} is a stream method; call it through the stream endpoints",
                parsed.method
            ));
            return error_outcome(empty_schema(), e, server_id, request_id);
        }
    };

    let ctx = RpcContext::new(server_id, request_id);
    let result = def.handler.call(parsed.params, ctx.clone()).await;

    let mut batches = ctx.drain_log_batches(&def.result);
    match result.and_then(|values| build_result_batch(&def.result, &values, server_id, request_id))
    {
        Ok(result_batch) => {
            batches.push(result_batch);
            UnaryOutcome {
                schema: def.result.clone(),
                batches,
                error: None,
            }
        }
        Err(e) => {
            // The error batch keeps the result schema so the client's
            // reader never sees a schema change mid-stream.
            batches.push(build_error_batch(&def.result, &e, server_id, request_id));
            UnaryOutcome {
                schema: def.result.clone(),
                batches,
                error: Some(e),
            }
        }
    }
}

/// The effective shape of a stream after applying the state overrides.
pub struct ResolvedStream {
    pub output: SchemaRef,
    pub mode: StreamMode,
}

/// Apply the dynamic output-schema and mode overrides a handler may have
/// set from `init`.
pub fn resolve_stream_overrides(
    def: &StreamDef,
    state: &StreamState,
) -> Result<ResolvedStream, RpcError> {
    let mode = state.mode_override().unwrap_or_else(|| def.registered_mode());
    let output = match state.output_schema_override() {
        Some(bytes) => vgi_ipc::decode_schema_ipc(&bytes)?,
        None => def.output.clone(),
    };
    Ok(ResolvedStream { output, mode })
}

/// Run `header_row` and shape its result as the single one-row header
/// batch. Logs the handler emitted through the context come first, on the
/// header schema, via [`RpcContext::drain_log_batches`] at the call site.
pub async fn run_header_row(
    def: &StreamDef,
    header_schema: &SchemaRef,
    params: &Row,
    state: &mut StreamState,
    ctx: &RpcContext,
) -> Result<AnnotatedBatch, RpcError> {
    let row = def.handler.header_row(params, state, ctx.clone()).await?;
    build_result_batch(header_schema, &row, ctx.server_id(), ctx.request_id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::unary_fn;
    use arrow_schema::{DataType, Field};
    use vgi_types::LogLevel;
    use vgi_wire::{build_request, classify, BatchKind};

    fn schema(name: &str) -> SchemaRef {
        SchemaRef::new(Schema::new(vec![Field::new(name, DataType::Float64, false)]))
    }

    fn add_protocol() -> Protocol {
        let mut protocol = Protocol::new("test");
        let params = SchemaRef::new(Schema::new(vec![
            Field::new("a", DataType::Float64, false),
            Field::new("b", DataType::Float64, false),
        ]));
        protocol
            .register(
                "add",
                Method::unary(
                    params,
                    schema("result"),
                    unary_fn(|params: Row, ctx: RpcContext| async move {
                        ctx.client_log(LogLevel::Info, "adding", None);
                        let sum = params.get_f64("a")? + params.get_f64("b")?;
                        Ok(Row::new().with("result", sum))
                    }),
                ),
            )
            .unwrap();
        protocol
    }

    #[tokio::test]
    async fn unary_response_is_logs_then_result() {
        let protocol = add_protocol();
        let request = build_request(
            protocol.get("add").unwrap().params_schema(),
            &Row::new().with("a", 3.0f64).with("b", 4.0f64),
            "add",
            Some("req-1"),
        )
        .unwrap();

        let outcome = dispatch_unary(&protocol, "srv", &request).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.batches.len(), 2);
        assert!(matches!(classify(&outcome.batches[0]), BatchKind::Log(_)));
        assert_eq!(outcome.batches[1].num_rows(), 1);
        assert_eq!(outcome.batches[1].meta("request_id"), Some("req-1"));

        let rows = vgi_wire::batch_rows(&outcome.batches[1].batch).unwrap();
        assert_eq!(rows[0].get_f64("result").unwrap(), 7.0);
    }

    #[tokio::test]
    async fn unknown_method_lists_available_names() {
        let protocol = add_protocol();
        let request = build_request(
            &SchemaRef::new(Schema::empty()),
            &Row::new(),
            "nope",
            None,
        )
        .unwrap();

        let outcome = dispatch_unary(&protocol, "srv", &request).await;
        match classify(&outcome.batches[0]) {
            BatchKind::Error(remote) => {
                assert!(remote.exception_message.contains("add"), "{remote:?}");
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[tokio::test]
    async fn describe_short_circuits_method_dispatch() {
        let protocol = add_protocol();
        let request = build_request(
            &SchemaRef::new(Schema::empty()),
            &Row::new(),
            keys::DESCRIBE_METHOD,
            None,
        )
        .unwrap();

        let outcome = dispatch_unary(&protocol, "srv", &request).await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.batches[0].meta("describe_version"), Some("2"));
        assert_eq!(outcome.batches[0].num_rows(), 1);
    }
}
