//! Request handling behind the router.
//!
//! Every handler here is a pure `bytes in → (status, bytes out)` function;
//! the router owns HTTP concerns (content types, compression, CORS) and
//! delegates the protocol work to this type. Stream state never outlives
//! a request: it is materialized from the token, advanced, and packed
//! into a fresh token before the response is written.

use std::sync::Arc;

use arrow_schema::{Schema, SchemaRef};
use http::StatusCode;

use vgi_core::{
    dispatch_unary, resolve_stream_overrides, run_header_row, unknown_method_error,
    OutputCollector, Protocol, RpcContext, StreamDef,
};
use vgi_ipc::{
    decode_schema_ipc, encode_stream, schema_ipc_bytes, AnnotatedBatch, BatchMetadata,
    IpcBytesReader, IpcStreamEncoder,
};
use vgi_token::{pack_state_token, unpack_state_token, JsonStateSerializer, StateSerializer,
    StreamState};
use vgi_types::{keys, RpcError, StreamMode};
use vgi_wire::{build_error_batch, parse_request, schema_fields_match};

use crate::config::HttpServerConfig;

fn empty_schema() -> SchemaRef {
    SchemaRef::new(Schema::empty())
}

/// A finished protocol-level response.
pub(crate) struct Reply {
    pub(crate) status: StatusCode,
    pub(crate) body: Vec<u8>,
}

/// The HTTP server: a protocol, its configuration, and the state
/// serializer used for continuation tokens.
pub struct HttpService {
    pub(crate) protocol: Arc<Protocol>,
    pub(crate) config: HttpServerConfig,
    serializer: Arc<dyn StateSerializer>,
}

impl HttpService {
    pub fn new(protocol: Arc<Protocol>, config: HttpServerConfig) -> Self {
        Self {
            protocol,
            config,
            serializer: Arc::new(JsonStateSerializer),
        }
    }

    /// Replace the default JSON state serializer.
    pub fn with_state_serializer(mut self, serializer: Arc<dyn StateSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Build the axum router for this service. Nest it under a prefix to
    /// serve at a sub-path.
    pub fn router(self) -> axum::Router {
        crate::router::build_router(Arc::new(self))
    }

    /// Serve on an already-bound listener until the process exits.
    pub async fn serve(self, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        axum::serve(listener, self.router()).await
    }

    fn status_for(error: &RpcError) -> StatusCode {
        match error {
            RpcError::Protocol(_) | RpcError::Version(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_reply_at(
        &self,
        status: StatusCode,
        schema: &SchemaRef,
        error: &RpcError,
        request_id: Option<&str>,
    ) -> Reply {
        tracing::debug!(error = %error, status = %status, "request failed");
        let batch = build_error_batch(schema, error, &self.config.server_id, request_id);
        Reply {
            status,
            body: encode_stream(schema.clone(), &[batch]).unwrap_or_default(),
        }
    }

    fn error_reply(&self, schema: &SchemaRef, error: &RpcError, request_id: Option<&str>) -> Reply {
        self.error_reply_at(Self::status_for(error), schema, error, request_id)
    }

    /// An error stream that also carries the logs a handler emitted
    /// before failing.
    fn error_reply_with_logs(
        &self,
        schema: &SchemaRef,
        ctx: &RpcContext,
        error: &RpcError,
        request_id: Option<&str>,
    ) -> Reply {
        let mut batches = ctx.drain_log_batches(schema);
        batches.push(build_error_batch(
            schema,
            error,
            &self.config.server_id,
            request_id,
        ));
        Reply {
            status: Self::status_for(error),
            body: encode_stream(schema.clone(), &batches).unwrap_or_default(),
        }
    }

    fn read_single_batch(&self, body: &[u8]) -> Result<AnnotatedBatch, RpcError> {
        let mut reader = IpcBytesReader::new(body);
        let stream = reader.read_stream()?;
        if stream.batches.len() != 1 {
            return Err(RpcError::protocol(format!(
                "request stream must contain exactly one batch, got {}",
                stream.batches.len()
            )));
        }
        let mut batches = stream.batches;
        Ok(batches.pop().expect("one batch"))
    }

    fn pack_token(
        &self,
        state: &StreamState,
        output_schema: &[u8],
        input_schema: &[u8],
    ) -> Result<String, RpcError> {
        let state_bytes = self.serializer.serialize(state)?;
        Ok(pack_state_token(
            &state_bytes,
            output_schema,
            input_schema,
            &self.config.signing_key,
        ))
    }

    fn continuation_batch(&self, schema: &SchemaRef, token: String) -> AnnotatedBatch {
        let mut metadata = BatchMetadata::new();
        metadata.insert(keys::STREAM_STATE.to_owned(), token);
        metadata.insert(keys::SERVER_ID.to_owned(), self.config.server_id.clone());
        AnnotatedBatch::empty(schema.clone(), metadata)
    }

    /// `POST /{method}` — one unary round trip.
    pub(crate) async fn handle_unary(&self, path_method: &str, body: &[u8]) -> Reply {
        let empty = empty_schema();
        let request = match self.read_single_batch(body) {
            Ok(request) => request,
            Err(e) => return self.error_reply(&empty, &e, None),
        };
        let parsed = match parse_request(&request) {
            Ok(parsed) => parsed,
            Err(e) => return self.error_reply(&empty, &e, None),
        };
        let request_id = parsed.request_id.as_deref();
        if parsed.method != path_method {
            let e = RpcError::protocol(format!(
                "request method {:?} does not match the request path {path_method:?}",
                parsed.method
            ));
            return self.error_reply(&empty, &e, request_id);
        }
        if parsed.method != keys::DESCRIBE_METHOD && self.protocol.get(&parsed.method).is_none() {
            let e = unknown_method_error(&self.protocol, &parsed.method);
            return self.error_reply_at(StatusCode::NOT_FOUND, &empty, &e, request_id);
        }

        let outcome = dispatch_unary(&self.protocol, &self.config.server_id, &request).await;
        let status = match &outcome.error {
            None => StatusCode::OK,
            Some(e) => Self::status_for(e),
        };
        match encode_stream(outcome.schema, &outcome.batches) {
            Ok(body) => Reply { status, body },
            Err(e) => self.error_reply(&empty, &e, request_id),
        }
    }

    /// `POST /{method}/init` — open a stream: run init (and the header
    /// row), then either drive the producer loop up to the byte budget or
    /// hand the exchange client its first token.
    pub(crate) async fn handle_init(&self, path_method: &str, body: &[u8]) -> Reply {
        let empty = empty_schema();
        let request = match self.read_single_batch(body) {
            Ok(request) => request,
            Err(e) => return self.error_reply(&empty, &e, None),
        };
        let parsed = match parse_request(&request) {
            Ok(parsed) => parsed,
            Err(e) => return self.error_reply(&empty, &e, None),
        };
        let request_id = parsed.request_id.as_deref();
        if parsed.method != path_method {
            let e = RpcError::protocol(format!(
                "request method {:?} does not match the request path {path_method:?}",
                parsed.method
            ));
            return self.error_reply(&empty, &e, request_id);
        }
        let def = match self.protocol.get(&parsed.method) {
            None => {
                let e = unknown_method_error(&self.protocol, &parsed.method);
                return self.error_reply_at(StatusCode::NOT_FOUND, &empty, &e, request_id);
            }
            Some(method) => match method.stream_def() {
                Some(def) => def,
                None => {
                    let e = RpcError::protocol(format!(
                        "method {:?} is unary; call it without /init",
                        parsed.method
                    ));
                    return self.error_reply(&empty, &e, request_id);
                }
            },
        };

        let ctx = RpcContext::new(&self.config.server_id, request_id);
        let init_schema = def.header.clone().unwrap_or_else(empty_schema);
        let init = def.handler.init(parsed.params.clone(), ctx.clone()).await;
        let (mut state, resolved) = match init
            .and_then(|state| resolve_stream_overrides(def, &state).map(|r| (state, r)))
        {
            Ok(ok) => ok,
            Err(e) => return self.error_reply_with_logs(&init_schema, &ctx, &e, request_id),
        };

        let mut header_bytes = Vec::new();
        if let Some(header_schema) = &def.header {
            match run_header_row(def, header_schema, &parsed.params, &mut state, &ctx).await {
                Ok(header_batch) => {
                    let mut batches = ctx.drain_log_batches(header_schema);
                    batches.push(header_batch);
                    header_bytes = match encode_stream(header_schema.clone(), &batches) {
                        Ok(bytes) => bytes,
                        Err(e) => return self.error_reply(&empty, &e, request_id),
                    };
                }
                Err(e) => return self.error_reply_with_logs(header_schema, &ctx, &e, request_id),
            }
        }

        let data_reply = match resolved.mode {
            StreamMode::Producer => {
                let input_blob = match schema_ipc_bytes(&def.input) {
                    Ok(blob) => blob,
                    Err(e) => return self.error_reply(&resolved.output, &e, request_id),
                };
                self.producer_reply(def, state, &resolved.output, &input_blob, request_id)
                    .await
            }
            StreamMode::Exchange => self.exchange_init_reply(def, &state, &resolved.output),
        };
        match data_reply {
            Ok(mut reply) => {
                if !header_bytes.is_empty() {
                    header_bytes.extend_from_slice(&reply.body);
                    reply.body = header_bytes;
                }
                reply
            }
            Err(e) => self.error_reply(&resolved.output, &e, request_id),
        }
    }

    /// Drive a producer until `finish` or the byte budget, appending a
    /// continuation token when the stream is left unfinished.
    async fn producer_reply(
        &self,
        def: &StreamDef,
        mut state: StreamState,
        output: &SchemaRef,
        input_blob: &[u8],
        request_id: Option<&str>,
    ) -> Result<Reply, RpcError> {
        let output_blob = schema_ipc_bytes(output)?;
        let mut encoder = IpcStreamEncoder::new(output.clone())?;
        let mut data_bytes = 0usize;
        let mut wrote_data = false;

        loop {
            let mut out = OutputCollector::new(
                output.clone(),
                StreamMode::Producer,
                &self.config.server_id,
                request_id,
            );
            let result = def.handler.produce(&mut state, &mut out).await;
            let collected = out.into_output();
            for log in &collected.logs {
                encoder.write_batch(log)?;
            }
            match result {
                Ok(()) => {
                    if let Some(data) = &collected.data {
                        data_bytes += encoder.write_batch(data)?;
                        wrote_data = true;
                    }
                    if collected.finished {
                        return Ok(Reply {
                            status: StatusCode::OK,
                            body: encoder.finish(),
                        });
                    }
                    if data_bytes > self.config.response_byte_budget {
                        let token = self.pack_token(&state, &output_blob, input_blob)?;
                        encoder.write_batch(&self.continuation_batch(output, token))?;
                        return Ok(Reply {
                            status: StatusCode::OK,
                            body: encoder.finish(),
                        });
                    }
                }
                Err(e) => {
                    encoder.write_batch(&build_error_batch(
                        output,
                        &e,
                        &self.config.server_id,
                        request_id,
                    ))?;
                    // Once data has flowed the client defers the error to
                    // iteration, so the stream itself stays a 200.
                    let status = if wrote_data {
                        StatusCode::OK
                    } else {
                        Self::status_for(&e)
                    };
                    return Ok(Reply {
                        status,
                        body: encoder.finish(),
                    });
                }
            }
        }
    }

    /// The init response of an exchange: one zero-row token batch keyed
    /// on the output schema.
    fn exchange_init_reply(
        &self,
        def: &StreamDef,
        state: &StreamState,
        output: &SchemaRef,
    ) -> Result<Reply, RpcError> {
        let token = self.pack_token(
            state,
            &schema_ipc_bytes(output)?,
            &schema_ipc_bytes(&def.input)?,
        )?;
        let body = encode_stream(
            output.clone(),
            &[self.continuation_batch(output, token)],
        )?;
        Ok(Reply {
            status: StatusCode::OK,
            body,
        })
    }

    /// `POST /{method}/exchange` — verify the token, restore the state,
    /// run one round (or resume a producer), rotate the token.
    pub(crate) async fn handle_exchange(&self, path_method: &str, body: &[u8]) -> Reply {
        let empty = empty_schema();
        let input_batch = match self.read_single_batch(body) {
            Ok(batch) => batch,
            Err(e) => return self.error_reply(&empty, &e, None),
        };
        let request_id_owned = input_batch.meta(keys::REQUEST_ID).map(str::to_owned);
        let request_id = request_id_owned.as_deref();

        let def = match self.protocol.get(path_method) {
            None => {
                let e = unknown_method_error(&self.protocol, path_method);
                return self.error_reply_at(StatusCode::NOT_FOUND, &empty, &e, request_id);
            }
            Some(method) => match method.stream_def() {
                Some(def) => def,
                None => {
                    let e = RpcError::protocol(format!("method {path_method:?} is unary"));
                    return self.error_reply(&empty, &e, request_id);
                }
            },
        };

        let Some(token) = input_batch.meta(keys::STREAM_STATE) else {
            let e = RpcError::protocol("exchange request is missing `stream_state` metadata");
            return self.error_reply(&empty, &e, request_id);
        };
        let unpacked =
            match unpack_state_token(token, &self.config.signing_key, self.config.token_ttl) {
                Ok(unpacked) => unpacked,
                Err(e) => return self.error_reply(&empty, &e, request_id),
            };
        let state = match self.serializer.deserialize(&unpacked.state) {
            Ok(state) => state,
            Err(e) => return self.error_reply(&empty, &e, request_id),
        };
        let resolved = match resolve_stream_overrides(def, &state) {
            Ok(resolved) => resolved,
            Err(e) => return self.error_reply(&empty, &e, request_id),
        };
        let (output, declared_input) = match (
            decode_schema_ipc(&unpacked.output_schema),
            decode_schema_ipc(&unpacked.input_schema),
        ) {
            (Ok(output), Ok(input)) => (output, input),
            (Err(e), _) | (_, Err(e)) => return self.error_reply(&empty, &e, request_id),
        };

        if resolved.mode == StreamMode::Exchange
            && !declared_input.fields().is_empty()
            && !schema_fields_match(&input_batch.schema(), &declared_input)
        {
            let e = RpcError::protocol(
                "exchange batch does not match the stream's input schema",
            );
            return self.error_reply(&output, &e, request_id);
        }

        let reply = match resolved.mode {
            StreamMode::Producer => {
                self.producer_reply(def, state, &output, &unpacked.input_schema, request_id)
                    .await
            }
            StreamMode::Exchange => {
                self.exchange_round(def, state, &output, &unpacked, &input_batch, request_id)
                    .await
            }
        };
        match reply {
            Ok(reply) => reply,
            Err(e) => self.error_reply(&output, &e, request_id),
        }
    }

    async fn exchange_round(
        &self,
        def: &StreamDef,
        mut state: StreamState,
        output: &SchemaRef,
        unpacked: &vgi_token::UnpackedToken,
        input: &AnnotatedBatch,
        request_id: Option<&str>,
    ) -> Result<Reply, RpcError> {
        let mut out = OutputCollector::new(
            output.clone(),
            StreamMode::Exchange,
            &self.config.server_id,
            request_id,
        );
        let result = def.handler.exchange(&mut state, input, &mut out).await;
        let collected = out.into_output();

        let mut encoder = IpcStreamEncoder::new(output.clone())?;
        for log in &collected.logs {
            encoder.write_batch(log)?;
        }
        match result {
            Ok(()) => {
                let token =
                    self.pack_token(&state, &unpacked.output_schema, &unpacked.input_schema)?;
                match collected.data {
                    // The rotated token rides the data batch.
                    Some(mut data) => {
                        data.metadata.insert(keys::STREAM_STATE.to_owned(), token);
                        encoder.write_batch(&data)?;
                    }
                    None => {
                        encoder.write_batch(&self.continuation_batch(output, token))?;
                    }
                }
                Ok(Reply {
                    status: StatusCode::OK,
                    body: encoder.finish(),
                })
            }
            Err(e) => {
                encoder.write_batch(&build_error_batch(
                    output,
                    &e,
                    &self.config.server_id,
                    request_id,
                ))?;
                Ok(Reply {
                    status: Self::status_for(&e),
                    body: encoder.finish(),
                })
            }
        }
    }
}
