//! The pipe server loop.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use vgi_core::{dispatch_unary, Method, Protocol};
use vgi_ipc::{AnnotatedBatch, IpcStreamReader, IpcStreamWriter};
use vgi_types::RpcError;
use vgi_wire::{build_error_batch, parse_request};

use crate::dispatch::dispatch_stream;
use crate::random_server_id;

/// Pipe server configuration.
#[derive(Debug, Clone)]
pub struct PipeServerConfig {
    /// Identifier stamped on every response batch.
    pub server_id: String,
}

impl Default for PipeServerConfig {
    fn default() -> Self {
        Self {
            server_id: random_server_id(),
        }
    }
}

impl PipeServerConfig {
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }
}

/// Serve `protocol` over one duplex byte channel until the inbound side
/// reaches EOF.
///
/// The loop reads one request stream at a time, dispatches it, and writes
/// the complete response before touching the next request. Errors local
/// to a request travel back as EXCEPTION batches and the loop keeps
/// serving; transport faults and framing desyncs end it.
pub async fn serve<R, W>(
    protocol: Arc<Protocol>,
    reader: R,
    writer: W,
    config: PipeServerConfig,
) -> Result<(), RpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = IpcStreamReader::new(reader);
    let mut writer = IpcStreamWriter::new(writer);
    let server_id = config.server_id;

    loop {
        let Some(request_schema) = reader.begin_stream().await? else {
            tracing::debug!(server_id = %server_id, "pipe inbound closed, shutting down");
            return Ok(());
        };

        let request = match read_single_request(&mut reader, &request_schema).await? {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "malformed request stream");
                write_bare_error(&mut writer, &e, &server_id).await?;
                continue;
            }
        };

        let parsed = match parse_request(&request) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(error = %e, "unparseable request batch");
                write_bare_error(&mut writer, &e, &server_id).await?;
                continue;
            }
        };

        match protocol.get(&parsed.method).and_then(Method::stream_def) {
            Some(def) => {
                tracing::debug!(method = %parsed.method, "dispatching stream request");
                dispatch_stream(def, &parsed, &mut reader, &mut writer, &server_id).await?;
            }
            None => {
                tracing::debug!(method = %parsed.method, "dispatching unary request");
                let outcome = dispatch_unary(&protocol, &server_id, &request).await;
                writer.begin_stream(&outcome.schema).await?;
                for batch in &outcome.batches {
                    writer.write_batch(batch).await?;
                }
                writer.finish_stream().await?;
            }
        }
    }
}

/// Serve over this process's stdin/stdout, the worker-binary entry point.
pub async fn serve_stdio(protocol: Arc<Protocol>, config: PipeServerConfig) -> Result<(), RpcError> {
    serve(protocol, tokio::io::stdin(), tokio::io::stdout(), config).await
}

/// Read the request stream's single batch and its end-of-stream marker.
///
/// The outer error ends the connection (framing desync); the inner error
/// is answered on the wire and the loop continues.
async fn read_single_request<R: AsyncRead + Unpin>(
    reader: &mut IpcStreamReader<R>,
    schema: &arrow_schema::SchemaRef,
) -> Result<Result<AnnotatedBatch, RpcError>, RpcError> {
    let Some(batch) = reader.next_batch(schema).await? else {
        return Ok(Err(RpcError::protocol(
            "request stream contained no batches",
        )));
    };
    let mut extra = 0usize;
    while reader.next_batch(schema).await?.is_some() {
        extra += 1;
    }
    if extra > 0 {
        return Ok(Err(RpcError::protocol(format!(
            "request stream must contain exactly one batch, got {}",
            extra + 1
        ))));
    }
    Ok(Ok(batch))
}

/// Answer a request that never reached dispatch with a one-batch error
/// stream on the empty schema.
async fn write_bare_error<W: AsyncWrite + Unpin>(
    writer: &mut IpcStreamWriter<W>,
    error: &RpcError,
    server_id: &str,
) -> Result<(), RpcError> {
    let schema = arrow_schema::SchemaRef::new(arrow_schema::Schema::empty());
    writer.begin_stream(&schema).await?;
    writer
        .write_batch(&build_error_batch(&schema, error, server_id, None))
        .await?;
    writer.finish_stream().await
}
