//! The producer/exchange state machine on a duplex channel.
//!
//! Lockstep discipline: one input batch in, at most one data batch out
//! (plus any logs), so neither side ever buffers more than one message
//! ahead and the pipe cannot deadlock. On every early exit — init
//! failure, header failure, handler error, producer finish — the
//! remaining client input is drained to its end-of-stream marker so the
//! next request starts at a stream boundary.

use std::io;

use arrow_schema::{Schema, SchemaRef};
use tokio::io::{AsyncRead, AsyncWrite};

use vgi_core::{
    resolve_stream_overrides, run_header_row, OutputCollector, RpcContext, StreamDef,
};
use vgi_ipc::{IpcStreamReader, IpcStreamWriter};
use vgi_types::{RpcError, StreamMode};
use vgi_wire::{build_error_batch, schema_fields_match, ParsedRequest};

fn empty_schema() -> SchemaRef {
    SchemaRef::new(Schema::empty())
}

/// True for read errors the drain discipline swallows: the client went
/// away, which the server loop will observe as EOF on its next request.
fn is_peer_gone(e: &RpcError) -> bool {
    matches!(
        e,
        RpcError::Transport(io) if matches!(
            io.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe
        )
    )
}

pub(crate) async fn dispatch_stream<R, W>(
    def: &StreamDef,
    parsed: &ParsedRequest,
    reader: &mut IpcStreamReader<R>,
    writer: &mut IpcStreamWriter<W>,
    server_id: &str,
) -> Result<(), RpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request_id = parsed.request_id.as_deref();
    let ctx = RpcContext::new(server_id, request_id);

    // Init, and the dynamic overrides it may have set.
    let init_result = def.handler.init(parsed.params.clone(), ctx.clone()).await;
    let (mut state, resolved) = match init_result
        .and_then(|state| resolve_stream_overrides(def, &state).map(|r| (state, r)))
    {
        Ok(ok) => ok,
        Err(e) => {
            let schema = def.header.clone().unwrap_or_else(empty_schema);
            write_error_stream(writer, &schema, &ctx, &e, server_id, request_id).await?;
            drain_unopened_input(reader).await?;
            return Ok(());
        }
    };

    // Header stream, when the method declares one.
    if let Some(header_schema) = &def.header {
        match run_header_row(def, header_schema, &parsed.params, &mut state, &ctx).await {
            Ok(header_batch) => {
                writer.begin_stream(header_schema).await?;
                for log in ctx.drain_log_batches(header_schema) {
                    writer.write_batch(&log).await?;
                }
                writer.write_batch(&header_batch).await?;
                writer.finish_stream().await?;
            }
            Err(e) => {
                write_error_stream(writer, header_schema, &ctx, &e, server_id, request_id)
                    .await?;
                drain_unopened_input(reader).await?;
                return Ok(());
            }
        }
    }

    // Open the client's input stream.
    let Some(input_schema) = reader.begin_stream().await? else {
        return Err(RpcError::Transport(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed before opening its input stream",
        )));
    };

    if resolved.mode == StreamMode::Exchange
        && !def.input.fields().is_empty()
        && !schema_fields_match(&input_schema, &def.input)
    {
        let e = RpcError::contract(format!(
            "exchange input schema mismatch: expected fields {:?}",
            def.input
                .fields()
                .iter()
                .map(|f| f.name().as_str())
                .collect::<Vec<_>>()
        ));
        write_error_stream(writer, &resolved.output, &ctx, &e, server_id, request_id).await?;
        drain_opened_input(reader, &input_schema).await?;
        return Ok(());
    }

    // Data loop on the open output stream.
    writer.begin_stream(&resolved.output).await?;
    loop {
        let Some(input) = reader.next_batch(&input_schema).await? else {
            break; // end of input terminates the loop normally
        };

        let mut out = OutputCollector::new(
            resolved.output.clone(),
            resolved.mode,
            server_id,
            request_id,
        );
        let call_result = match resolved.mode {
            StreamMode::Producer => def.handler.produce(&mut state, &mut out).await,
            StreamMode::Exchange => def.handler.exchange(&mut state, &input, &mut out).await,
        };

        let output = out.into_output();
        match call_result {
            Ok(()) => {
                for log in &output.logs {
                    writer.write_batch(log).await?;
                }
                if let Some(data) = &output.data {
                    writer.write_batch(data).await?;
                }
                if output.finished {
                    writer.finish_stream().await?;
                    drain_opened_input(reader, &input_schema).await?;
                    return Ok(());
                }
            }
            Err(e) => {
                for log in &output.logs {
                    writer.write_batch(log).await?;
                }
                let error_batch = build_error_batch(&resolved.output, &e, server_id, request_id);
                writer.write_batch(&error_batch).await?;
                writer.finish_stream().await?;
                drain_opened_input(reader, &input_schema).await?;
                return Ok(());
            }
        }
    }

    writer.finish_stream().await?;
    Ok(())
}

async fn write_error_stream<W: AsyncWrite + Unpin>(
    writer: &mut IpcStreamWriter<W>,
    schema: &SchemaRef,
    ctx: &RpcContext,
    error: &RpcError,
    server_id: &str,
    request_id: Option<&str>,
) -> Result<(), RpcError> {
    tracing::debug!(error = %error, "stream dispatch failed");
    writer.begin_stream(schema).await?;
    for log in ctx.drain_log_batches(schema) {
        writer.write_batch(&log).await?;
    }
    writer
        .write_batch(&build_error_batch(schema, error, server_id, request_id))
        .await?;
    writer.finish_stream().await
}

/// Drain the input stream when it has not been opened yet.
async fn drain_unopened_input<R: AsyncRead + Unpin>(
    reader: &mut IpcStreamReader<R>,
) -> Result<(), RpcError> {
    match reader.begin_stream().await {
        Ok(Some(schema)) => drain_opened_input(reader, &schema).await,
        Ok(None) => Ok(()),
        Err(e) if is_peer_gone(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Read and discard input batches until the client's end-of-stream.
async fn drain_opened_input<R: AsyncRead + Unpin>(
    reader: &mut IpcStreamReader<R>,
    schema: &SchemaRef,
) -> Result<(), RpcError> {
    loop {
        match reader.next_batch(schema).await {
            Ok(Some(_)) => continue,
            Ok(None) => return Ok(()),
            Err(e) if is_peer_gone(&e) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}
