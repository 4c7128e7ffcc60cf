//! Client-side stream sessions on the pipe.

use arrow_schema::SchemaRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OwnedMutexGuard;

use vgi_ipc::{AnnotatedBatch, BatchMetadata};
use vgi_types::{Row, RpcError};
use vgi_wire::{batch_rows, build_batch, dispatch_log_or_error, infer_schema, schema_fields_match,
    LogSink};

use crate::client::{empty_schema, PipeIo};

/// One stream session on the pipe transport.
///
/// The session owns the transport's single-flight lock. It writes one
/// contiguous input IPC stream across all rounds — schema-locked by the
/// first non-empty round — and reads one contiguous output stream. Each
/// round is: write one input batch, then read output batches until one
/// data batch arrives, with logs dispatched and errors raised along the
/// way. The lock is released when the stream is exhausted, closed, or
/// dropped; the latter two schedule a background drain so the transport
/// is aligned before the next call acquires it.
pub struct PipeSession<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    io: Option<OwnedMutexGuard<PipeIo<R, W>>>,
    on_log: Option<std::sync::Arc<LogSink>>,
    header: Option<Row>,
    input_schema: Option<SchemaRef>,
    output_schema: Option<SchemaRef>,
    done: bool,
}

impl<R, W> PipeSession<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(
        io: OwnedMutexGuard<PipeIo<R, W>>,
        on_log: Option<std::sync::Arc<LogSink>>,
        header: Option<Row>,
    ) -> Self {
        Self {
            io: Some(io),
            on_log,
            header,
            input_schema: None,
            output_schema: None,
            done: false,
        }
    }

    /// The header row, when the method declares a header schema.
    pub fn header(&self) -> Option<&Row> {
        self.header.as_ref()
    }

    fn io_mut(&mut self) -> Result<&mut PipeIo<R, W>, RpcError> {
        self.io
            .as_mut()
            .map(|guard| &mut **guard)
            .ok_or_else(|| RpcError::protocol("stream session is closed"))
    }

    /// Open the input stream if this is the first round.
    async fn ensure_input(&mut self, schema: SchemaRef) -> Result<(), RpcError> {
        if self.input_schema.is_none() {
            self.io_mut()?.writer.begin_stream(&schema).await?;
            self.input_schema = Some(schema);
        }
        Ok(())
    }

    /// Read the output stream's schema if this is the first round.
    async fn ensure_output(&mut self) -> Result<SchemaRef, RpcError> {
        if let Some(schema) = &self.output_schema {
            return Ok(schema.clone());
        }
        let opened = self.io_mut()?.reader.begin_stream().await?;
        let Some(schema) = opened else {
            return Err(RpcError::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed before opening its output stream",
            )));
        };
        self.output_schema = Some(schema.clone());
        Ok(schema)
    }

    /// Read one round's worth of output: logs are dispatched, a data
    /// batch ends the round, end-of-stream ends the session.
    async fn read_round(&mut self) -> Result<Option<AnnotatedBatch>, RpcError> {
        let schema = self.ensure_output().await?;
        loop {
            let batch = { self.io_mut()?.reader.next_batch(&schema).await? };
            match batch {
                None => {
                    self.release_exhausted().await;
                    return Ok(None);
                }
                Some(batch) => match dispatch_log_or_error(&batch, self.on_log.as_deref()) {
                    Ok(true) => continue,
                    Ok(false) => return Ok(Some(batch)),
                    Err(e) => {
                        self.recover(&schema).await;
                        return Err(e);
                    }
                },
            }
        }
    }

    /// One exchange round: submit `rows`, return the round's data rows.
    ///
    /// The input schema is inferred from the first non-empty round and
    /// locked; a later round with different fields fails here, client
    /// side, without touching the wire. A zero-row round needs a schema
    /// from an earlier round.
    pub async fn exchange(&mut self, rows: &[Row]) -> Result<Vec<Row>, RpcError> {
        if self.done {
            return Err(RpcError::protocol("stream session is closed"));
        }
        if rows.is_empty() && self.input_schema.is_none() {
            return Err(RpcError::contract(
                "cannot infer an input schema from an empty first exchange",
            ));
        }
        if !rows.is_empty() {
            let inferred = infer_schema(rows);
            if let Some(locked) = self.input_schema.clone() {
                if !schema_fields_match(&inferred, &locked) {
                    return Err(RpcError::protocol(format!(
                        "exchange input schema changed mid-session: locked fields {:?}",
                        locked
                            .fields()
                            .iter()
                            .map(|f| f.name().as_str())
                            .collect::<Vec<_>>()
                    )));
                }
            } else {
                self.ensure_input(inferred).await?;
            }
        }

        let Some(input_schema) = self.input_schema.clone() else {
            return Err(RpcError::protocol("stream session has no input schema"));
        };
        let batch = build_batch(&input_schema, rows)?;
        self.io_mut()?
            .writer
            .write_batch(&AnnotatedBatch::new(batch))
            .await?;

        match self.read_round().await? {
            Some(batch) => batch_rows(&batch.batch),
            None => Ok(Vec::new()),
        }
    }

    /// Pull the next producer batch, driving the stream with one
    /// zero-row tick. `None` once the producer finishes.
    pub async fn next_batch(&mut self) -> Result<Option<AnnotatedBatch>, RpcError> {
        if self.done {
            return Ok(None);
        }
        self.ensure_input(empty_schema()).await?;
        let tick_schema = self.input_schema.clone().unwrap_or_else(empty_schema);
        let tick = AnnotatedBatch::empty(tick_schema, BatchMetadata::new());
        self.io_mut()?.writer.write_batch(&tick).await?;
        self.read_round().await
    }

    /// [`next_batch`](Self::next_batch), decoded to rows.
    pub async fn next_rows(&mut self) -> Result<Option<Vec<Row>>, RpcError> {
        match self.next_batch().await? {
            Some(batch) => Ok(Some(batch_rows(&batch.batch)?)),
            None => Ok(None),
        }
    }

    /// The output stream ended cleanly: close our input side and release
    /// the lock in place.
    async fn release_exhausted(&mut self) {
        self.done = true;
        if let Some(mut io) = self.io.take() {
            if self.input_schema.is_some() {
                let _ = io.writer.finish_stream().await;
            } else {
                let _ = io.writer.begin_stream(&empty_schema()).await;
                let _ = io.writer.finish_stream().await;
            }
        }
    }

    /// A mid-stream error was raised: close our input side, drain the
    /// server's remaining output, release the lock. The transport is
    /// usable again afterwards.
    async fn recover(&mut self, output_schema: &SchemaRef) {
        self.done = true;
        if let Some(mut io) = self.io.take() {
            if self.input_schema.is_some() {
                let _ = io.writer.finish_stream().await;
            } else {
                let _ = io.writer.begin_stream(&empty_schema()).await;
                let _ = io.writer.finish_stream().await;
            }
            let _ = io.reader.drain_stream(output_schema).await;
        }
    }

    /// End the session early. The remaining server output is drained in
    /// the background; the next call on this transport waits for the
    /// drain through the single-flight lock.
    pub async fn close(mut self) {
        self.shutdown_in_background();
    }

    fn shutdown_in_background(&mut self) {
        if let Some(io) = self.io.take() {
            let input_open = self.input_schema.is_some();
            let output_schema = self.output_schema.clone();
            self.done = true;
            tokio::spawn(drain_session(io, input_open, output_schema));
        }
    }
}

impl<R, W> Drop for PipeSession<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn drop(&mut self) {
        if let Some(io) = self.io.take() {
            let input_open = self.input_schema.is_some();
            let output_schema = self.output_schema.clone();
            tokio::spawn(drain_session(io, input_open, output_schema));
        }
    }
}

async fn drain_session<R, W>(
    mut io: OwnedMutexGuard<PipeIo<R, W>>,
    input_open: bool,
    output_schema: Option<SchemaRef>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    // Close our input side first so the server's drain can finish.
    if input_open {
        let _ = io.writer.finish_stream().await;
    } else {
        let _ = io.writer.begin_stream(&empty_schema()).await;
        let _ = io.writer.finish_stream().await;
    }
    match output_schema {
        Some(schema) => {
            let _ = io.reader.drain_stream(&schema).await;
        }
        None => {
            if let Ok(Some(schema)) = io.reader.begin_stream().await {
                let _ = io.reader.drain_stream(&schema).await;
            }
        }
    }
}
