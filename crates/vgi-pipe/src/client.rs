//! The pipe client.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arrow_schema::{Schema, SchemaRef};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::OwnedMutexGuard;

use vgi_core::DescribeInfo;
use vgi_ipc::{AnnotatedBatch, IpcStreamReader, IpcStreamWriter};
use vgi_types::{keys, LogRecord, Row, RpcError};
use vgi_wire::{batch_rows, build_request, dispatch_log_or_error, infer_schema, LogSink};

use crate::session::PipeSession;

pub(crate) fn empty_schema() -> SchemaRef {
    SchemaRef::new(Schema::empty())
}

/// The duplex channel plus the child process that owns its far end, when
/// the transport was spawned as a subprocess.
pub(crate) struct PipeIo<R, W> {
    pub(crate) reader: IpcStreamReader<R>,
    pub(crate) writer: IpcStreamWriter<W>,
    pub(crate) child: Option<Child>,
}

/// Client for the pipe transport.
///
/// One pipe carries sequential IPC streams, so every call and every
/// stream session runs under a single-flight lock; the lock is released
/// on every exit path, including the background drain a dropped session
/// schedules. Cloning shares the transport and its lock.
pub struct PipeClient<R, W> {
    io: Arc<tokio::sync::Mutex<PipeIo<R, W>>>,
    on_log: Option<Arc<LogSink>>,
    describe: Arc<Mutex<Option<Arc<DescribeInfo>>>>,
    next_request_id: Arc<AtomicU64>,
}

impl<R, W> Clone for PipeClient<R, W> {
    fn clone(&self) -> Self {
        Self {
            io: self.io.clone(),
            on_log: self.on_log.clone(),
            describe: self.describe.clone(),
            next_request_id: self.next_request_id.clone(),
        }
    }
}

impl PipeClient<ChildStdout, ChildStdin> {
    /// Spawn a worker process and speak the pipe protocol over its
    /// stdin/stdout.
    pub fn subprocess(mut command: Command) -> Result<Self, RpcError> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::protocol("child stdout was not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::protocol("child stdin was not captured"))?;
        Ok(Self::from_parts(stdout, stdin, Some(child)))
    }
}

impl<R, W> PipeClient<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an existing duplex channel (an in-memory pipe in tests, a
    /// socket, ...).
    pub fn new(reader: R, writer: W) -> Self {
        Self::from_parts(reader, writer, None)
    }

    fn from_parts(reader: R, writer: W, child: Option<Child>) -> Self {
        Self {
            io: Arc::new(tokio::sync::Mutex::new(PipeIo {
                reader: IpcStreamReader::new(reader),
                writer: IpcStreamWriter::new(writer),
                child,
            })),
            on_log: None,
            describe: Arc::new(Mutex::new(None)),
            next_request_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Install a callback for out-of-band server logs.
    pub fn with_on_log<F>(mut self, on_log: F) -> Self
    where
        F: Fn(LogRecord) + Send + Sync + 'static,
    {
        self.on_log = Some(Arc::new(on_log));
        self
    }

    fn next_request_id(&self) -> String {
        format!("req-{}", self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn lock(&self) -> OwnedMutexGuard<PipeIo<R, W>> {
        self.io.clone().lock_owned().await
    }

    /// Fetch (and cache) the server's describe batch.
    pub async fn describe(&self) -> Result<Arc<DescribeInfo>, RpcError> {
        if let Some(info) = self.describe.lock().expect("describe cache").clone() {
            return Ok(info);
        }
        let request_id = self.next_request_id();
        let mut io = self.lock().await;
        let batch = unary_roundtrip(
            &mut *io,
            &empty_schema(),
            &Row::new(),
            keys::DESCRIBE_METHOD,
            &request_id,
            self.on_log.as_deref(),
        )
        .await?;
        drop(io);
        let info = Arc::new(DescribeInfo::from_batch(&batch)?);
        *self.describe.lock().expect("describe cache") = Some(info.clone());
        Ok(info)
    }

    /// The declared parameter schema for `method`, with defaults folded
    /// into `params`; falls back to inference when the server does not
    /// advertise the method.
    async fn request_schema(&self, method: &str, params: &mut Row) -> Result<SchemaRef, RpcError> {
        let info = self.describe().await?;
        Ok(info
            .resolve_request(method, params)
            .unwrap_or_else(|| infer_schema(std::slice::from_ref(params))))
    }

    /// Invoke a unary method and return its result row.
    pub async fn call(&self, method: &str, mut params: Row) -> Result<Row, RpcError> {
        let schema = self.request_schema(method, &mut params).await?;
        let request_id = self.next_request_id();
        let mut io = self.lock().await;
        let data = unary_roundtrip(
            &mut *io,
            &schema,
            &params,
            method,
            &request_id,
            self.on_log.as_deref(),
        )
        .await?;
        let mut rows = batch_rows(&data.batch)?;
        Ok(rows.pop().unwrap_or_default())
    }

    /// Open a stream session.
    ///
    /// The single-flight lock is held by the returned session until it is
    /// exhausted, closed, or dropped. Init errors surface here when the
    /// method declares a header; otherwise they surface on the first
    /// round, once input has flowed.
    pub async fn stream(&self, method: &str, mut params: Row) -> Result<PipeSession<R, W>, RpcError> {
        let schema = self.request_schema(method, &mut params).await?;
        let has_header = self
            .describe()
            .await?
            .methods
            .get(method)
            .is_some_and(|m| m.has_header);

        let request_id = self.next_request_id();
        let request = build_request(&schema, &params, method, Some(&request_id))?;

        let mut io = self.lock().await;
        io.writer.begin_stream(&schema).await?;
        io.writer.write_batch(&request).await?;
        io.writer.finish_stream().await?;

        let mut header = None;
        if has_header {
            match read_header_stream(&mut *io, self.on_log.as_deref()).await {
                Ok(row) => header = Some(row),
                Err(e) => {
                    // Close our never-opened input side so the server's
                    // drain finds a complete stream, then give the lock
                    // back.
                    let _ = io.writer.begin_stream(&empty_schema()).await;
                    let _ = io.writer.finish_stream().await;
                    return Err(e);
                }
            }
        }

        Ok(PipeSession::new(io, self.on_log.clone(), header))
    }

    /// Shut down the transport: signal EOF to the server and reap the
    /// child process, if this client spawned one.
    pub async fn close(self) -> Result<(), RpcError> {
        let mut io = self.lock().await;
        let _ = io.writer.shutdown().await;
        if let Some(child) = io.child.as_mut() {
            child.wait().await?;
        }
        Ok(())
    }
}

/// One unary request/response on the locked transport: write the request
/// stream, then read response batches to end-of-stream, dispatching logs
/// and surfacing the data batch or the remote error.
pub(crate) async fn unary_roundtrip<R, W>(
    io: &mut PipeIo<R, W>,
    schema: &SchemaRef,
    params: &Row,
    method: &str,
    request_id: &str,
    on_log: Option<&LogSink>,
) -> Result<AnnotatedBatch, RpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let request = build_request(schema, params, method, Some(request_id))?;
    io.writer.begin_stream(schema).await?;
    io.writer.write_batch(&request).await?;
    io.writer.finish_stream().await?;

    let Some(response_schema) = io.reader.begin_stream().await? else {
        return Err(RpcError::Transport(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "server closed before responding",
        )));
    };

    let mut data: Option<AnnotatedBatch> = None;
    let mut failure: Option<RpcError> = None;
    while let Some(batch) = io.reader.next_batch(&response_schema).await? {
        match dispatch_log_or_error(&batch, on_log) {
            Ok(true) => {}
            Ok(false) => {
                if data.is_none() {
                    data = Some(batch);
                }
            }
            // Keep reading to the end-of-stream marker so the transport
            // stays aligned for the next request.
            Err(e) => failure = Some(e),
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    data.ok_or_else(|| RpcError::protocol("response stream contained no result batch"))
}

/// Read the header stream of a freshly-opened session.
async fn read_header_stream<R, W>(
    io: &mut PipeIo<R, W>,
    on_log: Option<&LogSink>,
) -> Result<Row, RpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(schema) = io.reader.begin_stream().await? else {
        return Err(RpcError::Transport(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "server closed during stream open",
        )));
    };

    let mut header: Option<Row> = None;
    let mut failure: Option<RpcError> = None;
    while let Some(batch) = io.reader.next_batch(&schema).await? {
        match dispatch_log_or_error(&batch, on_log) {
            Ok(true) => {}
            Ok(false) => header = batch_rows(&batch.batch)?.pop(),
            Err(e) => failure = Some(e),
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }
    header.ok_or_else(|| RpcError::protocol("header stream contained no header batch"))
}
