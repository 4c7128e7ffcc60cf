//! The HTTP client.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arrow_schema::SchemaRef;
use http::{header, StatusCode};

use vgi_core::DescribeInfo;
use vgi_ipc::{encode_stream, AnnotatedBatch, IpcBytesReader};
use vgi_types::{keys, LogRecord, RemoteError, Row, RpcError};
use vgi_wire::{batch_rows, build_request, classify, infer_schema, BatchKind, LogSink};

use crate::session::HttpSession;

const ZSTD_ENCODING: &str = "zstd";

fn transport_error(message: String) -> RpcError {
    RpcError::Transport(std::io::Error::new(std::io::ErrorKind::Other, message))
}

/// What one response stream contained.
#[derive(Default)]
pub(crate) struct StreamScan {
    pub(crate) schema: Option<SchemaRef>,
    pub(crate) data: Vec<AnnotatedBatch>,
    pub(crate) token: Option<String>,
    pub(crate) error: Option<RemoteError>,
}

impl StreamScan {
    pub(crate) fn has_progress(&self) -> bool {
        !self.data.is_empty() || self.token.is_some()
    }
}

/// Client for the HTTP transport.
///
/// Stateless on the wire: every round trip is one POST. The client caches
/// the describe batch; per-stream state (tokens, schemas) lives in the
/// [`HttpSession`]s it hands out.
#[derive(Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    base_url: String,
    on_log: Option<Arc<LogSink>>,
    compression_level: Option<i32>,
    describe: Arc<Mutex<Option<Arc<DescribeInfo>>>>,
    next_request_id: Arc<AtomicU64>,
}

impl HttpClient {
    /// `base_url` is the route prefix, e.g. `http://127.0.0.1:8080`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            on_log: None,
            compression_level: None,
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

    /// Compress request bodies with zstd at this level.
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    pub(crate) fn on_log(&self) -> Option<&LogSink> {
        self.on_log.as_deref()
    }

    pub(crate) fn next_request_id(&self) -> String {
        format!("req-{}", self.next_request_id.fetch_add(1, Ordering::Relaxed))
    }

    /// One POST round trip, with the transparent compression filter on
    /// both directions.
    pub(crate) async fn post(
        &self,
        path: &str,
        body: Vec<u8>,
    ) -> Result<(StatusCode, Vec<u8>), RpcError> {
        let url = format!("{}/{path}", self.base_url);
        let mut request = self
            .http
            .post(&url)
            .header(header::CONTENT_TYPE, keys::ARROW_STREAM_CONTENT_TYPE);
        let body = match self.compression_level {
            Some(level) => {
                let compressed = zstd::stream::encode_all(body.as_slice(), level)
                    .map_err(|e| transport_error(format!("compress request: {e}")))?;
                request = request.header(header::CONTENT_ENCODING, ZSTD_ENCODING);
                compressed
            }
            None => body,
        };

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(format!("POST {url}: {e}")))?;
        let status = response.status();
        let compressed = response
            .headers()
            .get(header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case(ZSTD_ENCODING));
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(format!("read response from {url}: {e}")))?;
        let bytes = if compressed {
            zstd::stream::decode_all(bytes.as_ref())
                .map_err(|e| RpcError::protocol(format!("invalid zstd response body: {e}")))?
        } else {
            bytes.to_vec()
        };
        Ok((status, bytes))
    }

    /// Scan a response stream, falling back to a status error when a
    /// failure response has no parseable stream body (policy rejections
    /// answer in plain text). Errors travel as EXCEPTION batches in the
    /// body whatever the status.
    pub(crate) fn scan_or_status(
        &self,
        reader: &mut IpcBytesReader<'_>,
        status: StatusCode,
    ) -> Result<StreamScan, RpcError> {
        match self.scan_stream(reader) {
            Ok(scan) => Ok(scan),
            Err(_) if !status.is_success() => Err(http_status_error(status)),
            Err(e) => Err(e),
        }
    }

    /// Scan one stream out of a response body: dispatch logs, collect
    /// data batches and tokens, and capture a terminal error.
    pub(crate) fn scan_stream(
        &self,
        reader: &mut IpcBytesReader<'_>,
    ) -> Result<StreamScan, RpcError> {
        let stream = reader.read_stream()?;
        let mut scan = StreamScan {
            schema: Some(stream.schema),
            ..StreamScan::default()
        };
        for batch in stream.batches {
            match classify(&batch) {
                BatchKind::Error(remote) => scan.error = Some(remote),
                BatchKind::Log(record) => {
                    if let Some(on_log) = self.on_log() {
                        on_log(record);
                    }
                }
                BatchKind::Continuation(token) => scan.token = Some(token),
                BatchKind::DataWithToken(token) => {
                    scan.token = Some(token);
                    scan.data.push(batch);
                }
                BatchKind::Data => scan.data.push(batch),
            }
        }
        Ok(scan)
    }

    /// Fetch (and cache) the server's describe batch.
    pub async fn describe(&self) -> Result<Arc<DescribeInfo>, RpcError> {
        if let Some(info) = self.describe.lock().expect("describe cache").clone() {
            return Ok(info);
        }
        let batch = self
            .unary_roundtrip(keys::DESCRIBE_METHOD, Row::new())
            .await?;
        let info = Arc::new(DescribeInfo::from_batch(&batch)?);
        *self.describe.lock().expect("describe cache") = Some(info.clone());
        Ok(info)
    }

    async fn request_schema(&self, method: &str, params: &mut Row) -> Result<SchemaRef, RpcError> {
        if method == keys::DESCRIBE_METHOD {
            return Ok(infer_schema(&[]));
        }
        let info = Box::pin(self.describe()).await?;
        Ok(info
            .resolve_request(method, params)
            .unwrap_or_else(|| infer_schema(std::slice::from_ref(params))))
    }

    async fn unary_roundtrip(&self, method: &str, mut params: Row) -> Result<AnnotatedBatch, RpcError> {
        let schema = self.request_schema(method, &mut params).await?;
        let request_id = self.next_request_id();
        let request = build_request(&schema, &params, method, Some(&request_id))?;
        let body = encode_stream(schema, &[request])?;
        let (status, bytes) = self.post(method, body).await?;

        let mut reader = IpcBytesReader::new(&bytes);
        let scan = self.scan_or_status(&mut reader, status)?;
        if let Some(remote) = scan.error {
            return Err(RpcError::Remote(remote));
        }
        scan.data
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::protocol("response stream contained no result batch"))
    }

    /// Invoke a unary method and return its result row.
    pub async fn call(&self, method: &str, params: Row) -> Result<Row, RpcError> {
        let data = self.unary_roundtrip(method, params).await?;
        let mut rows = batch_rows(&data.batch)?;
        Ok(rows.pop().unwrap_or_default())
    }

    /// Open a stream session: POST init, read the header stream when the
    /// method declares one, then seed the session with the data stream's
    /// batches and continuation token.
    ///
    /// An init error throws here; an error that arrived alongside data or
    /// a token is deferred to iteration.
    pub async fn stream(&self, method: &str, mut params: Row) -> Result<HttpSession, RpcError> {
        let schema = self.request_schema(method, &mut params).await?;
        let info = self.describe().await?;
        let method_info = info.methods.get(method);
        let has_header = method_info.is_some_and(|m| m.has_header);

        let request_id = self.next_request_id();
        let request = build_request(&schema, &params, method, Some(&request_id))?;
        let body = encode_stream(schema, &[request])?;
        let (status, bytes) = self.post(&format!("{method}/init"), body).await?;

        let mut reader = IpcBytesReader::new(&bytes);
        let mut header = None;
        if has_header {
            let scan = self.scan_or_status(&mut reader, status)?;
            if let Some(remote) = scan.error {
                return Err(RpcError::Remote(remote));
            }
            header = scan
                .data
                .first()
                .map(|batch| batch_rows(&batch.batch))
                .transpose()?
                .and_then(|mut rows| rows.pop());
            if reader.is_at_end() {
                return Err(RpcError::protocol(
                    "init response ended after the header stream",
                ));
            }
        }

        let scan = self.scan_or_status(&mut reader, status)?;
        let output_schema = scan
            .schema
            .clone()
            .or_else(|| method_info.map(|m| m.result_schema.clone()));
        let mut session = HttpSession::new(self.clone(), method.to_owned(), header, output_schema);
        session.absorb(scan)?;
        Ok(session)
    }
}

pub(crate) fn http_status_error(status: StatusCode) -> RpcError {
    RpcError::protocol(format!("HTTP request failed with status {status}"))
}
