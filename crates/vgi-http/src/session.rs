//! Client-side stream sessions over HTTP.

use std::collections::VecDeque;

use arrow_schema::SchemaRef;

use vgi_ipc::{encode_stream, AnnotatedBatch, BatchMetadata, IpcBytesReader};
use vgi_types::{keys, Row, RpcError};
use vgi_wire::{batch_rows, build_batch, infer_schema, schema_fields_match};

use crate::client::{HttpClient, StreamScan};

/// One stream session on the HTTP transport.
///
/// The transport holds nothing between round trips; the session object is
/// where the state lives: the last continuation token, the output schema
/// (from the init response's actual IPC schema, falling back to the
/// describe info), the input schema locked by the first exchange, and any
/// deferred error. Errors that arrived alongside data or a token are
/// raised only once the buffered data has been consumed, preserving the
/// init-error versus mid-stream distinction.
pub struct HttpSession {
    client: HttpClient,
    method: String,
    header: Option<Row>,
    output_schema: Option<SchemaRef>,
    input_schema: Option<SchemaRef>,
    token: Option<String>,
    buffered: VecDeque<AnnotatedBatch>,
    deferred_error: Option<RpcError>,
    done: bool,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("method", &self.method)
            .field("header", &self.header)
            .field("output_schema", &self.output_schema)
            .field("input_schema", &self.input_schema)
            .field("token", &self.token)
            .field("buffered", &self.buffered)
            .field("deferred_error", &self.deferred_error)
            .field("done", &self.done)
            .finish()
    }
}

impl HttpSession {
    pub(crate) fn new(
        client: HttpClient,
        method: String,
        header: Option<Row>,
        output_schema: Option<SchemaRef>,
    ) -> Self {
        Self {
            client,
            method,
            header,
            output_schema,
            input_schema: None,
            token: None,
            buffered: VecDeque::new(),
            deferred_error: None,
            done: false,
        }
    }

    /// The header row, when the method declares a header schema.
    pub fn header(&self) -> Option<&Row> {
        self.header.as_ref()
    }

    /// Fold one response stream into the session. An error with no data
    /// and no token is immediate; otherwise it is deferred to iteration.
    pub(crate) fn absorb(&mut self, scan: StreamScan) -> Result<(), RpcError> {
        if let Some(schema) = &scan.schema {
            if self.output_schema.is_none() {
                self.output_schema = Some(schema.clone());
            }
        }
        self.token = scan.token.clone();
        if self.token.is_none() && scan.data.is_empty() {
            self.done = true;
        }
        match scan.error {
            Some(remote) if scan.has_progress() => {
                self.buffered.extend(scan.data);
                self.deferred_error = Some(RpcError::Remote(remote));
                // Nothing resumes past an error.
                self.token = None;
                Ok(())
            }
            Some(remote) => {
                self.done = true;
                Err(RpcError::Remote(remote))
            }
            None => {
                self.buffered.extend(scan.data);
                Ok(())
            }
        }
    }

    fn take_deferred_if_drained(&mut self) -> Option<RpcError> {
        if self.buffered.is_empty() {
            if let Some(e) = self.deferred_error.take() {
                self.done = true;
                return Some(e);
            }
        }
        None
    }

    /// Pull the next producer batch, resuming the server-side loop with
    /// the continuation token as needed. `None` once the stream ends.
    pub async fn next_batch(&mut self) -> Result<Option<AnnotatedBatch>, RpcError> {
        loop {
            if let Some(batch) = self.buffered.pop_front() {
                return Ok(Some(batch));
            }
            if let Some(e) = self.take_deferred_if_drained() {
                return Err(e);
            }
            let Some(token) = self.token.take() else {
                self.done = true;
                return Ok(None);
            };

            // A zero-row tick carrying the token resumes the producer.
            let schema = self
                .input_schema
                .clone()
                .unwrap_or_else(|| infer_schema(&[]));
            let mut metadata = BatchMetadata::new();
            metadata.insert(keys::STREAM_STATE.to_owned(), token);
            metadata.insert(keys::REQUEST_ID.to_owned(), self.client.next_request_id());
            let tick = AnnotatedBatch::empty(schema.clone(), metadata);
            let body = encode_stream(schema, &[tick])?;
            let (status, bytes) = self
                .client
                .post(&format!("{}/exchange", self.method), body)
                .await?;

            let mut reader = IpcBytesReader::new(&bytes);
            let scan = self.client.scan_or_status(&mut reader, status)?;
            self.absorb(scan)?;
        }
    }

    /// [`next_batch`](Self::next_batch), decoded to rows.
    pub async fn next_rows(&mut self) -> Result<Option<Vec<Row>>, RpcError> {
        match self.next_batch().await? {
            Some(batch) => Ok(Some(batch_rows(&batch.batch)?)),
            None => Ok(None),
        }
    }

    /// One exchange round: submit `rows`, rotate the token from the
    /// response, and return the round's data rows.
    ///
    /// The input schema is inferred from the first non-empty round and
    /// locked; later rounds with different fields fail client side
    /// without hitting the wire. A zero-row round needs a schema cached
    /// from an earlier round.
    pub async fn exchange(&mut self, rows: &[Row]) -> Result<Vec<Row>, RpcError> {
        if let Some(e) = self.take_deferred_if_drained() {
            return Err(e);
        }
        let Some(token) = self.token.clone() else {
            return Err(RpcError::protocol(
                "stream session has no continuation token; it is closed",
            ));
        };

        let schema = if rows.is_empty() {
            self.input_schema.clone().ok_or_else(|| {
                RpcError::contract("cannot infer an input schema from an empty first exchange")
            })?
        } else {
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
                locked
            } else {
                self.input_schema = Some(inferred.clone());
                inferred
            }
        };

        let batch = build_batch(&schema, rows)?;
        let mut metadata = BatchMetadata::new();
        metadata.insert(keys::STREAM_STATE.to_owned(), token);
        metadata.insert(keys::REQUEST_ID.to_owned(), self.client.next_request_id());
        let body = encode_stream(
            schema,
            &[AnnotatedBatch::with_metadata(batch, metadata)],
        )?;
        let (status, bytes) = self
            .client
            .post(&format!("{}/exchange", self.method), body)
            .await?;

        let mut reader = IpcBytesReader::new(&bytes);
        let scan = self.client.scan_or_status(&mut reader, status)?;
        self.absorb(scan)?;

        let mut out = Vec::new();
        while let Some(batch) = self.buffered.pop_front() {
            out.extend(batch_rows(&batch.batch)?);
        }
        Ok(out)
    }

    /// End the session. The server holds no state, so dropping the
    /// token is the whole teardown.
    pub async fn close(self) {}

    /// True once the stream has ended (exhausted, closed, or failed).
    pub fn is_done(&self) -> bool {
        self.done && self.buffered.is_empty()
    }
}
