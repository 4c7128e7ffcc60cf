//! Response batches and their classification.

use arrow_schema::SchemaRef;
use serde_json::json;

use vgi_ipc::{AnnotatedBatch, BatchMetadata};
use vgi_types::{keys, LogRecord, RemoteError, Row, RpcError};

fn response_ids(server_id: &str, request_id: Option<&str>) -> BatchMetadata {
    let mut metadata = BatchMetadata::new();
    metadata.insert(keys::SERVER_ID.to_owned(), server_id.to_owned());
    if let Some(id) = request_id {
        metadata.insert(keys::REQUEST_ID.to_owned(), id.to_owned());
    }
    metadata
}

/// Build the single result batch of a unary response.
pub fn build_result_batch(
    schema: &SchemaRef,
    values: &Row,
    server_id: &str,
    request_id: Option<&str>,
) -> Result<AnnotatedBatch, RpcError> {
    let batch = crate::columns::build_batch(schema, std::slice::from_ref(values))?;
    Ok(AnnotatedBatch::with_metadata(
        batch,
        response_ids(server_id, request_id),
    ))
}

/// Build the zero-row EXCEPTION batch that terminates a stream on error.
pub fn build_error_batch(
    schema: &SchemaRef,
    error: &RpcError,
    server_id: &str,
    request_id: Option<&str>,
) -> AnnotatedBatch {
    let mut metadata = response_ids(server_id, request_id);
    metadata.insert(
        keys::LOG_LEVEL.to_owned(),
        keys::EXCEPTION_LEVEL.to_owned(),
    );
    metadata.insert(keys::LOG_MESSAGE.to_owned(), error.to_string());
    let traceback = match error {
        RpcError::Remote(remote) => remote.traceback.clone(),
        _ => None,
    };
    let extra = json!({
        "exception_type": error.kind(),
        "exception_message": error.message(),
        "traceback": traceback,
    });
    metadata.insert(keys::LOG_EXTRA.to_owned(), extra.to_string());
    AnnotatedBatch::empty(schema.clone(), metadata)
}

/// Build a zero-row out-of-band log batch.
pub fn build_log_batch(
    schema: &SchemaRef,
    level: &str,
    message: &str,
    extra: Option<&serde_json::Value>,
    server_id: &str,
    request_id: Option<&str>,
) -> AnnotatedBatch {
    let mut metadata = response_ids(server_id, request_id);
    metadata.insert(keys::LOG_LEVEL.to_owned(), level.to_owned());
    metadata.insert(keys::LOG_MESSAGE.to_owned(), message.to_owned());
    if let Some(extra) = extra {
        metadata.insert(keys::LOG_EXTRA.to_owned(), extra.to_string());
    }
    AnnotatedBatch::empty(schema.clone(), metadata)
}

/// What a batch on the wire means to its reader.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchKind {
    /// Terminal error; the caller raises it.
    Error(RemoteError),
    /// Out-of-band log; the caller keeps reading.
    Log(LogRecord),
    /// Zero-row continuation carrying the next state token.
    Continuation(String),
    /// Data rows with a state token piggybacked on the same batch.
    DataWithToken(String),
    /// Plain data rows.
    Data,
}

/// Classify a batch by its metadata.
pub fn classify(batch: &AnnotatedBatch) -> BatchKind {
    let rows = batch.num_rows();
    if rows == 0 {
        if let Some(level) = batch.meta(keys::LOG_LEVEL) {
            if level == keys::EXCEPTION_LEVEL {
                return BatchKind::Error(remote_error_from_batch(batch));
            }
            return BatchKind::Log(LogRecord {
                level: level.to_owned(),
                message: batch.meta(keys::LOG_MESSAGE).unwrap_or_default().to_owned(),
                extra: batch
                    .meta(keys::LOG_EXTRA)
                    .and_then(|raw| serde_json::from_str(raw).ok()),
            });
        }
        if let Some(token) = batch.meta(keys::STREAM_STATE) {
            return BatchKind::Continuation(token.to_owned());
        }
        return BatchKind::Data;
    }
    if let Some(token) = batch.meta(keys::STREAM_STATE) {
        return BatchKind::DataWithToken(token.to_owned());
    }
    BatchKind::Data
}

/// Reconstruct the remote error carried by an EXCEPTION batch.
pub fn remote_error_from_batch(batch: &AnnotatedBatch) -> RemoteError {
    let message = batch.meta(keys::LOG_MESSAGE).unwrap_or_default();
    let extra: Option<serde_json::Value> = batch
        .meta(keys::LOG_EXTRA)
        .and_then(|raw| serde_json::from_str(raw).ok());
    let field = |name: &str| -> Option<String> {
        extra
            .as_ref()
            .and_then(|e| e.get(name))
            .and_then(|v| v.as_str())
            .map(str::to_owned)
    };
    RemoteError {
        exception_type: field("exception_type").unwrap_or_else(|| "RemoteError".to_owned()),
        exception_message: field("exception_message").unwrap_or_else(|| message.to_owned()),
        traceback: field("traceback"),
    }
}

/// A client's log callback.
pub type LogSink = dyn Fn(LogRecord) + Send + Sync;

/// Handle a batch that may be a log or an error: raise remote errors,
/// feed logs to `on_log` and report them consumed, and pass everything
/// else through.
pub fn dispatch_log_or_error(
    batch: &AnnotatedBatch,
    on_log: Option<&LogSink>,
) -> Result<bool, RpcError> {
    match classify(batch) {
        BatchKind::Error(remote) => Err(RpcError::Remote(remote)),
        BatchKind::Log(record) => {
            if let Some(on_log) = on_log {
                on_log(record);
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}
