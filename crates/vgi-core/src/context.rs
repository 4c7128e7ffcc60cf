//! Per-request handler context.

use std::sync::{Arc, Mutex};

use arrow_schema::SchemaRef;

use vgi_ipc::AnnotatedBatch;
use vgi_types::LogLevel;
use vgi_wire::build_log_batch;

/// What a handler sees of the request besides its parameters.
///
/// Cheap to clone; the dispatcher keeps a clone and drains the buffered
/// client logs into the response stream after the handler returns.
#[derive(Clone)]
pub struct RpcContext {
    server_id: Arc<str>,
    request_id: Option<Arc<str>>,
    logs: Arc<Mutex<Vec<PendingLog>>>,
}

struct PendingLog {
    level: LogLevel,
    message: String,
    extra: Option<serde_json::Value>,
}

impl RpcContext {
    pub fn new(server_id: &str, request_id: Option<&str>) -> Self {
        Self {
            server_id: Arc::from(server_id),
            request_id: request_id.map(Arc::from),
            logs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Queue an out-of-band log record for the client. It is emitted as a
    /// zero-row batch ahead of the call's result.
    pub fn client_log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        extra: Option<serde_json::Value>,
    ) {
        let mut logs = self.logs.lock().expect("log buffer poisoned");
        logs.push(PendingLog {
            level,
            message: message.into(),
            extra,
        });
    }

    /// Take the buffered logs as batches shaped to `schema`.
    pub fn drain_log_batches(&self, schema: &SchemaRef) -> Vec<AnnotatedBatch> {
        let mut logs = self.logs.lock().expect("log buffer poisoned");
        logs.drain(..)
            .map(|log| {
                build_log_batch(
                    schema,
                    log.level.as_str(),
                    &log.message,
                    log.extra.as_ref(),
                    &self.server_id,
                    self.request_id(),
                )
            })
            .collect()
    }
}
