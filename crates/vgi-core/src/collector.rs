//! Per-call output buffering.

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;

use vgi_ipc::{AnnotatedBatch, BatchMetadata};
use vgi_types::{keys, LogLevel, Row, RpcError, StreamMode};
use vgi_wire::{build_batch, build_log_batch};

/// The buffer a stream handler writes into during one produce call or
/// exchange round.
///
/// Owned by the dispatcher for the duration of one call: any number of
/// logs, at most one data batch, and — for producers only — the `finish`
/// flag that ends the stream.
pub struct OutputCollector {
    schema: SchemaRef,
    mode: StreamMode,
    server_id: String,
    request_id: Option<String>,
    logs: Vec<AnnotatedBatch>,
    data: Option<AnnotatedBatch>,
    finished: bool,
}

/// Everything a drained collector produced.
pub struct CollectorOutput {
    pub logs: Vec<AnnotatedBatch>,
    pub data: Option<AnnotatedBatch>,
    pub finished: bool,
}

impl CollectorOutput {
    /// All batches in emission order: logs first, then the data batch.
    pub fn batches(self) -> Vec<AnnotatedBatch> {
        let mut batches = self.logs;
        batches.extend(self.data);
        batches
    }
}

impl OutputCollector {
    pub fn new(
        schema: SchemaRef,
        mode: StreamMode,
        server_id: &str,
        request_id: Option<&str>,
    ) -> Self {
        Self {
            schema,
            mode,
            server_id: server_id.to_owned(),
            request_id: request_id.map(str::to_owned),
            logs: Vec::new(),
            data: None,
            finished: false,
        }
    }

    /// The schema every emitted batch must match.
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Emit an out-of-band log batch ahead of this call's data.
    pub fn log(
        &mut self,
        level: LogLevel,
        message: impl AsRef<str>,
        extra: Option<serde_json::Value>,
    ) {
        self.logs.push(build_log_batch(
            &self.schema,
            level.as_str(),
            message.as_ref(),
            extra.as_ref(),
            &self.server_id,
            self.request_id.as_deref(),
        ));
    }

    /// Emit the call's single data batch.
    pub fn emit_batch(&mut self, batch: RecordBatch) -> Result<(), RpcError> {
        if self.data.is_some() {
            return Err(RpcError::contract(
                "at most one data batch may be emitted per call",
            ));
        }
        if batch.schema().fields() != self.schema.fields() {
            return Err(RpcError::contract(
                "data batch does not match the output schema",
            ));
        }
        let mut metadata = BatchMetadata::new();
        metadata.insert(keys::SERVER_ID.to_owned(), self.server_id.clone());
        if let Some(id) = &self.request_id {
            metadata.insert(keys::REQUEST_ID.to_owned(), id.clone());
        }
        self.data = Some(AnnotatedBatch::with_metadata(batch, metadata));
        Ok(())
    }

    /// Build and emit the data batch from rows of named values.
    pub fn emit_rows(&mut self, rows: &[Row]) -> Result<(), RpcError> {
        let batch = build_batch(&self.schema, rows)?;
        self.emit_batch(batch)
    }

    /// End the stream after this call. Producers only.
    pub fn finish(&mut self) -> Result<(), RpcError> {
        if self.mode == StreamMode::Exchange {
            return Err(RpcError::contract(
                "finish is not allowed on exchange streams",
            ));
        }
        self.finished = true;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume the collector.
    pub fn into_output(self) -> CollectorOutput {
        CollectorOutput {
            logs: self.logs,
            data: self.data,
            finished: self.finished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::{DataType, Field, Schema};

    fn schema() -> SchemaRef {
        SchemaRef::new(Schema::new(vec![Field::new("n", DataType::Int64, false)]))
    }

    fn collector(mode: StreamMode) -> OutputCollector {
        OutputCollector::new(schema(), mode, "srv", Some("req-1"))
    }

    #[test]
    fn logs_precede_the_data_batch() {
        let mut out = collector(StreamMode::Producer);
        out.log(LogLevel::Info, "first", None);
        out.emit_rows(&[Row::new().with("n", 1i64)]).unwrap();
        out.log(LogLevel::Warn, "second", None);

        let output = out.into_output();
        assert!(output.data.is_some());
        let batches = output.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].meta("log_level"), Some("INFO"));
        assert_eq!(batches[1].meta("log_level"), Some("WARN"));
        assert_eq!(batches[2].num_rows(), 1);
        assert_eq!(batches[2].meta("server_id"), Some("srv"));
    }

    #[test]
    fn second_data_batch_is_a_contract_error() {
        let mut out = collector(StreamMode::Producer);
        out.emit_rows(&[Row::new().with("n", 1i64)]).unwrap();
        let err = out.emit_rows(&[Row::new().with("n", 2i64)]).unwrap_err();
        assert!(matches!(err, RpcError::Contract(_)));
    }

    #[test]
    fn finish_is_rejected_on_exchange_streams() {
        let mut out = collector(StreamMode::Exchange);
        assert!(matches!(out.finish(), Err(RpcError::Contract(_))));

        let mut out = collector(StreamMode::Producer);
        out.finish().unwrap();
        assert!(out.is_finished());
    }

    #[test]
    fn mismatched_batch_schema_is_rejected() {
        let other = SchemaRef::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
        let batch = build_batch(&other, &[Row::new().with("x", 1i64)]).unwrap();
        let mut out = collector(StreamMode::Producer);
        assert!(matches!(out.emit_batch(batch), Err(RpcError::Contract(_))));
    }
}
