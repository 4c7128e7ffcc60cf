//! Batches annotated with wire metadata.

use std::collections::BTreeMap;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;

/// Per-batch string metadata. Ordered so encoded bytes are deterministic.
pub type BatchMetadata = BTreeMap<String, String>;

/// A record batch plus the metadata map it carries on the wire.
#[derive(Debug, Clone)]
pub struct AnnotatedBatch {
    pub batch: RecordBatch,
    pub metadata: BatchMetadata,
}

impl AnnotatedBatch {
    /// A batch with no metadata.
    pub fn new(batch: RecordBatch) -> Self {
        Self {
            batch,
            metadata: BatchMetadata::new(),
        }
    }

    pub fn with_metadata(batch: RecordBatch, metadata: BatchMetadata) -> Self {
        Self { batch, metadata }
    }

    /// A zero-row batch on `schema` carrying `metadata`, the shape of log,
    /// error, and continuation batches.
    pub fn empty(schema: SchemaRef, metadata: BatchMetadata) -> Self {
        Self {
            batch: RecordBatch::new_empty(schema),
            metadata,
        }
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }
}

impl From<RecordBatch> for AnnotatedBatch {
    fn from(batch: RecordBatch) -> Self {
        Self::new(batch)
    }
}
