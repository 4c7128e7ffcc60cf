//! In-memory stream encoding.

use arrow_schema::SchemaRef;

use vgi_types::RpcError;

use crate::batch::AnnotatedBatch;
use crate::decode::IpcBytesReader;
use crate::frame::{write_batch_message, write_schema_message, EOS_MARKER};

/// Builds one complete IPC stream in memory.
///
/// Used for HTTP bodies and for the self-contained schema blobs in the
/// describe batch. The encoder writes the schema message up front and the
/// end-of-stream marker on [`finish`](IpcStreamEncoder::finish).
pub struct IpcStreamEncoder {
    buf: Vec<u8>,
    schema: SchemaRef,
}

impl IpcStreamEncoder {
    pub fn new(schema: SchemaRef) -> Result<Self, RpcError> {
        let mut buf = Vec::new();
        write_schema_message(&mut buf, &schema)?;
        Ok(Self { buf, schema })
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Append one batch. Returns the encoded size of the message, which
    /// the HTTP byte budget accounts against.
    pub fn write_batch(&mut self, batch: &AnnotatedBatch) -> Result<usize, RpcError> {
        let before = self.buf.len();
        write_batch_message(&mut self.buf, batch)?;
        Ok(self.buf.len() - before)
    }

    /// Terminate the stream and hand back its bytes.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&EOS_MARKER);
        self.buf
    }
}

/// Encode a schema plus batches as one finished stream.
pub fn encode_stream(
    schema: SchemaRef,
    batches: &[AnnotatedBatch],
) -> Result<Vec<u8>, RpcError> {
    let mut encoder = IpcStreamEncoder::new(schema)?;
    for batch in batches {
        encoder.write_batch(batch)?;
    }
    Ok(encoder.finish())
}

/// The self-contained schema-only stream (schema message + end-of-stream)
/// embedded in describe rows.
pub fn schema_ipc_bytes(schema: &SchemaRef) -> Result<Vec<u8>, RpcError> {
    encode_stream(schema.clone(), &[])
}

/// Decode a schema-only stream back into a schema.
pub fn decode_schema_ipc(bytes: &[u8]) -> Result<SchemaRef, RpcError> {
    let mut reader = IpcBytesReader::new(bytes);
    reader.read_schema()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::{DataType, Field, Schema};

    #[test]
    fn schema_blob_round_trips() {
        let schema = SchemaRef::new(Schema::new(vec![
            Field::new("n", DataType::Int32, false),
            Field::new("label", DataType::Utf8, true),
        ]));
        let bytes = schema_ipc_bytes(&schema).unwrap();
        let back = decode_schema_ipc(&bytes).unwrap();
        assert_eq!(back.fields(), schema.fields());
    }

    #[test]
    fn empty_schema_round_trips() {
        let schema = SchemaRef::new(Schema::empty());
        let bytes = schema_ipc_bytes(&schema).unwrap();
        let back = decode_schema_ipc(&bytes).unwrap();
        assert_eq!(back.fields().len(), 0);
    }
}
