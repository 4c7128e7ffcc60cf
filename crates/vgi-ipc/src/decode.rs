//! In-memory stream decoding.

use arrow_schema::SchemaRef;

use vgi_types::RpcError;

use crate::batch::AnnotatedBatch;
use crate::frame::{decode_batch_message, decode_schema_header, parse_header, HeaderKind,
    CONTINUATION};

/// A fully-decoded IPC stream.
#[derive(Debug, Clone)]
pub struct DecodedStream {
    pub schema: SchemaRef,
    pub batches: Vec<AnnotatedBatch>,
}

/// Cursor over one or more back-to-back IPC streams in a byte buffer.
///
/// HTTP stream responses concatenate a header stream and a data stream;
/// after [`read_stream`](IpcBytesReader::read_stream) consumes one stream
/// the cursor sits at the start of the next, and
/// [`is_at_end`](IpcBytesReader::is_at_end) reports whether more follow.
pub struct IpcBytesReader<'a> {
    data: &'a [u8],
    pos: usize,
}

enum RawMessage<'a> {
    Message { header: &'a [u8], body: &'a [u8] },
    Eos,
}

impl<'a> IpcBytesReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], RpcError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.data.len());
        match end {
            Some(end) => {
                let slice = &self.data[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(RpcError::protocol(format!("truncated ipc stream: {what}"))),
        }
    }

    fn read_message(&mut self) -> Result<RawMessage<'a>, RpcError> {
        let marker = self.take(4, "continuation marker")?;
        if marker != CONTINUATION {
            return Err(RpcError::protocol(
                "malformed ipc stream: missing continuation marker",
            ));
        }
        let len_bytes = self.take(4, "message length")?;
        let header_len = u32::from_le_bytes(len_bytes.try_into().expect("4 bytes")) as usize;
        if header_len == 0 {
            return Ok(RawMessage::Eos);
        }
        let header = self.take(header_len, "message header")?;
        let (_, body_len) = parse_header(header)?;
        let body = self.take(body_len, "message body")?;
        Ok(RawMessage::Message { header, body })
    }

    /// Read the schema message that opens a stream.
    pub fn read_schema(&mut self) -> Result<SchemaRef, RpcError> {
        match self.read_message()? {
            RawMessage::Message { header, .. } => match parse_header(header)? {
                (HeaderKind::Schema, _) => decode_schema_header(header),
                (HeaderKind::RecordBatch, _) => Err(RpcError::protocol(
                    "ipc stream started with a record batch instead of a schema",
                )),
            },
            RawMessage::Eos => Err(RpcError::protocol("ipc stream ended before its schema")),
        }
    }

    /// Read the next batch of the current stream, or `None` at its
    /// end-of-stream marker.
    pub fn next_batch(
        &mut self,
        schema: &SchemaRef,
    ) -> Result<Option<AnnotatedBatch>, RpcError> {
        match self.read_message()? {
            RawMessage::Eos => Ok(None),
            RawMessage::Message { header, body } => match parse_header(header)? {
                (HeaderKind::RecordBatch, _) => {
                    Ok(Some(decode_batch_message(header, body.to_vec(), schema)?))
                }
                (HeaderKind::Schema, _) => Err(RpcError::protocol(
                    "unexpected schema message inside an ipc stream",
                )),
            },
        }
    }

    /// Consume one whole stream.
    pub fn read_stream(&mut self) -> Result<DecodedStream, RpcError> {
        let schema = self.read_schema()?;
        let mut batches = Vec::new();
        while let Some(batch) = self.next_batch(&schema)? {
            batches.push(batch);
        }
        Ok(DecodedStream { schema, batches })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchMetadata;
    use crate::encode::{encode_stream, IpcStreamEncoder};
    use arrow_array::{Int64Array, RecordBatch, StringArray};
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    fn schema() -> SchemaRef {
        SchemaRef::new(Schema::new(vec![
            Field::new("n", DataType::Int64, false),
            Field::new("s", DataType::Utf8, false),
        ]))
    }

    fn batch(n: i64, s: &str) -> AnnotatedBatch {
        let batch = RecordBatch::try_new(
            schema(),
            vec![
                Arc::new(Int64Array::from(vec![n])),
                Arc::new(StringArray::from(vec![s])),
            ],
        )
        .unwrap();
        AnnotatedBatch::new(batch)
    }

    #[test]
    fn stream_with_mixed_batches_round_trips() {
        let mut encoder = IpcStreamEncoder::new(schema()).unwrap();
        let mut log_meta = BatchMetadata::new();
        log_meta.insert("log_level".into(), "INFO".into());
        log_meta.insert("log_message".into(), "working".into());
        encoder
            .write_batch(&AnnotatedBatch::empty(schema(), log_meta.clone()))
            .unwrap();
        encoder.write_batch(&batch(7, "seven")).unwrap();
        let bytes = encoder.finish();

        let mut reader = IpcBytesReader::new(&bytes);
        let decoded = reader.read_stream().unwrap();
        assert!(reader.is_at_end());
        assert_eq!(decoded.batches.len(), 2);
        assert_eq!(decoded.batches[0].num_rows(), 0);
        assert_eq!(decoded.batches[0].metadata, log_meta);
        assert_eq!(decoded.batches[1].num_rows(), 1);
        assert!(decoded.batches[1].metadata.is_empty());
    }

    #[test]
    fn concatenated_streams_decode_in_sequence() {
        let first = encode_stream(schema(), &[batch(1, "one")]).unwrap();
        let second = encode_stream(schema(), &[batch(2, "two")]).unwrap();
        let joined = [first, second].concat();

        let mut reader = IpcBytesReader::new(&joined);
        let a = reader.read_stream().unwrap();
        assert!(!reader.is_at_end());
        let b = reader.read_stream().unwrap();
        assert!(reader.is_at_end());
        assert_eq!(a.batches[0].batch.num_rows(), 1);
        assert_eq!(b.batches[0].batch.num_rows(), 1);
    }

    #[test]
    fn truncation_is_a_protocol_error() {
        let bytes = encode_stream(schema(), &[batch(1, "one")]).unwrap();
        let mut reader = IpcBytesReader::new(&bytes[..bytes.len() - 12]);
        let err = reader.read_stream().unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}
