//! Encapsulated-message encoding and decoding.
//!
//! One message on the wire is: a 4-byte continuation marker `0xFFFFFFFF`,
//! a little-endian `u32` header length, the message flatbuffer (padded to
//! 8 bytes), then the body. End-of-stream is a continuation marker with a
//! zero length. Record-batch headers are rebuilt here when a batch carries
//! metadata, since that is the one hook the high-level arrow writer lacks.

use std::collections::HashMap;

use arrow_array::{ArrayRef, RecordBatch};
use arrow_buffer::Buffer;
use arrow_ipc::writer::{DictionaryTracker, EncodedData, IpcDataGenerator, IpcWriteOptions};
use arrow_schema::{Schema, SchemaRef};

use vgi_types::RpcError;

use crate::batch::{AnnotatedBatch, BatchMetadata};

/// The 8-byte end-of-stream marker terminating every IPC stream.
pub const EOS_MARKER: [u8; 8] = [0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00];

/// The continuation bytes that open every encapsulated message.
pub(crate) const CONTINUATION: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

pub(crate) fn arrow_err(context: &str, e: impl std::fmt::Display) -> RpcError {
    RpcError::protocol(format!("{context}: {e}"))
}

/// Append an encoded schema message for `schema`.
pub(crate) fn write_schema_message(out: &mut Vec<u8>, schema: &Schema) -> Result<(), RpcError> {
    let options = IpcWriteOptions::default();
    let data_gen = IpcDataGenerator::default();
    let mut tracker = DictionaryTracker::new(false);
    let encoded = data_gen.schema_to_bytes_with_dictionary_tracker(schema, &mut tracker, &options);
    arrow_ipc::writer::write_message(&mut *out, encoded, &options)
        .map_err(|e| arrow_err("write schema message", e))?;
    Ok(())
}

/// Append an encoded record-batch message, injecting the batch metadata
/// into the message flatbuffer when present.
pub(crate) fn write_batch_message(
    out: &mut Vec<u8>,
    annotated: &AnnotatedBatch,
) -> Result<(), RpcError> {
    let options = IpcWriteOptions::default();
    let data_gen = IpcDataGenerator::default();
    let mut tracker = DictionaryTracker::new(false);
    let (dictionaries, mut encoded) = data_gen
        .encoded_batch(&annotated.batch, &mut tracker, &options)
        .map_err(|e| arrow_err("encode record batch", e))?;
    if !dictionaries.is_empty() {
        return Err(RpcError::protocol(
            "dictionary-encoded columns are not supported on the wire",
        ));
    }
    if !annotated.metadata.is_empty() {
        encoded.ipc_message = inject_metadata(&encoded.ipc_message, &annotated.metadata)?;
    }
    arrow_ipc::writer::write_message(&mut *out, encoded, &options)
        .map_err(|e| arrow_err("write record batch message", e))?;
    Ok(())
}

/// Rebuild a record-batch message flatbuffer with `custom_metadata` set.
///
/// The header fields (length, field nodes, buffer locations) are copied
/// verbatim; the body bytes are untouched, so `bodyLength` stays valid.
fn inject_metadata(ipc_message: &[u8], metadata: &BatchMetadata) -> Result<Vec<u8>, RpcError> {
    let message =
        arrow_ipc::root_as_message(ipc_message).map_err(|e| arrow_err("parse ipc message", e))?;
    let batch = message
        .header_as_record_batch()
        .ok_or_else(|| RpcError::protocol("metadata injection on a non-batch message"))?;

    let mut fbb = flatbuffers::FlatBufferBuilder::new();

    let nodes: Vec<arrow_ipc::FieldNode> = batch
        .nodes()
        .map(|v| v.iter().copied().collect())
        .unwrap_or_default();
    let buffers: Vec<arrow_ipc::Buffer> = batch
        .buffers()
        .map(|v| v.iter().copied().collect())
        .unwrap_or_default();
    let nodes_fb = fbb.create_vector(&nodes);
    let buffers_fb = fbb.create_vector(&buffers);
    let variadic_fb = batch.variadicBufferCounts().map(|v| {
        let counts: Vec<i64> = v.iter().collect();
        fbb.create_vector(&counts)
    });

    let header = {
        let mut rb = arrow_ipc::RecordBatchBuilder::new(&mut fbb);
        rb.add_length(batch.length());
        rb.add_nodes(nodes_fb);
        rb.add_buffers(buffers_fb);
        if let Some(v) = variadic_fb {
            rb.add_variadicBufferCounts(v);
        }
        rb.finish()
    };

    let mut kvs = Vec::with_capacity(metadata.len());
    for (key, value) in metadata {
        let key = fbb.create_string(key);
        let value = fbb.create_string(value);
        let mut kv = arrow_ipc::KeyValueBuilder::new(&mut fbb);
        kv.add_key(key);
        kv.add_value(value);
        kvs.push(kv.finish());
    }
    let kvs_fb = fbb.create_vector(&kvs);

    let rebuilt = {
        let mut mb = arrow_ipc::MessageBuilder::new(&mut fbb);
        mb.add_version(message.version());
        mb.add_header_type(arrow_ipc::MessageHeader::RecordBatch);
        mb.add_header(header.as_union_value());
        mb.add_bodyLength(message.bodyLength());
        mb.add_custom_metadata(kvs_fb);
        mb.finish()
    };
    fbb.finish(rebuilt, None);
    Ok(fbb.finished_data().to_vec())
}

/// What a decoded message header announces.
pub(crate) enum HeaderKind {
    Schema,
    RecordBatch,
}

/// Classify a message header and report its body length.
pub(crate) fn parse_header(header: &[u8]) -> Result<(HeaderKind, usize), RpcError> {
    let message =
        arrow_ipc::root_as_message(header).map_err(|e| arrow_err("parse ipc message", e))?;
    let body_len = usize::try_from(message.bodyLength())
        .map_err(|_| RpcError::protocol("negative ipc body length"))?;
    match message.header_type() {
        arrow_ipc::MessageHeader::Schema => Ok((HeaderKind::Schema, body_len)),
        arrow_ipc::MessageHeader::RecordBatch => Ok((HeaderKind::RecordBatch, body_len)),
        arrow_ipc::MessageHeader::DictionaryBatch => Err(RpcError::protocol(
            "dictionary batches are not supported on the wire",
        )),
        other => Err(RpcError::protocol(format!(
            "unsupported ipc message type {other:?}"
        ))),
    }
}

/// Decode a schema message header into an arrow schema.
pub(crate) fn decode_schema_header(header: &[u8]) -> Result<SchemaRef, RpcError> {
    let schema = arrow_ipc::convert::try_schema_from_flatbuffer_bytes(header)
        .map_err(|e| arrow_err("decode schema message", e))?;
    Ok(SchemaRef::new(schema))
}

/// Decode a record-batch message (header + body) against `schema`,
/// recovering the batch metadata from the message flatbuffer.
pub(crate) fn decode_batch_message(
    header: &[u8],
    body: Vec<u8>,
    schema: &SchemaRef,
) -> Result<AnnotatedBatch, RpcError> {
    let message =
        arrow_ipc::root_as_message(header).map_err(|e| arrow_err("parse ipc message", e))?;
    let rb = message
        .header_as_record_batch()
        .ok_or_else(|| RpcError::protocol("message header is not a record batch"))?;

    let mut metadata = BatchMetadata::new();
    if let Some(kvs) = message.custom_metadata() {
        for kv in kvs {
            if let (Some(key), Some(value)) = (kv.key(), kv.value()) {
                metadata.insert(key.to_owned(), value.to_owned());
            }
        }
    }

    let dictionaries: HashMap<i64, ArrayRef> = HashMap::new();
    let batch: RecordBatch = arrow_ipc::reader::read_record_batch(
        &Buffer::from(body),
        rb,
        schema.clone(),
        &dictionaries,
        None,
        &message.version(),
    )
    .map_err(|e| arrow_err("decode record batch", e))?;

    Ok(AnnotatedBatch { batch, metadata })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Float64Array;
    use arrow_schema::{DataType, Field};
    use std::sync::Arc;

    fn sample_batch() -> AnnotatedBatch {
        let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Float64, false)]));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(Float64Array::from(vec![1.5]))])
            .unwrap();
        let mut metadata = BatchMetadata::new();
        metadata.insert("method".into(), "add".into());
        metadata.insert("request_version".into(), "1".into());
        AnnotatedBatch::with_metadata(batch, metadata)
    }

    #[test]
    fn metadata_survives_header_rebuild() {
        let annotated = sample_batch();
        let mut out = Vec::new();
        write_batch_message(&mut out, &annotated).unwrap();

        // Strip the continuation marker and length prefix, then decode.
        assert_eq!(&out[..4], &CONTINUATION);
        let header_len = u32::from_le_bytes(out[4..8].try_into().unwrap()) as usize;
        let header = &out[8..8 + header_len];
        let body = out[8 + header_len..].to_vec();

        let (kind, body_len) = parse_header(header).unwrap();
        assert!(matches!(kind, HeaderKind::RecordBatch));
        assert!(body.len() >= body_len);

        let decoded = decode_batch_message(header, body[..body_len].to_vec(), &annotated.schema())
            .unwrap();
        assert_eq!(decoded.metadata, annotated.metadata);
        assert_eq!(decoded.batch, annotated.batch);
    }
}
