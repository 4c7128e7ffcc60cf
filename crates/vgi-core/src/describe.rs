//! The `__describe__` batch.
//!
//! One row per method, sorted by name, with self-contained schema blobs:
//! clients deserialize each blob independently rather than relying on any
//! structural relationship between rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow_array::builder::{BinaryBuilder, BooleanBuilder, StringBuilder};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};

use vgi_ipc::{schema_ipc_bytes, AnnotatedBatch, BatchMetadata};
use vgi_types::{keys, RpcError, Value};
use vgi_wire::batch_rows;

use crate::method::Method;
use crate::protocol::Protocol;

/// The fixed describe batch schema.
pub fn describe_schema() -> SchemaRef {
    SchemaRef::new(Schema::new(vec![
        Field::new("name", DataType::Utf8, false),
        Field::new("method_type", DataType::Utf8, false),
        Field::new("doc", DataType::Utf8, true),
        Field::new("has_return", DataType::Boolean, false),
        Field::new("params_schema_ipc", DataType::Binary, false),
        Field::new("result_schema_ipc", DataType::Binary, false),
        Field::new("param_types_json", DataType::Utf8, true),
        Field::new("param_defaults_json", DataType::Utf8, true),
        Field::new("has_header", DataType::Boolean, false),
        Field::new("header_schema_ipc", DataType::Binary, true),
    ]))
}

fn json_or_null(map: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    if map.is_empty() {
        None
    } else {
        Some(serde_json::Value::Object(map.clone()).to_string())
    }
}

/// Render the protocol as its describe batch.
pub fn build_describe_batch(
    protocol: &Protocol,
    server_id: &str,
) -> Result<AnnotatedBatch, RpcError> {
    let mut names = StringBuilder::new();
    let mut method_types = StringBuilder::new();
    let mut docs = StringBuilder::new();
    let mut has_returns = BooleanBuilder::new();
    let mut params_blobs = BinaryBuilder::new();
    let mut result_blobs = BinaryBuilder::new();
    let mut param_types = StringBuilder::new();
    let mut param_defaults = StringBuilder::new();
    let mut has_headers = BooleanBuilder::new();
    let mut header_blobs = BinaryBuilder::new();

    for (name, method) in protocol.iter() {
        names.append_value(name);
        method_types.append_value(method.type_str());
        docs.append_option(method.doc());
        params_blobs.append_value(schema_ipc_bytes(method.params_schema())?);
        param_types.append_option(json_or_null(method.param_types()));
        param_defaults.append_option(json_or_null(method.defaults()));

        match method {
            Method::Unary(def) => {
                has_returns.append_value(!def.result.fields().is_empty());
                result_blobs.append_value(schema_ipc_bytes(&def.result)?);
                has_headers.append_value(false);
                header_blobs.append_null();
            }
            Method::Producer(def) | Method::Exchange(def) => {
                has_returns.append_value(false);
                result_blobs.append_value(schema_ipc_bytes(&def.output)?);
                has_headers.append_value(def.header.is_some());
                match &def.header {
                    Some(header) => header_blobs.append_value(schema_ipc_bytes(header)?),
                    None => header_blobs.append_null(),
                }
            }
        }
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(names.finish()),
        Arc::new(method_types.finish()),
        Arc::new(docs.finish()),
        Arc::new(has_returns.finish()),
        Arc::new(params_blobs.finish()),
        Arc::new(result_blobs.finish()),
        Arc::new(param_types.finish()),
        Arc::new(param_defaults.finish()),
        Arc::new(has_headers.finish()),
        Arc::new(header_blobs.finish()),
    ];
    let batch = RecordBatch::try_new(describe_schema(), columns)
        .map_err(|e| RpcError::protocol(format!("assemble describe batch: {e}")))?;

    let mut metadata = BatchMetadata::new();
    metadata.insert(keys::PROTOCOL_NAME.to_owned(), protocol.name().to_owned());
    metadata.insert(
        keys::REQUEST_VERSION.to_owned(),
        keys::REQUEST_VERSION_VALUE.to_owned(),
    );
    metadata.insert(
        keys::DESCRIBE_VERSION.to_owned(),
        keys::DESCRIBE_VERSION_VALUE.to_owned(),
    );
    metadata.insert(keys::SERVER_ID.to_owned(), server_id.to_owned());
    Ok(AnnotatedBatch::with_metadata(batch, metadata))
}

/// What a client learns about one method from describe.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub method_type: String,
    pub doc: Option<String>,
    pub has_return: bool,
    pub params_schema: SchemaRef,
    /// Result schema for unary methods, output schema for stream methods.
    pub result_schema: SchemaRef,
    pub param_types: Option<serde_json::Value>,
    pub defaults: BTreeMap<String, serde_json::Value>,
    pub has_header: bool,
    pub header_schema: Option<SchemaRef>,
}

impl MethodInfo {
    pub fn is_stream(&self) -> bool {
        self.method_type == "stream"
    }
}

/// Parsed describe response, cached by clients.
#[derive(Debug, Clone)]
pub struct DescribeInfo {
    pub protocol_name: String,
    pub server_id: Option<String>,
    pub methods: BTreeMap<String, MethodInfo>,
}

impl DescribeInfo {
    /// The declared request schema for `method`, folding its defaults
    /// into `params`. `None` when the server does not advertise the
    /// method (callers fall back to value-based inference).
    pub fn resolve_request(&self, method: &str, params: &mut vgi_types::Row) -> Option<SchemaRef> {
        let info = self.methods.get(method)?;
        for (name, default) in &info.defaults {
            if !params.contains(name) {
                if let Some(value) = Value::from_json(default) {
                    params.set(name.clone(), value);
                }
            }
        }
        Some(info.params_schema.clone())
    }

    pub fn from_batch(annotated: &AnnotatedBatch) -> Result<Self, RpcError> {
        let protocol_name = annotated
            .meta(keys::PROTOCOL_NAME)
            .unwrap_or_default()
            .to_owned();
        let server_id = annotated.meta(keys::SERVER_ID).map(str::to_owned);

        let mut methods = BTreeMap::new();
        for row in batch_rows(&annotated.batch)? {
            let name = row.get_str("name")?.to_owned();
            let doc = match row.get("doc") {
                Some(Value::Str(doc)) => Some(doc.clone()),
                _ => None,
            };
            let params_schema = vgi_ipc::decode_schema_ipc(row.get_bytes("params_schema_ipc")?)?;
            let result_schema = vgi_ipc::decode_schema_ipc(row.get_bytes("result_schema_ipc")?)?;
            let header_schema = match row.get("header_schema_ipc") {
                Some(Value::Bytes(blob)) => Some(vgi_ipc::decode_schema_ipc(blob)?),
                _ => None,
            };
            let param_types = match row.get("param_types_json") {
                Some(Value::Str(raw)) => Some(serde_json::from_str(raw)?),
                _ => None,
            };
            let defaults = match row.get("param_defaults_json") {
                Some(Value::Str(raw)) => match serde_json::from_str(raw)? {
                    serde_json::Value::Object(map) => map.into_iter().collect(),
                    _ => BTreeMap::new(),
                },
                _ => BTreeMap::new(),
            };
            methods.insert(
                name,
                MethodInfo {
                    method_type: row.get_str("method_type")?.to_owned(),
                    doc,
                    has_return: row.get_bool("has_return")?,
                    params_schema,
                    result_schema,
                    param_types,
                    defaults,
                    has_header: row.get_bool("has_header")?,
                    header_schema,
                },
            );
        }

        Ok(Self {
            protocol_name,
            server_id,
            methods,
        })
    }
}
