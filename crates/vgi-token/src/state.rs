//! Per-stream server state.
//!
//! Handlers keep their progress in a [`StreamState`]: a JSON-object-backed
//! map that a [`StateSerializer`] can persist into a token. Two reserved
//! keys carry the dynamic overrides a handler may set from `init`: the
//! effective stream mode and a replacement output schema. They serialize
//! with the rest of the state so overrides survive HTTP round trips.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};

use vgi_types::{RpcError, StreamMode};

const MODE_KEY: &str = "__vgi_mode__";
const OUTPUT_SCHEMA_KEY: &str = "__vgi_output_schema__";

/// Largest integer magnitude JSON numbers hold losslessly (2^53 - 1).
const SAFE_INT_MAX: i64 = 9_007_199_254_740_991;

/// Tag prefix the JSON serializer uses for integers beyond that range.
const BIGINT_PREFIX: &str = "__vgi_bigint__:";

/// The mutable state a stream handler threads between calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamState {
    entries: Map<String, Value>,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.entries.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.entries.get(key).and_then(Value::as_f64)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.entries.get(key).and_then(Value::as_bool)
    }

    /// Force this stream to behave as a producer or an exchange
    /// regardless of its registered input schema.
    pub fn set_mode_override(&mut self, mode: StreamMode) {
        self.entries
            .insert(MODE_KEY.to_owned(), Value::String(mode.as_str().to_owned()));
    }

    pub fn mode_override(&self) -> Option<StreamMode> {
        self.get_str(MODE_KEY).and_then(StreamMode::from_str)
    }

    /// Replace the registered output schema for the rest of the session.
    /// Takes the schema as its self-contained IPC bytes.
    pub fn set_output_schema_override(&mut self, schema_ipc: &[u8]) {
        self.entries.insert(
            OUTPUT_SCHEMA_KEY.to_owned(),
            Value::String(BASE64.encode(schema_ipc)),
        );
    }

    pub fn output_schema_override(&self) -> Option<Vec<u8>> {
        self.get_str(OUTPUT_SCHEMA_KEY)
            .and_then(|encoded| BASE64.decode(encoded).ok())
    }

    /// View of the state as a JSON value, for serializers.
    pub fn to_json(&self) -> Value {
        Value::Object(self.entries.clone())
    }

    /// Rebuild state from a serializer's JSON value.
    pub fn from_json(value: Value) -> Result<Self, RpcError> {
        match value {
            Value::Object(entries) => Ok(Self { entries }),
            other => Err(RpcError::protocol(format!(
                "stream state must be a JSON object, got {other}"
            ))),
        }
    }
}

/// Pluggable persistence for [`StreamState`].
pub trait StateSerializer: Send + Sync {
    fn serialize(&self, state: &StreamState) -> Result<Vec<u8>, RpcError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<StreamState, RpcError>;
}

/// The default serializer: compact JSON with 64-bit integers outside the
/// f64-safe range tagged as prefixed strings so they round-trip
/// losslessly through any JSON reader.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonStateSerializer;

fn tag_bigints(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                if v.unsigned_abs() > SAFE_INT_MAX as u64 {
                    return Value::String(format!("{BIGINT_PREFIX}{v}"));
                }
            } else if let Some(v) = n.as_u64() {
                if v > SAFE_INT_MAX as u64 {
                    return Value::String(format!("{BIGINT_PREFIX}{v}"));
                }
            }
            Value::Number(n)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(tag_bigints).collect()),
        Value::Object(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, tag_bigints(v)))
                .collect(),
        ),
        other => other,
    }
}

fn untag_bigints(value: Value) -> Value {
    match value {
        Value::String(s) => match s.strip_prefix(BIGINT_PREFIX) {
            Some(digits) => match digits.parse::<i64>() {
                Ok(v) => Value::Number(v.into()),
                Err(_) => match digits.parse::<u64>() {
                    Ok(v) => Value::Number(v.into()),
                    Err(_) => Value::String(s),
                },
            },
            None => Value::String(s),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(untag_bigints).collect()),
        Value::Object(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k, untag_bigints(v)))
                .collect(),
        ),
        other => other,
    }
}

impl StateSerializer for JsonStateSerializer {
    fn serialize(&self, state: &StreamState) -> Result<Vec<u8>, RpcError> {
        let tagged = tag_bigints(state.to_json());
        Ok(serde_json::to_vec(&tagged)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<StreamState, RpcError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| RpcError::protocol(format!("stream state is not valid JSON: {e}")))?;
        StreamState::from_json(untag_bigints(value))
    }
}
