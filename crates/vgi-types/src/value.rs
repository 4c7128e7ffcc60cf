//! Dynamic scalar values and rows.
//!
//! Parameters, results, and header rows cross the codec boundary as
//! [`Row`]s of [`Value`]s. The runtime integer is `i64`, which is exactly
//! the 64-bit two's-complement wire form; floats pass through untouched so
//! NaN, infinities, and signed zeros survive round trips.

use std::collections::BTreeMap;

use crate::error::RpcError;

/// A single dynamically-typed scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Equality that also identifies NaNs bit-for-bit, for round-trip
    /// assertions where `NaN == NaN` must hold.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (a, b) => a == b,
        }
    }

    /// Convert a JSON scalar (a method default, for instance) into a
    /// wire value. Arrays and objects have no column representation.
    pub fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::Null => Some(Value::Null),
            serde_json::Value::Bool(v) => Some(Value::Bool(*v)),
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_i64() {
                    Some(Value::Int(v))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            serde_json::Value::String(v) => Some(Value::Str(v.clone())),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

/// An ordered name/value mapping: one row of a batch, a parameter set, or
/// a handler result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: BTreeMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// The field names present, for `ContractError` reporting.
    pub fn names(&self) -> Vec<&str> {
        self.values.keys().map(String::as_str).collect()
    }

    fn require(&self, name: &str) -> Result<&Value, RpcError> {
        self.values
            .get(name)
            .ok_or_else(|| RpcError::contract(format!("missing field `{name}`")))
    }

    fn mismatch(name: &str, want: &str, got: &Value) -> RpcError {
        RpcError::contract(format!(
            "field `{name}`: expected {want}, got {}",
            got.type_name()
        ))
    }

    /// Fetch a float, widening integers losslessly.
    pub fn get_f64(&self, name: &str) -> Result<f64, RpcError> {
        match self.require(name)? {
            Value::Float(v) => Ok(*v),
            Value::Int(v) => Ok(*v as f64),
            other => Err(Self::mismatch(name, "float", other)),
        }
    }

    pub fn get_i64(&self, name: &str) -> Result<i64, RpcError> {
        match self.require(name)? {
            Value::Int(v) => Ok(*v),
            other => Err(Self::mismatch(name, "int", other)),
        }
    }

    /// Fetch an integer narrowed to 32 bits, checking the range.
    pub fn get_i32(&self, name: &str) -> Result<i32, RpcError> {
        let v = self.get_i64(name)?;
        i32::try_from(v)
            .map_err(|_| RpcError::contract(format!("field `{name}`: {v} out of i32 range")))
    }

    pub fn get_str(&self, name: &str) -> Result<&str, RpcError> {
        match self.require(name)? {
            Value::Str(v) => Ok(v),
            other => Err(Self::mismatch(name, "str", other)),
        }
    }

    pub fn get_bytes(&self, name: &str) -> Result<&[u8], RpcError> {
        match self.require(name)? {
            Value::Bytes(v) => Ok(v),
            other => Err(Self::mismatch(name, "bytes", other)),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, RpcError> {
        match self.require(name)? {
            Value::Bool(v) => Ok(*v),
            other => Err(Self::mismatch(name, "bool", other)),
        }
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Row {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters_coerce_ints_to_floats_only() {
        let row = Row::new().with("a", 3i64).with("b", 4.5f64);
        assert_eq!(row.get_f64("a").unwrap(), 3.0);
        assert_eq!(row.get_f64("b").unwrap(), 4.5);
        assert!(row.get_i64("b").is_err());
    }

    #[test]
    fn i32_narrowing_checks_range() {
        let row = Row::new().with("big", i64::MAX).with("ok", 7i64);
        assert_eq!(row.get_i32("ok").unwrap(), 7);
        let err = row.get_i32("big").unwrap_err();
        assert!(err.to_string().contains("out of i32 range"));
    }

    #[test]
    fn missing_field_is_contract_error() {
        let row = Row::new();
        assert!(matches!(row.get_f64("x"), Err(RpcError::Contract(_))));
    }

    #[test]
    fn same_value_identifies_nan() {
        let a = Value::Float(f64::NAN);
        let b = Value::Float(f64::NAN);
        assert!(a != b);
        assert!(a.same_value(&b));
    }
}
