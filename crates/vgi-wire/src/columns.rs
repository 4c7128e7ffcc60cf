//! Row/column conversions.
//!
//! Numeric semantics: floats pass through unchanged; integer columns
//! accept any runtime integer that fits the target width, and wider wire
//! integers surface as `i64` (the runtime integer is already the 64-bit
//! wire form).

use std::sync::Arc;

use arrow_array::{
    Array, ArrayRef, BinaryArray, BooleanArray, Float32Array, Float64Array, Int16Array,
    Int32Array, Int64Array, Int8Array, LargeBinaryArray, LargeStringArray, RecordBatch,
    RecordBatchOptions, StringArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};

use vgi_types::{Row, RpcError, Value};

fn contract(msg: String) -> RpcError {
    RpcError::Contract(msg)
}

fn narrow_int(name: &str, v: i64, lo: i64, hi: i64) -> Result<i64, RpcError> {
    if v < lo || v > hi {
        return Err(contract(format!(
            "field `{name}`: integer {v} out of range [{lo}, {hi}]"
        )));
    }
    Ok(v)
}

fn int_of(name: &str, value: &Value) -> Result<i64, RpcError> {
    match value {
        Value::Int(v) => Ok(*v),
        other => Err(contract(format!(
            "field `{name}`: expected int, got {}",
            other.type_name()
        ))),
    }
}

/// Build a batch shaped to `schema` from rows of named values.
///
/// Missing or null values for a non-nullable field fail with a
/// `ContractError` that lists the keys actually received; keys absent from
/// the schema are silently ignored.
pub fn build_batch(schema: &SchemaRef, rows: &[Row]) -> Result<RecordBatch, RpcError> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        columns.push(build_column(field, rows)?);
    }
    let options = RecordBatchOptions::new().with_row_count(Some(rows.len()));
    RecordBatch::try_new_with_options(schema.clone(), columns, &options)
        .map_err(|e| contract(format!("assemble batch: {e}")))
}

fn build_column(field: &Field, rows: &[Row]) -> Result<ArrayRef, RpcError> {
    let name = field.name().as_str();
    let mut cells: Vec<Option<&Value>> = Vec::with_capacity(rows.len());
    for row in rows {
        let value = row.get(name).filter(|v| !v.is_null());
        if value.is_none() && !field.is_nullable() {
            return Err(contract(format!(
                "missing non-nullable field `{name}` (received: {:?})",
                row.names()
            )));
        }
        cells.push(value);
    }

    macro_rules! int_column {
        ($array:ty, $prim:ty, $lo:expr, $hi:expr) => {{
            let mut out: Vec<Option<$prim>> = Vec::with_capacity(cells.len());
            for cell in &cells {
                out.push(match cell {
                    Some(v) => Some(narrow_int(name, int_of(name, v)?, $lo, $hi)? as $prim),
                    None => None,
                });
            }
            Ok(Arc::new(<$array>::from(out)) as ArrayRef)
        }};
    }

    match field.data_type() {
        DataType::Int8 => int_column!(Int8Array, i8, i8::MIN as i64, i8::MAX as i64),
        DataType::Int16 => int_column!(Int16Array, i16, i16::MIN as i64, i16::MAX as i64),
        DataType::Int32 => int_column!(Int32Array, i32, i32::MIN as i64, i32::MAX as i64),
        DataType::Int64 => int_column!(Int64Array, i64, i64::MIN, i64::MAX),
        DataType::UInt8 => int_column!(UInt8Array, u8, 0, u8::MAX as i64),
        DataType::UInt16 => int_column!(UInt16Array, u16, 0, u16::MAX as i64),
        DataType::UInt32 => int_column!(UInt32Array, u32, 0, u32::MAX as i64),
        DataType::UInt64 => int_column!(UInt64Array, u64, 0, i64::MAX),
        DataType::Float64 => {
            let mut out: Vec<Option<f64>> = Vec::with_capacity(cells.len());
            for cell in &cells {
                out.push(match cell {
                    Some(Value::Float(v)) => Some(*v),
                    Some(Value::Int(v)) => Some(*v as f64),
                    Some(other) => {
                        return Err(contract(format!(
                            "field `{name}`: expected float, got {}",
                            other.type_name()
                        )))
                    }
                    None => None,
                });
            }
            Ok(Arc::new(Float64Array::from(out)) as ArrayRef)
        }
        DataType::Float32 => {
            let mut out: Vec<Option<f32>> = Vec::with_capacity(cells.len());
            for cell in &cells {
                out.push(match cell {
                    Some(Value::Float(v)) => Some(*v as f32),
                    Some(Value::Int(v)) => Some(*v as f32),
                    Some(other) => {
                        return Err(contract(format!(
                            "field `{name}`: expected float, got {}",
                            other.type_name()
                        )))
                    }
                    None => None,
                });
            }
            Ok(Arc::new(Float32Array::from(out)) as ArrayRef)
        }
        DataType::Utf8 | DataType::LargeUtf8 => {
            let mut out: Vec<Option<String>> = Vec::with_capacity(cells.len());
            for cell in &cells {
                out.push(match cell {
                    Some(Value::Str(v)) => Some(v.clone()),
                    Some(other) => {
                        return Err(contract(format!(
                            "field `{name}`: expected str, got {}",
                            other.type_name()
                        )))
                    }
                    None => None,
                });
            }
            if matches!(field.data_type(), DataType::Utf8) {
                Ok(Arc::new(StringArray::from(out)) as ArrayRef)
            } else {
                Ok(Arc::new(LargeStringArray::from(out)) as ArrayRef)
            }
        }
        DataType::Binary | DataType::LargeBinary => {
            let mut out: Vec<Option<&[u8]>> = Vec::with_capacity(cells.len());
            for cell in &cells {
                out.push(match cell {
                    Some(Value::Bytes(v)) => Some(v.as_slice()),
                    Some(other) => {
                        return Err(contract(format!(
                            "field `{name}`: expected bytes, got {}",
                            other.type_name()
                        )))
                    }
                    None => None,
                });
            }
            if matches!(field.data_type(), DataType::Binary) {
                Ok(Arc::new(BinaryArray::from_opt_vec(out)) as ArrayRef)
            } else {
                Ok(Arc::new(LargeBinaryArray::from_opt_vec(out)) as ArrayRef)
            }
        }
        DataType::Boolean => {
            let mut out: Vec<Option<bool>> = Vec::with_capacity(cells.len());
            for cell in &cells {
                out.push(match cell {
                    Some(Value::Bool(v)) => Some(*v),
                    Some(other) => {
                        return Err(contract(format!(
                            "field `{name}`: expected bool, got {}",
                            other.type_name()
                        )))
                    }
                    None => None,
                });
            }
            Ok(Arc::new(BooleanArray::from(out)) as ArrayRef)
        }
        other => Err(contract(format!(
            "field `{name}`: unsupported column type {other}"
        ))),
    }
}

/// Extract every row of `batch` as a [`Row`] of dynamic values.
pub fn batch_rows(batch: &RecordBatch) -> Result<Vec<Row>, RpcError> {
    let schema = batch.schema();
    let mut rows = Vec::with_capacity(batch.num_rows());
    for idx in 0..batch.num_rows() {
        let mut row = Row::new();
        for (col, field) in batch.columns().iter().zip(schema.fields()) {
            row.set(field.name().clone(), cell_value(field.name(), col, idx)?);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn cell_value(name: &str, col: &ArrayRef, idx: usize) -> Result<Value, RpcError> {
    if col.is_null(idx) {
        return Ok(Value::Null);
    }

    macro_rules! read_int {
        ($array:ty) => {{
            let arr = col.as_any().downcast_ref::<$array>().expect("typed column");
            Ok(Value::Int(arr.value(idx) as i64))
        }};
    }

    match col.data_type() {
        DataType::Int8 => read_int!(Int8Array),
        DataType::Int16 => read_int!(Int16Array),
        DataType::Int32 => read_int!(Int32Array),
        DataType::Int64 => read_int!(Int64Array),
        DataType::UInt8 => read_int!(UInt8Array),
        DataType::UInt16 => read_int!(UInt16Array),
        DataType::UInt32 => read_int!(UInt32Array),
        DataType::UInt64 => {
            let arr = col
                .as_any()
                .downcast_ref::<UInt64Array>()
                .expect("typed column");
            let v = arr.value(idx);
            i64::try_from(v).map(Value::Int).map_err(|_| {
                contract(format!("field `{name}`: uint64 value {v} exceeds i64 range"))
            })
        }
        DataType::Float32 => {
            let arr = col
                .as_any()
                .downcast_ref::<Float32Array>()
                .expect("typed column");
            Ok(Value::Float(arr.value(idx) as f64))
        }
        DataType::Float64 => {
            let arr = col
                .as_any()
                .downcast_ref::<Float64Array>()
                .expect("typed column");
            Ok(Value::Float(arr.value(idx)))
        }
        DataType::Utf8 => {
            let arr = col
                .as_any()
                .downcast_ref::<StringArray>()
                .expect("typed column");
            Ok(Value::Str(arr.value(idx).to_owned()))
        }
        DataType::LargeUtf8 => {
            let arr = col
                .as_any()
                .downcast_ref::<LargeStringArray>()
                .expect("typed column");
            Ok(Value::Str(arr.value(idx).to_owned()))
        }
        DataType::Binary => {
            let arr = col
                .as_any()
                .downcast_ref::<BinaryArray>()
                .expect("typed column");
            Ok(Value::Bytes(arr.value(idx).to_vec()))
        }
        DataType::LargeBinary => {
            let arr = col
                .as_any()
                .downcast_ref::<LargeBinaryArray>()
                .expect("typed column");
            Ok(Value::Bytes(arr.value(idx).to_vec()))
        }
        DataType::Boolean => {
            let arr = col
                .as_any()
                .downcast_ref::<BooleanArray>()
                .expect("typed column");
            Ok(Value::Bool(arr.value(idx)))
        }
        DataType::Null => Ok(Value::Null),
        other => Err(contract(format!(
            "field `{name}`: unsupported column type {other}"
        ))),
    }
}

/// Infer an input schema from the first row's keys and its concrete
/// non-null sample values. A null sample defaults to string — a known
/// edge a strict server rejects with `ContractError`.
pub fn infer_schema(rows: &[Row]) -> SchemaRef {
    let Some(first) = rows.first() else {
        return SchemaRef::new(Schema::empty());
    };
    let fields: Vec<Field> = first
        .iter()
        .map(|(name, value)| {
            let data_type = match value {
                Value::Int(_) => DataType::Int64,
                Value::Float(_) => DataType::Float64,
                Value::Bool(_) => DataType::Boolean,
                Value::Bytes(_) => DataType::Binary,
                Value::Str(_) | Value::Null => DataType::Utf8,
            };
            Field::new(name, data_type, true)
        })
        .collect();
    SchemaRef::new(Schema::new(fields))
}

/// The schema-lock comparison: field count, names, and order.
pub fn schema_fields_match(a: &SchemaRef, b: &SchemaRef) -> bool {
    a.fields().len() == b.fields().len()
        && a.fields()
            .iter()
            .zip(b.fields())
            .all(|(fa, fb)| fa.name() == fb.name())
}
