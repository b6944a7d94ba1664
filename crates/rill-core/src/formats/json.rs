//! JSON row format.
//!
//! Decodes one JSON object per payload (or per line for multi-row
//! payloads) into Arrow columns, and encodes blocks back into
//! newline-delimited JSON objects.

use std::sync::Arc;

use arrow_array::builder::{
    BooleanBuilder, Float32Builder, Float64Builder, Int16Builder, Int32Builder, Int64Builder,
    Int8Builder, StringBuilder, UInt16Builder, UInt32Builder, UInt64Builder, UInt8Builder,
};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    Int8Array, RecordBatch, StringArray, UInt16Array, UInt32Array, UInt64Array, UInt8Array,
};
use arrow_schema::{DataType, Field, SchemaRef};
use serde_json::{Map, Number, Value};

use super::{Format, RecordDeserializer, RecordSerializer, SerdeError};

type JsonRow = Map<String, Value>;

/// JSON decoder: one object per row, fields matched by name.
///
/// Supported Arrow types: booleans, all integer widths, floats, and Utf8.
/// A `null` or absent field is accepted only for nullable columns; any
/// non-string scalar maps into a Utf8 column via its JSON rendering.
#[derive(Debug, Clone, Default)]
pub struct JsonDeserializer;

impl JsonDeserializer {
    /// Creates a new JSON deserializer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn parse_rows(data: &[u8]) -> Result<Vec<JsonRow>, SerdeError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| SerdeError::MalformedInput(format!("payload is not UTF-8: {e}")))?;
        let mut rows = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line)?;
            match value {
                Value::Object(obj) => rows.push(obj),
                other => {
                    return Err(SerdeError::MalformedInput(format!(
                        "expected a JSON object per row, got {other}"
                    )))
                }
            }
        }
        if rows.is_empty() {
            return Err(SerdeError::MalformedInput("empty JSON payload".into()));
        }
        Ok(rows)
    }
}

impl RecordDeserializer for JsonDeserializer {
    fn deserialize(&self, data: &[u8], schema: &SchemaRef) -> Result<RecordBatch, SerdeError> {
        let rows = Self::parse_rows(data)?;
        decode_rows(&rows, schema)
    }

    fn format(&self) -> Format {
        Format::Json
    }
}

/// Builds one Arrow column per schema field from decoded JSON rows.
fn decode_rows(rows: &[JsonRow], schema: &SchemaRef) -> Result<RecordBatch, SerdeError> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        columns.push(decode_column(field, rows)?);
    }
    RecordBatch::try_new(schema.clone(), columns)
        .map_err(|e| SerdeError::MalformedInput(format!("failed to build block: {e}")))
}

macro_rules! signed_column {
    ($builder:ty, $native:ty, $field:expr, $rows:expr) => {{
        let mut builder = <$builder>::with_capacity($rows.len());
        for row in $rows {
            match field_value($field, row)? {
                None => builder.append_null(),
                Some(Value::Number(n)) => {
                    let wide = n.as_i64().ok_or_else(|| type_mismatch($field, n))?;
                    let narrow: $native =
                        wide.try_into().map_err(|_| type_mismatch($field, n))?;
                    builder.append_value(narrow);
                }
                Some(other) => return Err(type_mismatch($field, other)),
            }
        }
        Arc::new(builder.finish()) as ArrayRef
    }};
}

macro_rules! unsigned_column {
    ($builder:ty, $native:ty, $field:expr, $rows:expr) => {{
        let mut builder = <$builder>::with_capacity($rows.len());
        for row in $rows {
            match field_value($field, row)? {
                None => builder.append_null(),
                Some(Value::Number(n)) => {
                    let wide = n.as_u64().ok_or_else(|| type_mismatch($field, n))?;
                    let narrow: $native =
                        wide.try_into().map_err(|_| type_mismatch($field, n))?;
                    builder.append_value(narrow);
                }
                Some(other) => return Err(type_mismatch($field, other)),
            }
        }
        Arc::new(builder.finish()) as ArrayRef
    }};
}

fn decode_column(field: &Field, rows: &[JsonRow]) -> Result<ArrayRef, SerdeError> {
    let array = match field.data_type() {
        DataType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for row in rows {
                match field_value(field, row)? {
                    None => builder.append_null(),
                    Some(Value::Bool(b)) => builder.append_value(*b),
                    Some(other) => return Err(type_mismatch(field, other)),
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
        DataType::Int8 => signed_column!(Int8Builder, i8, field, rows),
        DataType::Int16 => signed_column!(Int16Builder, i16, field, rows),
        DataType::Int32 => signed_column!(Int32Builder, i32, field, rows),
        DataType::Int64 => signed_column!(Int64Builder, i64, field, rows),
        DataType::UInt8 => unsigned_column!(UInt8Builder, u8, field, rows),
        DataType::UInt16 => unsigned_column!(UInt16Builder, u16, field, rows),
        DataType::UInt32 => unsigned_column!(UInt32Builder, u32, field, rows),
        DataType::UInt64 => unsigned_column!(UInt64Builder, u64, field, rows),
        DataType::Float32 => {
            let mut builder = Float32Builder::with_capacity(rows.len());
            for row in rows {
                match field_value(field, row)? {
                    None => builder.append_null(),
                    Some(Value::Number(n)) => {
                        let wide = n.as_f64().ok_or_else(|| type_mismatch(field, n))?;
                        #[allow(clippy::cast_possible_truncation)]
                        builder.append_value(wide as f32);
                    }
                    Some(other) => return Err(type_mismatch(field, other)),
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for row in rows {
                match field_value(field, row)? {
                    None => builder.append_null(),
                    Some(Value::Number(n)) => {
                        builder.append_value(n.as_f64().ok_or_else(|| type_mismatch(field, n))?);
                    }
                    Some(other) => return Err(type_mismatch(field, other)),
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
        DataType::Utf8 => {
            let mut builder = StringBuilder::new();
            for row in rows {
                match field_value(field, row)? {
                    None => builder.append_null(),
                    Some(Value::String(s)) => builder.append_value(s),
                    // Scalars are stringified into Utf8 columns.
                    Some(other) => builder.append_value(other.to_string()),
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
        other => {
            return Err(SerdeError::UnsupportedFormat(format!(
                "JSON decoding is not supported for Arrow type {other}"
            )))
        }
    };
    Ok(array)
}

/// Resolves a field in a row: `Ok(None)` is an accepted null.
fn field_value<'a>(field: &Field, row: &'a JsonRow) -> Result<Option<&'a Value>, SerdeError> {
    match row.get(field.name()) {
        None | Some(Value::Null) => {
            if field.is_nullable() {
                Ok(None)
            } else {
                Err(SerdeError::MissingField(field.name().clone()))
            }
        }
        Some(value) => Ok(Some(value)),
    }
}

fn type_mismatch(field: &Field, value: impl std::fmt::Display) -> SerdeError {
    SerdeError::TypeMismatch {
        field: field.name().clone(),
        expected: field.data_type().to_string(),
        message: format!("got {value}"),
    }
}

/// JSON encoder: one object per row, newline-delimited in batch form.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    /// Creates a new JSON serializer.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl RecordSerializer for JsonSerializer {
    fn serialize(&self, batch: &RecordBatch) -> Result<Vec<Vec<u8>>, SerdeError> {
        let schema = batch.schema();
        let mut rows = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let mut object = Map::with_capacity(schema.fields().len());
            for (index, field) in schema.fields().iter().enumerate() {
                object.insert(field.name().clone(), encode_value(batch.column(index), row)?);
            }
            rows.push(serde_json::to_vec(&Value::Object(object))?);
        }
        Ok(rows)
    }

    fn serialize_batch(&self, batch: &RecordBatch) -> Result<Vec<u8>, SerdeError> {
        let rows = self.serialize(batch)?;
        let total: usize = rows.iter().map(|r| r.len() + 1).sum();
        let mut buf = Vec::with_capacity(total);
        for row in &rows {
            buf.extend_from_slice(row);
            buf.push(b'\n');
        }
        Ok(buf)
    }

    fn format(&self) -> Format {
        Format::Json
    }
}

macro_rules! encode_int {
    ($array_ty:ty, $column:expr, $row:expr) => {
        Value::Number(Number::from(typed::<$array_ty>($column)?.value($row)))
    };
}

fn encode_value(column: &ArrayRef, row: usize) -> Result<Value, SerdeError> {
    if column.is_null(row) {
        return Ok(Value::Null);
    }
    let value = match column.data_type() {
        DataType::Boolean => Value::Bool(typed::<BooleanArray>(column)?.value(row)),
        DataType::Int8 => encode_int!(Int8Array, column, row),
        DataType::Int16 => encode_int!(Int16Array, column, row),
        DataType::Int32 => encode_int!(Int32Array, column, row),
        DataType::Int64 => encode_int!(Int64Array, column, row),
        DataType::UInt8 => encode_int!(UInt8Array, column, row),
        DataType::UInt16 => encode_int!(UInt16Array, column, row),
        DataType::UInt32 => encode_int!(UInt32Array, column, row),
        DataType::UInt64 => encode_int!(UInt64Array, column, row),
        DataType::Float32 => {
            let v = f64::from(typed::<Float32Array>(column)?.value(row));
            Number::from_f64(v).map_or(Value::Null, Value::Number)
        }
        DataType::Float64 => {
            let v = typed::<Float64Array>(column)?.value(row);
            Number::from_f64(v).map_or(Value::Null, Value::Number)
        }
        DataType::Utf8 => Value::String(typed::<StringArray>(column)?.value(row).to_string()),
        other => {
            return Err(SerdeError::UnsupportedFormat(format!(
                "JSON encoding is not supported for Arrow type {other}"
            )))
        }
    };
    Ok(value)
}

fn typed<T: 'static>(column: &ArrayRef) -> Result<&T, SerdeError> {
    column
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| SerdeError::MalformedInput("column type does not match its array".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::Schema;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("score", DataType::Float64, true),
            Field::new("active", DataType::Boolean, true),
        ]))
    }

    #[test]
    fn test_deserialize_single_object() {
        let schema = test_schema();
        let deserializer = JsonDeserializer::new();
        let batch = deserializer
            .deserialize(
                br#"{"id": 1, "name": "alpha", "score": 0.5, "active": true}"#,
                &schema,
            )
            .unwrap();
        assert_eq!(batch.num_rows(), 1);
        assert_eq!(batch.num_columns(), 4);
    }

    #[test]
    fn test_deserialize_newline_delimited() {
        let schema = test_schema();
        let payload = b"{\"id\": 1}\n{\"id\": 2, \"name\": \"b\"}\n";
        let batch = JsonDeserializer::new().deserialize(payload, &schema).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.column(1).null_count(), 1);
    }

    #[test]
    fn test_deserialize_missing_required() {
        let schema = test_schema();
        let err = JsonDeserializer::new()
            .deserialize(br#"{"name": "x"}"#, &schema)
            .unwrap_err();
        assert!(matches!(err, SerdeError::MissingField(_)));
    }

    #[test]
    fn test_deserialize_type_mismatch() {
        let schema = test_schema();
        let err = JsonDeserializer::new()
            .deserialize(br#"{"id": "not a number"}"#, &schema)
            .unwrap_err();
        assert!(matches!(err, SerdeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_deserialize_not_an_object() {
        let schema = test_schema();
        let err = JsonDeserializer::new()
            .deserialize(b"[1, 2, 3]", &schema)
            .unwrap_err();
        assert!(matches!(err, SerdeError::MalformedInput(_)));
    }

    #[test]
    fn test_deserialize_integer_overflow() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int8, false)]));
        let err = JsonDeserializer::new()
            .deserialize(br#"{"v": 4000}"#, &schema)
            .unwrap_err();
        assert!(matches!(err, SerdeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_deserialize_unsigned() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::UInt32, false)]));
        let batch = JsonDeserializer::new()
            .deserialize(br#"{"v": 42}"#, &schema)
            .unwrap();
        assert_eq!(batch.num_rows(), 1);
        let err = JsonDeserializer::new()
            .deserialize(br#"{"v": -1}"#, &schema)
            .unwrap_err();
        assert!(matches!(err, SerdeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_scalar_coerced_into_utf8() {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Utf8, false)]));
        let batch = JsonDeserializer::new()
            .deserialize(br#"{"v": 17}"#, &schema)
            .unwrap();
        let column = batch.column(0).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(column.value(0), "17");
    }

    #[test]
    fn test_serialize_round_trip() {
        let schema = test_schema();
        let deserializer = JsonDeserializer::new();
        let batch = deserializer
            .deserialize(br#"{"id": 7, "name": "x", "score": 1.25, "active": false}"#, &schema)
            .unwrap();

        let rows = JsonSerializer::new().serialize(&batch).unwrap();
        assert_eq!(rows.len(), 1);
        let round: Value = serde_json::from_slice(&rows[0]).unwrap();
        assert_eq!(round["id"], Value::from(7));
        assert_eq!(round["name"], Value::from("x"));
        assert_eq!(round["active"], Value::from(false));
    }

    #[test]
    fn test_serialize_null_fields() {
        let schema = test_schema();
        let batch = JsonDeserializer::new()
            .deserialize(br#"{"id": 1}"#, &schema)
            .unwrap();
        let rows = JsonSerializer::new().serialize(&batch).unwrap();
        let round: Value = serde_json::from_slice(&rows[0]).unwrap();
        assert_eq!(round["name"], Value::Null);
    }

    #[test]
    fn test_serialize_batch_is_newline_delimited() {
        let schema = test_schema();
        let batch = JsonDeserializer::new()
            .deserialize(b"{\"id\": 1}\n{\"id\": 2}", &schema)
            .unwrap();
        let payload = JsonSerializer::new().serialize_batch(&batch).unwrap();
        assert_eq!(payload.iter().filter(|b| **b == b'\n').count(), 2);
    }

    #[test]
    fn test_deserialize_batch_concatenates() {
        let schema = test_schema();
        let payloads: Vec<&[u8]> = vec![br#"{"id": 1}"#, br#"{"id": 2}"#, br#"{"id": 3}"#];
        let batch = JsonDeserializer::new()
            .deserialize_batch(&payloads, &schema)
            .unwrap();
        assert_eq!(batch.num_rows(), 3);
    }
}
