//! Raw pass-through format.
//!
//! Each payload becomes one row in a single-string-column block; the
//! schema must therefore have exactly one `Utf8` column.

use std::sync::Arc;

use arrow_array::{Array, RecordBatch, StringArray};
use arrow_schema::{DataType, SchemaRef};

use super::{Format, RecordDeserializer, RecordSerializer, SerdeError};

fn single_utf8_column(schema: &SchemaRef) -> Result<(), SerdeError> {
    if schema.fields().len() != 1 || schema.field(0).data_type() != &DataType::Utf8 {
        return Err(SerdeError::UnsupportedFormat(
            "raw format requires a single Utf8 column".into(),
        ));
    }
    Ok(())
}

/// Decoder that stores each payload verbatim.
#[derive(Debug, Clone, Default)]
pub struct RawDeserializer;

impl RawDeserializer {
    /// Creates a new raw decoder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl RecordDeserializer for RawDeserializer {
    fn deserialize(&self, data: &[u8], schema: &SchemaRef) -> Result<RecordBatch, SerdeError> {
        single_utf8_column(schema)?;
        let text = std::str::from_utf8(data)
            .map_err(|e| SerdeError::MalformedInput(format!("payload is not UTF-8: {e}")))?;
        let column = StringArray::from(vec![text]);
        RecordBatch::try_new(schema.clone(), vec![Arc::new(column)])
            .map_err(|e| SerdeError::MalformedInput(format!("failed to build block: {e}")))
    }

    fn format(&self) -> Format {
        Format::Raw
    }
}

/// Encoder that emits the single string column verbatim.
#[derive(Debug, Clone, Default)]
pub struct RawSerializer;

impl RawSerializer {
    /// Creates a new raw encoder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl RecordSerializer for RawSerializer {
    fn serialize(&self, batch: &RecordBatch) -> Result<Vec<Vec<u8>>, SerdeError> {
        single_utf8_column(&batch.schema())?;
        let column = batch
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .ok_or_else(|| SerdeError::MalformedInput("column is not a StringArray".into()))?;
        let mut rows = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            if column.is_null(row) {
                rows.push(Vec::new());
            } else {
                rows.push(column.value(row).as_bytes().to_vec());
            }
        }
        Ok(rows)
    }

    fn format(&self) -> Format {
        Format::Raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::{Field, Schema};

    fn raw_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new(
            "payload",
            DataType::Utf8,
            false,
        )]))
    }

    #[test]
    fn test_round_trip() {
        let schema = raw_schema();
        let batch = RawDeserializer::new()
            .deserialize(b"anything at all", &schema)
            .unwrap();
        assert_eq!(batch.num_rows(), 1);

        let rows = RawSerializer::new().serialize(&batch).unwrap();
        assert_eq!(rows[0], b"anything at all");
    }

    #[test]
    fn test_schema_shape_enforced() {
        let wide = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Utf8, false),
            Field::new("b", DataType::Utf8, false),
        ]));
        let err = RawDeserializer::new().deserialize(b"x", &wide).unwrap_err();
        assert!(matches!(err, SerdeError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_non_utf8_rejected() {
        let err = RawDeserializer::new()
            .deserialize(&[0xff, 0xfe], &raw_schema())
            .unwrap_err();
        assert!(matches!(err, SerdeError::MalformedInput(_)));
    }
}
