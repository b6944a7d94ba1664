//! CSV row format.
//!
//! One CSV record per line, fields mapped to schema columns by position.

use std::sync::Arc;

use arrow_array::builder::{BooleanBuilder, Float64Builder, Int64Builder, StringBuilder};
use arrow_array::{ArrayRef, RecordBatch};
use arrow_cast::display::{ArrayFormatter, FormatOptions};
use arrow_schema::{DataType, Field, SchemaRef};

use super::{Format, RecordDeserializer, RecordSerializer, SerdeError};

/// CSV decoder with positional field mapping.
///
/// Supported Arrow types: Int64, Float64, Boolean, Utf8. An empty field
/// decodes as null for nullable columns.
#[derive(Debug, Clone)]
pub struct CsvDeserializer {
    delimiter: char,
}

impl CsvDeserializer {
    /// Creates a decoder with the `,` delimiter.
    #[must_use]
    pub fn new() -> Self {
        Self { delimiter: ',' }
    }

    /// Creates a decoder with a custom delimiter.
    #[must_use]
    pub fn with_delimiter(delimiter: char) -> Self {
        Self { delimiter }
    }

    /// Splits one record into fields, honoring double-quoted values.
    fn split_record<'a>(&self, line: &'a str) -> Vec<&'a str> {
        let mut fields = Vec::new();
        let mut start = 0;
        let mut quoted = false;
        for (offset, ch) in line.char_indices() {
            if ch == '"' {
                quoted = !quoted;
            } else if ch == self.delimiter && !quoted {
                fields.push(clean_field(&line[start..offset]));
                start = offset + ch.len_utf8();
            }
        }
        fields.push(clean_field(&line[start..]));
        fields
    }
}

fn clean_field(raw: &str) -> &str {
    raw.trim().trim_matches('"')
}

impl Default for CsvDeserializer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordDeserializer for CsvDeserializer {
    fn deserialize(&self, data: &[u8], schema: &SchemaRef) -> Result<RecordBatch, SerdeError> {
        let text = std::str::from_utf8(data)
            .map_err(|e| SerdeError::MalformedInput(format!("payload is not UTF-8: {e}")))?;

        let records: Vec<Vec<&str>> = text
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| self.split_record(line))
            .collect();
        if records.is_empty() {
            return Err(SerdeError::MalformedInput("empty CSV payload".into()));
        }
        for record in &records {
            if record.len() != schema.fields().len() {
                return Err(SerdeError::Csv(format!(
                    "expected {} fields, got {}",
                    schema.fields().len(),
                    record.len()
                )));
            }
        }

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
        for (index, field) in schema.fields().iter().enumerate() {
            columns.push(decode_column(field, &records, index)?);
        }
        RecordBatch::try_new(schema.clone(), columns)
            .map_err(|e| SerdeError::MalformedInput(format!("failed to build block: {e}")))
    }

    fn format(&self) -> Format {
        Format::Csv
    }
}

fn decode_column(
    field: &Field,
    records: &[Vec<&str>],
    index: usize,
) -> Result<ArrayRef, SerdeError> {
    macro_rules! parse_cell {
        ($cell:expr, $ty:ty) => {
            $cell
                .parse::<$ty>()
                .map_err(|e| SerdeError::TypeMismatch {
                    field: field.name().clone(),
                    expected: field.data_type().to_string(),
                    message: format!("'{}': {e}", $cell),
                })?
        };
    }

    let array = match field.data_type() {
        DataType::Int64 => {
            let mut builder = Int64Builder::with_capacity(records.len());
            for record in records {
                match cell(field, record[index])? {
                    None => builder.append_null(),
                    Some(raw) => builder.append_value(parse_cell!(raw, i64)),
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::with_capacity(records.len());
            for record in records {
                match cell(field, record[index])? {
                    None => builder.append_null(),
                    Some(raw) => builder.append_value(parse_cell!(raw, f64)),
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(records.len());
            for record in records {
                match cell(field, record[index])? {
                    None => builder.append_null(),
                    Some(raw) => match raw {
                        "true" | "1" => builder.append_value(true),
                        "false" | "0" => builder.append_value(false),
                        other => {
                            return Err(SerdeError::TypeMismatch {
                                field: field.name().clone(),
                                expected: "Boolean".into(),
                                message: format!("'{other}'"),
                            })
                        }
                    },
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
        DataType::Utf8 => {
            let mut builder = StringBuilder::new();
            for record in records {
                match cell(field, record[index])? {
                    None => builder.append_null(),
                    Some(raw) => builder.append_value(raw),
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
        other => {
            return Err(SerdeError::UnsupportedFormat(format!(
                "CSV decoding is not supported for Arrow type {other}"
            )))
        }
    };
    Ok(array)
}

/// An empty cell is null for nullable columns and an error otherwise.
fn cell<'a>(field: &Field, raw: &'a str) -> Result<Option<&'a str>, SerdeError> {
    if raw.is_empty() {
        if field.is_nullable() {
            Ok(None)
        } else {
            Err(SerdeError::MissingField(field.name().clone()))
        }
    } else {
        Ok(Some(raw))
    }
}

/// CSV encoder using Arrow's display formatting per column.
#[derive(Debug, Clone)]
pub struct CsvSerializer {
    delimiter: char,
}

impl CsvSerializer {
    /// Creates an encoder with the `,` delimiter.
    #[must_use]
    pub fn new() -> Self {
        Self { delimiter: ',' }
    }
}

impl Default for CsvSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordSerializer for CsvSerializer {
    fn serialize(&self, batch: &RecordBatch) -> Result<Vec<Vec<u8>>, SerdeError> {
        let options = FormatOptions::default().with_null("");
        let formatters: Vec<ArrayFormatter<'_>> = batch
            .columns()
            .iter()
            .map(|column| ArrayFormatter::try_new(column.as_ref(), &options))
            .collect::<Result<_, _>>()
            .map_err(|e| SerdeError::Csv(format!("failed to format column: {e}")))?;

        let mut rows = Vec::with_capacity(batch.num_rows());
        for row in 0..batch.num_rows() {
            let mut line = String::new();
            for (index, formatter) in formatters.iter().enumerate() {
                if index > 0 {
                    line.push(self.delimiter);
                }
                let rendered = formatter.value(row).to_string();
                if rendered.contains(self.delimiter) || rendered.contains('"') {
                    line.push('"');
                    line.push_str(&rendered.replace('"', "\"\""));
                    line.push('"');
                } else {
                    line.push_str(&rendered);
                }
            }
            line.push('\n');
            rows.push(line.into_bytes());
        }
        Ok(rows)
    }

    fn format(&self) -> Format {
        Format::Csv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Array, Int64Array, StringArray};
    use arrow_schema::Schema;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]))
    }

    #[test]
    fn test_deserialize_basic() {
        let batch = CsvDeserializer::new()
            .deserialize(b"1,alpha\n2,beta\n", &test_schema())
            .unwrap();
        assert_eq!(batch.num_rows(), 2);
    }

    #[test]
    fn test_deserialize_quoted_delimiter() {
        let batch = CsvDeserializer::new()
            .deserialize(b"1,\"a,b\"\n", &test_schema())
            .unwrap();
        let names = batch.column(1).as_any().downcast_ref::<StringArray>().unwrap();
        assert_eq!(names.value(0), "a,b");
    }

    #[test]
    fn test_deserialize_empty_nullable() {
        let batch = CsvDeserializer::new()
            .deserialize(b"3,\n", &test_schema())
            .unwrap();
        assert_eq!(batch.column(1).null_count(), 1);
    }

    #[test]
    fn test_deserialize_field_count_mismatch() {
        let err = CsvDeserializer::new()
            .deserialize(b"1,alpha,extra\n", &test_schema())
            .unwrap_err();
        assert!(matches!(err, SerdeError::Csv(_)));
    }

    #[test]
    fn test_deserialize_bad_number() {
        let err = CsvDeserializer::new()
            .deserialize(b"x,alpha\n", &test_schema())
            .unwrap_err();
        assert!(matches!(err, SerdeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_custom_delimiter() {
        let batch = CsvDeserializer::with_delimiter(';')
            .deserialize(b"1;alpha\n", &test_schema())
            .unwrap();
        assert_eq!(batch.num_rows(), 1);
    }

    #[test]
    fn test_serialize_quotes_delimiter() {
        let batch = RecordBatch::try_new(
            test_schema(),
            vec![
                Arc::new(Int64Array::from(vec![1])),
                Arc::new(StringArray::from(vec!["a,b"])),
            ],
        )
        .unwrap();
        let rows = CsvSerializer::new().serialize(&batch).unwrap();
        assert_eq!(String::from_utf8(rows[0].clone()).unwrap(), "1,\"a,b\"\n");
    }

    #[test]
    fn test_round_trip() {
        let deserializer = CsvDeserializer::new();
        let batch = deserializer
            .deserialize(b"5,hello\n", &test_schema())
            .unwrap();
        let encoded = CsvSerializer::new().serialize_batch(&batch).unwrap();
        let again = deserializer.deserialize(&encoded, &test_schema()).unwrap();
        assert_eq!(again.num_rows(), 1);
    }
}
