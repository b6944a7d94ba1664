//! Row format registry.
//!
//! Converts between wire payloads and Arrow blocks:
//!
//! - [`RecordDeserializer`] - payload bytes to `RecordBatch`
//! - [`RecordSerializer`] - `RecordBatch` to payload bytes
//! - [`Format`] - the registry key, parsed from a format name
//!
//! Formats: [`json`], [`csv`], and [`raw`] are built in; Avro is a known
//! name whose codecs are not available in this build.

pub mod csv;
pub mod json;
pub mod raw;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use thiserror::Error;

/// Errors produced while encoding or decoding rows.
#[derive(Debug, Error)]
pub enum SerdeError {
    /// JSON parsing or encoding failed.
    #[error("JSON error: {0}")]
    Json(String),

    /// CSV parsing or encoding failed.
    #[error("CSV error: {0}")]
    Csv(String),

    /// The format name or a requested capability is not supported.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A non-nullable field is absent from the input.
    #[error("missing field: {0}")]
    MissingField(String),

    /// A value could not be converted to the column's Arrow type.
    #[error("type mismatch for field '{field}', expected {expected}: {message}")]
    TypeMismatch {
        /// The field name.
        field: String,
        /// The expected Arrow data type.
        expected: String,
        /// Conversion failure detail.
        message: String,
    },

    /// The input is not parseable at all.
    #[error("malformed input: {0}")]
    MalformedInput(String),
}

impl From<serde_json::Error> for SerdeError {
    fn from(e: serde_json::Error) -> Self {
        SerdeError::Json(e.to_string())
    }
}

/// Supported row formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// One JSON object per row.
    Json,
    /// One CSV record per row, positional fields.
    Csv,
    /// Opaque payload into a single string column.
    Raw,
    /// Apache Avro. Recognized by name; codecs unavailable in this build.
    Avro,
}

impl Format {
    /// Returns the canonical format name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Csv => "csv",
            Format::Raw => "raw",
            Format::Avro => "avro",
        }
    }

    /// Parses a format name, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError::UnsupportedFormat`] for unknown names.
    pub fn parse(name: &str) -> Result<Self, SerdeError> {
        name.parse()
    }
}

impl std::str::FromStr for Format {
    type Err = SerdeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" | "jsoneachrow" => Ok(Format::Json),
            "csv" => Ok(Format::Csv),
            "raw" | "rawblob" | "bytes" => Ok(Format::Raw),
            "avro" => Ok(Format::Avro),
            other => Err(SerdeError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decodes wire payloads into Arrow blocks.
pub trait RecordDeserializer: Send + Sync {
    /// Decodes one payload into a block matching `schema`.
    ///
    /// A payload may carry more than one row (for example newline-delimited
    /// JSON), so the returned block's row count is format-dependent.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError`] when the payload cannot be decoded into the
    /// schema.
    fn deserialize(&self, data: &[u8], schema: &SchemaRef) -> Result<RecordBatch, SerdeError>;

    /// Decodes several payloads into one block.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError`] when any payload fails to decode.
    fn deserialize_batch(
        &self,
        records: &[&[u8]],
        schema: &SchemaRef,
    ) -> Result<RecordBatch, SerdeError> {
        if records.is_empty() {
            return Ok(RecordBatch::new_empty(schema.clone()));
        }
        let batches: Vec<RecordBatch> = records
            .iter()
            .map(|data| self.deserialize(data, schema))
            .collect::<Result<_, _>>()?;
        arrow_select::concat::concat_batches(schema, batches.iter())
            .map_err(|e| SerdeError::MalformedInput(format!("failed to concat blocks: {e}")))
    }

    /// The format this deserializer decodes.
    fn format(&self) -> Format;
}

/// Encodes Arrow blocks into wire payloads.
pub trait RecordSerializer: Send + Sync {
    /// Encodes a block into one payload per row.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError`] when a value cannot be encoded.
    fn serialize(&self, batch: &RecordBatch) -> Result<Vec<Vec<u8>>, SerdeError>;

    /// Encodes a block into a single payload.
    ///
    /// # Errors
    ///
    /// Returns [`SerdeError`] when a value cannot be encoded.
    fn serialize_batch(&self, batch: &RecordBatch) -> Result<Vec<u8>, SerdeError> {
        let rows = self.serialize(batch)?;
        let total: usize = rows.iter().map(Vec::len).sum();
        let mut buf = Vec::with_capacity(total);
        for row in &rows {
            buf.extend_from_slice(row);
        }
        Ok(buf)
    }

    /// The format this serializer produces.
    fn format(&self) -> Format;
}

/// Creates a deserializer for `format`.
///
/// # Errors
///
/// Returns [`SerdeError::UnsupportedFormat`] for formats without a decoder
/// in this build.
pub fn create_deserializer(format: Format) -> Result<Box<dyn RecordDeserializer>, SerdeError> {
    match format {
        Format::Json => Ok(Box::new(json::JsonDeserializer::new())),
        Format::Csv => Ok(Box::new(csv::CsvDeserializer::new())),
        Format::Raw => Ok(Box::new(raw::RawDeserializer::new())),
        Format::Avro => Err(SerdeError::UnsupportedFormat(
            "Avro decoding is not available in this build".into(),
        )),
    }
}

/// Creates a serializer for `format`.
///
/// # Errors
///
/// Returns [`SerdeError::UnsupportedFormat`] for formats without an encoder
/// in this build.
pub fn create_serializer(format: Format) -> Result<Box<dyn RecordSerializer>, SerdeError> {
    match format {
        Format::Json => Ok(Box::new(json::JsonSerializer::new())),
        Format::Csv => Ok(Box::new(csv::CsvSerializer::new())),
        Format::Raw => Ok(Box::new(raw::RawSerializer::new())),
        Format::Avro => Err(SerdeError::UnsupportedFormat(
            "Avro encoding is not available in this build".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!(Format::parse("json").unwrap(), Format::Json);
        assert_eq!(Format::parse("JSONEachRow").unwrap(), Format::Json);
        assert_eq!(Format::parse("CSV").unwrap(), Format::Csv);
        assert_eq!(Format::parse("raw").unwrap(), Format::Raw);
        assert_eq!(Format::parse("RawBLOB").unwrap(), Format::Raw);
        assert_eq!(Format::parse("Avro").unwrap(), Format::Avro);
        assert!(Format::parse("protobuf").is_err());
    }

    #[test]
    fn test_format_display() {
        assert_eq!(Format::Json.to_string(), "json");
        assert_eq!(Format::Avro.to_string(), "avro");
    }

    #[test]
    fn test_factories() {
        assert!(create_deserializer(Format::Json).is_ok());
        assert!(create_deserializer(Format::Csv).is_ok());
        assert!(create_deserializer(Format::Raw).is_ok());
        assert!(create_deserializer(Format::Avro).is_err());

        assert!(create_serializer(Format::Json).is_ok());
        assert!(create_serializer(Format::Csv).is_ok());
        assert!(create_serializer(Format::Raw).is_ok());
        assert!(create_serializer(Format::Avro).is_err());
    }
}
