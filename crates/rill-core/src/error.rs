//! Core error types shared by the host-database contracts.

use thiserror::Error;

use crate::formats::SerdeError;

/// Errors produced by the catalog, materialized views, and block pipeline.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A table or view was not found in the catalog.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// A table with the same identifier is already registered.
    #[error("table already exists: {0}")]
    TableAlreadyExists(String),

    /// A block did not match the schema expected by a pipeline stage.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A materialized view has no backing target table.
    #[error("materialized view target missing: {0}")]
    TargetMissing(String),

    /// A pipeline stage failed.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Row serialization or deserialization failed.
    #[error("serde error: {0}")]
    Serde(#[from] SerdeError),

    /// An Arrow kernel failed.
    #[error("arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_detail() {
        let err = CoreError::TableNotFound("db.events".into());
        assert_eq!(err.to_string(), "table not found: db.events");
    }

    #[test]
    fn test_serde_error_wraps() {
        let err: CoreError = SerdeError::MalformedInput("truncated".into()).into();
        assert!(matches!(err, CoreError::Serde(_)));
        assert!(err.to_string().contains("truncated"));
    }
}
