//! Session-scoped settings read by stream-like engines.

/// Settings carried by the session issuing a query against a stream-like
/// table, plus the server defaults streaming drivers fall back to.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Allow direct `SELECT` from a stream-like table.
    pub stream_like_engine_allow_direct_select: bool,
    /// Target queue/subject for inserts into a multi-queue engine.
    pub stream_like_engine_insert_queue: Option<String>,
    /// Default per-pass flush budget for streaming, in milliseconds.
    pub stream_flush_interval_ms: u64,
    /// Server-wide insert block size cap.
    pub max_insert_block_size: usize,
    /// Avro-specific rows-per-file override for outbound messages.
    pub output_format_avro_rows_in_file: Option<u64>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            stream_like_engine_allow_direct_select: false,
            stream_like_engine_insert_queue: None,
            stream_flush_interval_ms: 7500,
            max_insert_block_size: 1_048_449,
            output_format_avro_rows_in_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = SessionSettings::default();
        assert!(!settings.stream_like_engine_allow_direct_select);
        assert!(settings.stream_like_engine_insert_queue.is_none());
        assert_eq!(settings.stream_flush_interval_ms, 7500);
        assert_eq!(settings.max_insert_block_size, 1_048_449);
    }
}
