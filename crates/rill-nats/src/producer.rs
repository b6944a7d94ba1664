//! Publisher and the insert message sink.
//!
//! Writes never share the engine's consumer connection: each sink owns a
//! short-lived dedicated connection bound to one literal subject.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arrow_array::RecordBatch;
use bytes::Bytes;
use tracing::debug;

use rill_core::formats::RecordSerializer;

use crate::connection::NatsConnection;
use crate::error::NatsError;

/// Publisher bound to one connection and one literal subject.
pub struct NatsProducer {
    connection: NatsConnection,
    subject: String,
    shutdown: Arc<AtomicBool>,
}

impl NatsProducer {
    pub(crate) fn new(
        connection: NatsConnection,
        subject: String,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection,
            subject,
            shutdown,
        }
    }

    /// The subject this producer publishes to.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Publishes one payload.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::ConnectionFailed`] if the engine is shutting
    /// down or the publish fails.
    pub async fn publish(&self, payload: Vec<u8>) -> Result<(), NatsError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(NatsError::ConnectionFailed(
                "engine is shutting down".into(),
            ));
        }
        self.connection
            .client()
            .publish(self.subject.clone(), Bytes::from(payload))
            .await
            .map_err(|e| {
                NatsError::ConnectionFailed(format!("publish to '{}' failed: {e}", self.subject))
            })
    }

    /// Flushes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::ConnectionFailed`] if the flush fails.
    pub async fn flush(&self) -> Result<(), NatsError> {
        self.connection.flush().await
    }
}

impl std::fmt::Debug for NatsProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsProducer")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

/// Splits `num_rows` into `(offset, length)` windows of at most
/// `max_rows` rows.
pub(crate) fn chunk_ranges(num_rows: usize, max_rows: usize) -> Vec<(usize, usize)> {
    let step = max_rows.max(1);
    let mut ranges = Vec::with_capacity(num_rows.div_ceil(step));
    let mut offset = 0;
    while offset < num_rows {
        let length = step.min(num_rows - offset);
        ranges.push((offset, length));
        offset += length;
    }
    ranges
}

/// Insert sink: serializes blocks and publishes them in message-sized
/// chunks.
pub struct MessageSink {
    producer: NatsProducer,
    serializer: Box<dyn RecordSerializer>,
    max_rows_per_message: usize,
    rows_written: u64,
}

impl MessageSink {
    pub(crate) fn new(
        producer: NatsProducer,
        serializer: Box<dyn RecordSerializer>,
        max_rows_per_message: usize,
    ) -> Self {
        Self {
            producer,
            serializer,
            max_rows_per_message,
            rows_written: 0,
        }
    }

    /// Rows published so far.
    #[must_use]
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    /// Serializes and publishes one block, at most
    /// `max_rows_per_message` rows per message.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError`] when encoding or publishing fails.
    pub async fn write(&mut self, batch: &RecordBatch) -> Result<(), NatsError> {
        for (offset, length) in chunk_ranges(batch.num_rows(), self.max_rows_per_message) {
            let chunk = batch.slice(offset, length);
            let payload = self.serializer.serialize_batch(&chunk)?;
            self.producer.publish(payload).await?;
            self.rows_written += length as u64;
        }
        Ok(())
    }

    /// Flushes the connection after the last block.
    ///
    /// # Errors
    ///
    /// Returns [`NatsError::ConnectionFailed`] if the flush fails.
    pub async fn finish(self) -> Result<(), NatsError> {
        debug!(
            subject = %self.producer.subject(),
            rows = self.rows_written,
            "insert sink finished"
        );
        self.producer.flush().await
    }
}

impl std::fmt::Debug for MessageSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSink")
            .field("subject", &self.producer.subject())
            .field("max_rows_per_message", &self.max_rows_per_message)
            .field("rows_written", &self.rows_written)
            .finish()
    }
}
