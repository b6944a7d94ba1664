//! Consumer-backed block source.
//!
//! A [`NatsSource`] leases one consumer and turns its queued messages into
//! Arrow blocks: up to `max_block_size` rows per block, decoded by the row
//! format, with the `_subject` virtual column appended (plus
//! `_raw_message`/`_error` under STREAM error handling). The source runs
//! against a wall-clock budget shared across its blocks; once the budget
//! elapses it reports exhaustion, which is how a streaming pass ends.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::SchemaRef;
use arrow_select::concat::concat_batches;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

use rill_core::formats::RecordDeserializer;
use rill_core::pipeline::BatchSource;
use rill_core::CoreError;

use crate::consumer::{note_popped, NatsConsumer, QueueLease};
use crate::pool::ConsumerPool;
use crate::settings::HandleErrorMode;

/// Everything a source needs besides its consumer.
pub(crate) struct SourceParams {
    /// Row format decoder.
    pub deserializer: Box<dyn RecordDeserializer>,
    /// Schema of the data columns (nullable-relaxed under STREAM).
    pub data_schema: SchemaRef,
    /// Data columns plus virtual columns, in output order.
    pub output_schema: SchemaRef,
    /// Row cap per block.
    pub max_block_size: usize,
    /// Wall-clock budget for the whole source.
    pub flush_budget: Duration,
    /// Broken-message policy.
    pub handle_error_mode: HandleErrorMode,
    /// Tolerated decode failures under the default policy.
    pub skip_broken_messages: u64,
    /// Engine-wide shutdown flag.
    pub shutdown: Arc<AtomicBool>,
}

/// Block source over one leased consumer.
pub struct NatsSource {
    pool: Arc<ConsumerPool>,
    consumer: Option<Arc<NatsConsumer>>,
    lease: Option<QueueLease>,
    queue_len: Arc<AtomicUsize>,
    deserializer: Box<dyn RecordDeserializer>,
    data_schema: SchemaRef,
    output_schema: SchemaRef,
    max_block_size: usize,
    flush_budget: Duration,
    deadline: Option<Instant>,
    handle_error_mode: HandleErrorMode,
    skip_broken_messages: u64,
    skipped: u64,
    shutdown: Arc<AtomicBool>,
}

impl NatsSource {
    /// Binds a source to a leased consumer, taking the queue lease.
    pub(crate) async fn bind(
        pool: Arc<ConsumerPool>,
        consumer: Arc<NatsConsumer>,
        params: SourceParams,
    ) -> Self {
        let lease = consumer.lock_queue().await;
        let queue_len = consumer.queue_len_handle();
        Self {
            pool,
            consumer: Some(consumer),
            lease: Some(lease),
            queue_len,
            deserializer: params.deserializer,
            data_schema: params.data_schema,
            output_schema: params.output_schema,
            max_block_size: params.max_block_size,
            flush_budget: params.flush_budget,
            deadline: None,
            handle_error_mode: params.handle_error_mode,
            skip_broken_messages: params.skip_broken_messages,
            skipped: 0,
            shutdown: params.shutdown,
        }
    }

    /// Shared queue-length counter of the leased consumer.
    pub(crate) fn queue_len_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.queue_len)
    }

    /// Returns `true` when the leased consumer's queue holds no messages.
    #[must_use]
    pub fn queue_empty(&self) -> bool {
        self.queue_len.load(Ordering::Relaxed) == 0
    }

    fn assemble(
        &self,
        decoded: Vec<RecordBatch>,
        subjects: Vec<String>,
        raws: Vec<Option<String>>,
        errors: Vec<Option<String>>,
    ) -> Result<RecordBatch, CoreError> {
        let data = concat_batches(&self.data_schema, decoded.iter())?;
        let mut columns: Vec<ArrayRef> = data.columns().to_vec();
        columns.push(Arc::new(StringArray::from(subjects)));
        if self.handle_error_mode == HandleErrorMode::Stream {
            columns.push(Arc::new(StringArray::from(raws)));
            columns.push(Arc::new(StringArray::from(errors)));
        }
        RecordBatch::try_new(self.output_schema.clone(), columns).map_err(Into::into)
    }
}

/// A one-row block of nulls, the data part of a broken-message row.
fn null_row(schema: &SchemaRef) -> Result<RecordBatch, CoreError> {
    let columns: Vec<ArrayRef> = schema
        .fields()
        .iter()
        .map(|field| arrow_array::new_null_array(field.data_type(), 1))
        .collect();
    RecordBatch::try_new(schema.clone(), columns).map_err(Into::into)
}

#[async_trait]
impl BatchSource for NatsSource {
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>, CoreError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Ok(None);
        }
        let deadline = *self
            .deadline
            .get_or_insert_with(|| Instant::now() + self.flush_budget);

        let Some(lease) = self.lease.as_mut() else {
            return Err(CoreError::Pipeline("source queue lease is gone".into()));
        };

        let mut decoded: Vec<RecordBatch> = Vec::new();
        let mut subjects: Vec<String> = Vec::new();
        let mut raws: Vec<Option<String>> = Vec::new();
        let mut errors: Vec<Option<String>> = Vec::new();
        let mut rows = 0usize;

        while rows < self.max_block_size {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let message = match tokio::time::timeout(remaining, lease.recv()).await {
                Ok(Some(message)) => message,
                // queue closed or budget exhausted
                Ok(None) | Err(_) => break,
            };
            note_popped(&self.queue_len);

            match self.deserializer.deserialize(&message.payload, &self.data_schema) {
                Ok(batch) => {
                    let decoded_rows = batch.num_rows();
                    if decoded_rows == 0 {
                        continue;
                    }
                    rows += decoded_rows;
                    for _ in 0..decoded_rows {
                        subjects.push(message.subject.clone());
                        raws.push(None);
                        errors.push(None);
                    }
                    decoded.push(batch);
                }
                Err(error) => match self.handle_error_mode {
                    HandleErrorMode::Stream => {
                        rows += 1;
                        subjects.push(message.subject.clone());
                        raws.push(Some(String::from_utf8_lossy(&message.payload).into_owned()));
                        errors.push(Some(error.to_string()));
                        decoded.push(null_row(&self.data_schema)?);
                    }
                    HandleErrorMode::Default => {
                        self.skipped += 1;
                        if self.skipped > self.skip_broken_messages {
                            return Err(error.into());
                        }
                        warn!(
                            subject = %message.subject,
                            error = %error,
                            skipped = self.skipped,
                            "skipping broken message"
                        );
                    }
                },
            }
        }

        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(self.assemble(decoded, subjects, raws, errors)?))
    }

    fn output_schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }
}

impl Drop for NatsSource {
    fn drop(&mut self) {
        // release the queue before the consumer goes back to the pool
        self.lease.take();
        if let Some(consumer) = self.consumer.take() {
            self.pool.release(consumer);
        }
    }
}

impl std::fmt::Debug for NatsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsSource")
            .field("max_block_size", &self.max_block_size)
            .field("flush_budget", &self.flush_budget)
            .field("mode", &self.handle_error_mode)
            .finish_non_exhaustive()
    }
}
