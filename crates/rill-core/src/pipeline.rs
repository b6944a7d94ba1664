//! Block pipeline primitives.
//!
//! A [`BatchSource`] produces Arrow blocks, a [`BatchSink`] consumes them,
//! and a [`Pipe`] unites several sources. `Pipe::drain_into` is the
//! run-to-completion executor used by streaming drivers; `Pipe::next_batch`
//! is the pull interface used by direct reads.

use std::sync::Arc;

use arrow_array::{new_null_array, ArrayRef, RecordBatch};
use arrow_schema::SchemaRef;
use async_trait::async_trait;

use crate::error::CoreError;

/// A source of Arrow blocks.
///
/// A source is *finished* once `next_batch` returns `Ok(None)`; callers
/// must not poll it again after that.
#[async_trait]
pub trait BatchSource: Send {
    /// Produces the next block, or `None` when the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] when the source fails irrecoverably.
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>, CoreError>;

    /// Schema of the blocks this source produces.
    fn output_schema(&self) -> SchemaRef;
}

/// A shared sink for Arrow blocks.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Writes one block.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError`] when the write fails.
    async fn write(&self, batch: &RecordBatch) -> Result<(), CoreError>;
}

/// Converts a block to `schema` by column name.
///
/// Columns are picked by name; a missing nullable column is filled with
/// nulls; types must match exactly.
///
/// # Errors
///
/// Returns [`CoreError::SchemaMismatch`] on a missing non-nullable column
/// or a type mismatch.
pub fn convert_batch(batch: &RecordBatch, schema: &SchemaRef) -> Result<RecordBatch, CoreError> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for field in schema.fields() {
        match batch.column_by_name(field.name()) {
            Some(column) => {
                if column.data_type() != field.data_type() {
                    return Err(CoreError::SchemaMismatch(format!(
                        "column '{}' has type {}, expected {}",
                        field.name(),
                        column.data_type(),
                        field.data_type()
                    )));
                }
                columns.push(Arc::clone(column));
            }
            None if field.is_nullable() => {
                columns.push(new_null_array(field.data_type(), batch.num_rows()));
            }
            None => {
                return Err(CoreError::SchemaMismatch(format!(
                    "missing non-nullable column '{}'",
                    field.name()
                )));
            }
        }
    }
    RecordBatch::try_new(schema.clone(), columns).map_err(Into::into)
}

/// Counters reported by [`Pipe::drain_into`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Number of blocks moved.
    pub batches: u64,
    /// Number of rows moved.
    pub rows: u64,
}

/// A source that is exhausted from the start.
#[derive(Debug)]
pub struct EmptySource {
    schema: SchemaRef,
}

impl EmptySource {
    /// Creates an empty source with the given schema.
    #[must_use]
    pub fn new(schema: SchemaRef) -> Self {
        Self { schema }
    }
}

#[async_trait]
impl BatchSource for EmptySource {
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>, CoreError> {
        Ok(None)
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

/// Wraps a source with a name-keyed converting projection.
pub struct ConvertingSource {
    inner: Box<dyn BatchSource>,
    schema: SchemaRef,
}

impl ConvertingSource {
    /// Wraps `inner` so its blocks are converted to `schema`.
    #[must_use]
    pub fn new(inner: Box<dyn BatchSource>, schema: SchemaRef) -> Self {
        Self { inner, schema }
    }
}

#[async_trait]
impl BatchSource for ConvertingSource {
    async fn next_batch(&mut self) -> Result<Option<RecordBatch>, CoreError> {
        match self.inner.next_batch().await? {
            Some(batch) => Ok(Some(convert_batch(&batch, &self.schema)?)),
            None => Ok(None),
        }
    }

    fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }
}

/// A union of block sources sharing one output schema.
pub struct Pipe {
    sources: Vec<Box<dyn BatchSource>>,
    finished: Vec<bool>,
    schema: SchemaRef,
    cursor: usize,
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("sources", &self.sources.len())
            .field("finished", &self.finished)
            .field("schema", &self.schema)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl Pipe {
    /// Unites `sources` into one pipe.
    #[must_use]
    pub fn unite(sources: Vec<Box<dyn BatchSource>>, schema: SchemaRef) -> Self {
        let finished = vec![false; sources.len()];
        Self {
            sources,
            finished,
            schema,
            cursor: 0,
        }
    }

    /// A pipe over a single [`EmptySource`].
    #[must_use]
    pub fn empty(schema: SchemaRef) -> Self {
        Self::unite(vec![Box::new(EmptySource::new(schema.clone()))], schema)
    }

    /// Number of united sources.
    #[must_use]
    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Schema of the blocks this pipe produces.
    #[must_use]
    pub fn output_schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Pulls the next block, round-robining over unfinished sources.
    ///
    /// Returns `None` once every source is exhausted.
    ///
    /// # Errors
    ///
    /// Propagates the first source error.
    pub async fn next_batch(&mut self) -> Result<Option<RecordBatch>, CoreError> {
        let total = self.sources.len();
        let mut polled = 0;
        while polled < total {
            let index = self.cursor % total;
            self.cursor += 1;
            polled += 1;
            if self.finished[index] {
                continue;
            }
            match self.sources[index].next_batch().await? {
                Some(batch) => return Ok(Some(batch)),
                None => self.finished[index] = true,
            }
        }
        Ok(None)
    }

    /// Drives every source to completion concurrently, writing each block
    /// into `sink`.
    ///
    /// # Errors
    ///
    /// Returns the first source or sink error; all branches are awaited
    /// before the error is surfaced.
    pub async fn drain_into(&mut self, sink: &dyn BatchSink) -> Result<DrainStats, CoreError> {
        let drains = self.sources.iter_mut().map(|source| async move {
            let mut stats = DrainStats::default();
            while let Some(batch) = source.next_batch().await? {
                stats.batches += 1;
                stats.rows += batch.num_rows() as u64;
                sink.write(&batch).await?;
            }
            Ok::<DrainStats, CoreError>(stats)
        });

        let results = futures::future::join_all(drains).await;
        let mut total = DrainStats::default();
        for result in results {
            let stats = result?;
            total.batches += stats.batches;
            total.rows += stats.rows;
        }
        for flag in &mut self.finished {
            *flag = true;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Array, Int64Array};
    use arrow_schema::{DataType, Field, Schema};
    use parking_lot::Mutex;

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]))
    }

    fn test_batch(values: &[i64]) -> RecordBatch {
        RecordBatch::try_new(
            test_schema(),
            vec![Arc::new(Int64Array::from(values.to_vec()))],
        )
        .unwrap()
    }

    /// Source yielding a fixed list of batches.
    struct FixedSource {
        batches: Vec<RecordBatch>,
        schema: SchemaRef,
    }

    impl FixedSource {
        fn new(batches: Vec<RecordBatch>) -> Self {
            Self {
                batches,
                schema: test_schema(),
            }
        }
    }

    #[async_trait]
    impl BatchSource for FixedSource {
        async fn next_batch(&mut self) -> Result<Option<RecordBatch>, CoreError> {
            if self.batches.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.batches.remove(0)))
            }
        }

        fn output_schema(&self) -> SchemaRef {
            self.schema.clone()
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        batches: Mutex<Vec<RecordBatch>>,
    }

    #[async_trait]
    impl BatchSink for CollectingSink {
        async fn write(&self, batch: &RecordBatch) -> Result<(), CoreError> {
            self.batches.lock().push(batch.clone());
            Ok(())
        }
    }

    #[test]
    fn test_convert_batch_reorders_and_fills() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("missing", DataType::Utf8, true),
            Field::new("id", DataType::Int64, false),
        ]));
        let converted = convert_batch(&test_batch(&[1, 2]), &schema).unwrap();
        assert_eq!(converted.num_columns(), 2);
        assert_eq!(converted.column(0).null_count(), 2);
    }

    #[test]
    fn test_convert_batch_missing_required() {
        let schema = Arc::new(Schema::new(vec![Field::new(
            "missing",
            DataType::Utf8,
            false,
        )]));
        let err = convert_batch(&test_batch(&[1]), &schema).unwrap_err();
        assert!(matches!(err, CoreError::SchemaMismatch(_)));
    }

    #[test]
    fn test_convert_batch_type_mismatch() {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Utf8, false)]));
        let err = convert_batch(&test_batch(&[1]), &schema).unwrap_err();
        assert!(err.to_string().contains("type"));
    }

    #[tokio::test]
    async fn test_pipe_next_batch_round_robin() {
        let sources: Vec<Box<dyn BatchSource>> = vec![
            Box::new(FixedSource::new(vec![test_batch(&[1]), test_batch(&[2])])),
            Box::new(FixedSource::new(vec![test_batch(&[10])])),
        ];
        let mut pipe = Pipe::unite(sources, test_schema());
        assert_eq!(pipe.num_sources(), 2);

        let mut rows = 0;
        while let Some(batch) = pipe.next_batch().await.unwrap() {
            rows += batch.num_rows();
        }
        assert_eq!(rows, 3);

        // Exhausted pipe stays exhausted.
        assert!(pipe.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pipe_drain_into() {
        let sources: Vec<Box<dyn BatchSource>> = vec![
            Box::new(FixedSource::new(vec![test_batch(&[1, 2, 3])])),
            Box::new(FixedSource::new(vec![test_batch(&[4]), test_batch(&[5])])),
        ];
        let mut pipe = Pipe::unite(sources, test_schema());
        let sink = CollectingSink::default();

        let stats = pipe.drain_into(&sink).await.unwrap();
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.rows, 5);
        assert_eq!(sink.batches.lock().len(), 3);

        // After a drain, pulling yields nothing.
        assert!(pipe.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_pipe() {
        let mut pipe = Pipe::empty(test_schema());
        assert!(pipe.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_converting_source() {
        let narrow = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let inner = FixedSource::new(vec![test_batch(&[7])]);
        let mut converting = ConvertingSource::new(Box::new(inner), narrow.clone());
        let batch = converting.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.schema(), narrow);
        assert!(converting.next_batch().await.unwrap().is_none());
    }
}
