//! Materialized views and the insert fan-out sink.
//!
//! A materialized view stores the blocks inserted into it in a backing
//! target table. Stream-like engines never write to their own storage;
//! they push blocks into the insert pipelines of every dependent view,
//! which is what [`ViewFanoutSink`] models.

use std::fmt;
use std::sync::Arc;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::catalog::TableId;
use crate::error::CoreError;
use crate::pipeline::{convert_batch, BatchSink};

/// In-memory target table backing a materialized view.
pub struct TargetTable {
    id: TableId,
    schema: SchemaRef,
    batches: RwLock<Vec<RecordBatch>>,
}

impl TargetTable {
    /// Creates an empty target table.
    #[must_use]
    pub fn new(id: TableId, schema: SchemaRef) -> Self {
        Self {
            id,
            schema,
            batches: RwLock::new(Vec::new()),
        }
    }

    /// Returns the target's identifier.
    #[must_use]
    pub fn id(&self) -> &TableId {
        &self.id
    }

    /// Returns the target's schema.
    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Appends a block.
    pub fn append(&self, batch: RecordBatch) {
        self.batches.write().push(batch);
    }

    /// Returns a snapshot of all stored blocks.
    #[must_use]
    pub fn batches(&self) -> Vec<RecordBatch> {
        self.batches.read().clone()
    }

    /// Returns the total number of stored rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.batches.read().iter().map(RecordBatch::num_rows).sum()
    }
}

impl fmt::Debug for TargetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetTable")
            .field("id", &self.id)
            .field("rows", &self.num_rows())
            .finish()
    }
}

/// A materialized view fed by a source table's streaming engine.
///
/// Inserted blocks are converted to the view's schema by name and appended
/// to the backing [`TargetTable`]. A view whose target has been dropped
/// still resolves in the catalog but is not ready to receive inserts.
pub struct MaterializedView {
    id: TableId,
    schema: SchemaRef,
    target: RwLock<Option<Arc<TargetTable>>>,
}

impl MaterializedView {
    /// Creates a view with a fresh inner target table.
    #[must_use]
    pub fn new(id: TableId, schema: SchemaRef) -> Self {
        let target_id = TableId::new(id.database.clone(), format!(".inner.{}", id.name));
        let target = TargetTable::new(target_id, schema.clone());
        Self {
            id,
            schema,
            target: RwLock::new(Some(Arc::new(target))),
        }
    }

    /// Creates a view without a target table.
    #[must_use]
    pub fn without_target(id: TableId, schema: SchemaRef) -> Self {
        Self {
            id,
            schema,
            target: RwLock::new(None),
        }
    }

    /// Returns the view's identifier.
    #[must_use]
    pub fn id(&self) -> &TableId {
        &self.id
    }

    /// Returns the view's schema.
    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Returns the backing target table, if any.
    #[must_use]
    pub fn target(&self) -> Option<Arc<TargetTable>> {
        self.target.read().clone()
    }

    /// Returns `true` if the backing target table exists.
    #[must_use]
    pub fn target_exists(&self) -> bool {
        self.target.read().is_some()
    }

    /// Drops the backing target table.
    pub fn drop_target(&self) {
        *self.target.write() = None;
    }

    /// Inserts a block, converting it to the view's schema by column name.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TargetMissing`] if the target table is gone, or
    /// [`CoreError::SchemaMismatch`] if the block cannot be converted.
    pub fn insert(&self, batch: &RecordBatch) -> Result<(), CoreError> {
        let target = self
            .target()
            .ok_or_else(|| CoreError::TargetMissing(self.id.full_name()))?;
        let converted = convert_batch(batch, &self.schema)?;
        target.append(converted);
        Ok(())
    }
}

impl fmt::Debug for MaterializedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializedView")
            .field("id", &self.id)
            .field("target_exists", &self.target_exists())
            .finish()
    }
}

/// Insert sink that fans every block out to a set of dependent views.
pub struct ViewFanoutSink {
    views: Vec<Arc<MaterializedView>>,
}

impl ViewFanoutSink {
    /// Creates a sink over the given views.
    #[must_use]
    pub fn new(views: Vec<Arc<MaterializedView>>) -> Self {
        Self { views }
    }

    /// Returns the number of destination views.
    #[must_use]
    pub fn num_views(&self) -> usize {
        self.views.len()
    }
}

#[async_trait]
impl BatchSink for ViewFanoutSink {
    async fn write(&self, batch: &RecordBatch) -> Result<(), CoreError> {
        for view in &self.views {
            view.insert(batch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::{Int64Array, StringArray};
    use arrow_schema::{DataType, Field, Schema};

    fn wide_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("value", DataType::Utf8, false),
        ]))
    }

    fn wide_batch(n: usize) -> RecordBatch {
        #[allow(clippy::cast_possible_wrap)]
        let ids: Vec<i64> = (0..n as i64).collect();
        let values: Vec<String> = (0..n).map(|i| format!("value_{i}")).collect();
        RecordBatch::try_new(
            wide_schema(),
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(values)),
            ],
        )
        .unwrap()
    }

    fn view_id(name: &str) -> TableId {
        TableId::new("db", name)
    }

    #[test]
    fn test_insert_appends_to_target() {
        let view = MaterializedView::new(view_id("v"), wide_schema());
        view.insert(&wide_batch(3)).unwrap();
        view.insert(&wide_batch(2)).unwrap();

        let target = view.target().unwrap();
        assert_eq!(target.num_rows(), 5);
        assert_eq!(target.batches().len(), 2);
    }

    #[test]
    fn test_insert_projects_by_name() {
        let narrow = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let view = MaterializedView::new(view_id("v"), narrow);
        view.insert(&wide_batch(4)).unwrap();

        let stored = view.target().unwrap().batches();
        assert_eq!(stored[0].num_columns(), 1);
        assert_eq!(stored[0].num_rows(), 4);
    }

    #[test]
    fn test_insert_without_target() {
        let view = MaterializedView::without_target(view_id("v"), wide_schema());
        assert!(!view.target_exists());
        let err = view.insert(&wide_batch(1)).unwrap_err();
        assert!(matches!(err, CoreError::TargetMissing(_)));
    }

    #[test]
    fn test_drop_target() {
        let view = MaterializedView::new(view_id("v"), wide_schema());
        assert!(view.target_exists());
        view.drop_target();
        assert!(!view.target_exists());
    }

    #[tokio::test]
    async fn test_fanout_sink_writes_all_views() {
        let v1 = Arc::new(MaterializedView::new(view_id("v1"), wide_schema()));
        let v2 = Arc::new(MaterializedView::new(view_id("v2"), wide_schema()));
        let sink = ViewFanoutSink::new(vec![Arc::clone(&v1), Arc::clone(&v2)]);
        assert_eq!(sink.num_views(), 2);

        sink.write(&wide_batch(3)).await.unwrap();
        assert_eq!(v1.target().unwrap().num_rows(), 3);
        assert_eq!(v2.target().unwrap().num_rows(), 3);
    }
}
