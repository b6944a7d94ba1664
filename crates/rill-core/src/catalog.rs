//! Table catalog with view dependency tracking.
//!
//! The [`Catalog`] is the engine's window into the rest of the server. It
//! answers exactly the questions a stream-like engine asks: which views
//! depend on a table, and how to resolve a table identifier to an entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arrow_schema::SchemaRef;
use parking_lot::RwLock;

use crate::error::CoreError;
use crate::mv::MaterializedView;

/// Fully-qualified table identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId {
    /// Database name.
    pub database: String,
    /// Table name within the database.
    pub name: String,
}

impl TableId {
    /// Creates a new table identifier.
    #[must_use]
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
        }
    }

    /// Returns the `database.table` rendering.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

/// What kind of object a catalog entry is.
#[derive(Clone)]
pub enum TableKind {
    /// A base table.
    Base,
    /// A materialized view.
    View(Arc<MaterializedView>),
}

/// A registered table or view.
#[derive(Clone)]
pub struct TableEntry {
    id: TableId,
    schema: SchemaRef,
    kind: TableKind,
}

impl TableEntry {
    /// Creates a base table entry.
    #[must_use]
    pub fn base(id: TableId, schema: SchemaRef) -> Self {
        Self {
            id,
            schema,
            kind: TableKind::Base,
        }
    }

    /// Creates a materialized view entry.
    #[must_use]
    pub fn view(view: Arc<MaterializedView>) -> Self {
        Self {
            id: view.id().clone(),
            schema: view.schema(),
            kind: TableKind::View(view),
        }
    }

    /// Returns the entry's identifier.
    #[must_use]
    pub fn id(&self) -> &TableId {
        &self.id
    }

    /// Returns the entry's schema.
    #[must_use]
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Returns the materialized view behind this entry, if it is one.
    #[must_use]
    pub fn as_view(&self) -> Option<&Arc<MaterializedView>> {
        match &self.kind {
            TableKind::View(view) => Some(view),
            TableKind::Base => None,
        }
    }

    /// Returns `true` if the entry is a materialized view.
    #[must_use]
    pub fn is_view(&self) -> bool {
        matches!(self.kind, TableKind::View(_))
    }
}

impl fmt::Debug for TableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableEntry")
            .field("id", &self.id)
            .field("is_view", &self.is_view())
            .finish_non_exhaustive()
    }
}

/// In-process table registry.
///
/// Tracks registered tables/views and the `source table -> dependent views`
/// edges a streaming engine consults on every pass.
#[derive(Default)]
pub struct Catalog {
    tables: RwLock<HashMap<TableId, Arc<TableEntry>>>,
    dependencies: RwLock<HashMap<TableId, Vec<TableId>>>,
}

impl Catalog {
    /// Creates a new empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table or view entry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TableAlreadyExists`] if the identifier is taken.
    pub fn register_table(&self, entry: TableEntry) -> Result<Arc<TableEntry>, CoreError> {
        let mut tables = self.tables.write();
        if tables.contains_key(entry.id()) {
            return Err(CoreError::TableAlreadyExists(entry.id().full_name()));
        }
        let entry = Arc::new(entry);
        tables.insert(entry.id().clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Registers a materialized view and records its dependency on `source`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TableAlreadyExists`] if the view's identifier
    /// is taken.
    pub fn attach_view(
        &self,
        view: Arc<MaterializedView>,
        source: &TableId,
    ) -> Result<Arc<TableEntry>, CoreError> {
        let entry = self.register_table(TableEntry::view(Arc::clone(&view)))?;
        self.dependencies
            .write()
            .entry(source.clone())
            .or_default()
            .push(view.id().clone());
        Ok(entry)
    }

    /// Removes a view and every dependency edge pointing at it.
    ///
    /// Returns `true` if the view was registered.
    pub fn detach_view(&self, view_id: &TableId) -> bool {
        let removed = self.tables.write().remove(view_id).is_some();
        if removed {
            let mut deps = self.dependencies.write();
            for views in deps.values_mut() {
                views.retain(|id| id != view_id);
            }
        }
        removed
    }

    /// Removes a table entry. Dependency edges from it are kept; views
    /// pointing at a dropped table simply stop resolving.
    pub fn drop_table(&self, id: &TableId) -> bool {
        self.tables.write().remove(id).is_some()
    }

    /// Resolves a table identifier.
    #[must_use]
    pub fn get_table(&self, id: &TableId) -> Option<Arc<TableEntry>> {
        self.tables.read().get(id).cloned()
    }

    /// Returns the identifiers of views depending on `table`.
    #[must_use]
    pub fn dependent_views(&self, table: &TableId) -> Vec<TableId> {
        self.dependencies
            .read()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("tables", &self.tables.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_schema::{DataType, Field, Schema};

    fn test_schema() -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]))
    }

    fn table_id(name: &str) -> TableId {
        TableId::new("db", name)
    }

    #[test]
    fn test_table_id_display() {
        let id = table_id("events");
        assert_eq!(id.to_string(), "db.events");
        assert_eq!(id.full_name(), "db.events");
    }

    #[test]
    fn test_register_and_get() {
        let catalog = Catalog::new();
        catalog
            .register_table(TableEntry::base(table_id("events"), test_schema()))
            .unwrap();

        let entry = catalog.get_table(&table_id("events")).unwrap();
        assert!(!entry.is_view());
        assert!(catalog.get_table(&table_id("missing")).is_none());
    }

    #[test]
    fn test_register_duplicate() {
        let catalog = Catalog::new();
        catalog
            .register_table(TableEntry::base(table_id("events"), test_schema()))
            .unwrap();
        let err = catalog
            .register_table(TableEntry::base(table_id("events"), test_schema()))
            .unwrap_err();
        assert!(matches!(err, CoreError::TableAlreadyExists(_)));
    }

    #[test]
    fn test_view_dependencies() {
        let catalog = Catalog::new();
        let source = table_id("events");
        catalog
            .register_table(TableEntry::base(source.clone(), test_schema()))
            .unwrap();

        let view = Arc::new(MaterializedView::new(table_id("v_all"), test_schema()));
        catalog.attach_view(view, &source).unwrap();

        assert_eq!(catalog.dependent_views(&source), vec![table_id("v_all")]);
        let entry = catalog.get_table(&table_id("v_all")).unwrap();
        assert!(entry.is_view());
        assert!(entry.as_view().is_some());
    }

    #[test]
    fn test_detach_view_removes_edges() {
        let catalog = Catalog::new();
        let source = table_id("events");
        catalog
            .register_table(TableEntry::base(source.clone(), test_schema()))
            .unwrap();
        let view = Arc::new(MaterializedView::new(table_id("v_all"), test_schema()));
        catalog.attach_view(view, &source).unwrap();

        assert!(catalog.detach_view(&table_id("v_all")));
        assert!(catalog.dependent_views(&source).is_empty());
        assert!(!catalog.detach_view(&table_id("v_all")));
    }

    #[test]
    fn test_drop_table() {
        let catalog = Catalog::new();
        catalog
            .register_table(TableEntry::base(table_id("events"), test_schema()))
            .unwrap();
        assert!(catalog.drop_table(&table_id("events")));
        assert!(!catalog.drop_table(&table_id("events")));
    }
}
