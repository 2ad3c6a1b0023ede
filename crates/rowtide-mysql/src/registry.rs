//! Schema registry: filtered, cached table metadata.
//!
//! Lookups check the table filter before anything else, so an excluded
//! table is reported as excluded even when it does not exist. Allowed
//! tables are loaded from the [`MetadataSource`] on first use and cached
//! until a DDL statement names them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rowtide_core::{TableFilter, TableMeta, TableRef};
use tracing::debug;

use crate::error::{CanalError, CanalResult};
use crate::source::MetadataSource;

#[derive(Debug)]
pub struct SchemaRegistry {
    filter: TableFilter,
    tables: RwLock<HashMap<TableRef, Arc<TableMeta>>>,
}

impl SchemaRegistry {
    pub fn new(filter: TableFilter) -> Self {
        Self {
            filter,
            tables: RwLock::new(HashMap::new()),
        }
    }

    pub fn filter(&self) -> &TableFilter {
        &self.filter
    }

    pub fn is_allowed(&self, schema: &str, table: &str) -> bool {
        self.filter.is_allowed(schema, table)
    }

    /// Metadata for `schema.table`.
    ///
    /// Fails with [`CanalError::ExcludedTable`] before touching the source
    /// when the filter rejects the table, and with
    /// [`CanalError::TableNotFound`] when the source does not know it.
    pub async fn get_table<M: MetadataSource>(
        &self,
        source: &M,
        schema: &str,
        table: &str,
    ) -> CanalResult<Arc<TableMeta>> {
        if self.filter.is_excluded(schema, table) {
            return Err(CanalError::excluded(schema, table));
        }

        let key = TableRef::new(schema, table);
        let cached = self.tables.read().get(&key).cloned();
        if let Some(meta) = cached {
            return Ok(meta);
        }

        let meta = source
            .load_table(schema, table)
            .await?
            .ok_or_else(|| CanalError::not_found(schema, table))?;
        debug!(table = %key, columns = meta.columns.len(), "loaded table metadata");

        let meta = Arc::new(meta);
        self.tables.write().insert(key, meta.clone());
        Ok(meta)
    }

    /// Drop the cached entry so the next lookup reloads it.
    pub fn invalidate(&self, schema: &str, table: &str) -> bool {
        let removed = self
            .tables
            .write()
            .remove(&TableRef::new(schema, table))
            .is_some();
        if removed {
            debug!(schema, table, "invalidated table metadata");
        }
        removed
    }

    pub fn cached(&self, schema: &str, table: &str) -> Option<Arc<TableMeta>> {
        self.tables.read().get(&TableRef::new(schema, table)).cloned()
    }

    pub fn clear(&self) {
        self.tables.write().clear();
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }
}
