//! # Tablerust
//!
//! A typed data-access layer over partitioned key-value table stores.
//!
//! The library compiles typed predicates into the backend's filter grammar,
//! splits bulk writes into partition-aligned atomic batches, runs them
//! sequentially or on a bounded worker pool, and materializes tables on
//! first use.

pub mod backend;
pub mod batch;
pub mod cancel;
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod parallel;
pub mod predicate;
pub mod table_cache;

// Re-export main types for convenience
pub use backend::{MemoryBackend, TableBackend};
pub use batch::BatchReport;
pub use cancel::CancellationToken;
pub use config::StorageConfig;
pub use context::OperationContext;
pub use error::{BatchFailure, ChunkFailure, Interruption, Result, StorageError};
pub use model::{EdmType, Entity, EntityKey, OperationKind, TableRecord, Value, VersionToken};
pub use parallel::{JoinOutcome, ParallelOptions};
pub use predicate::{Field, Predicate};
pub use table_cache::{TableHandle, TableHandleCache};

use backend::ContinuationToken;
use batch::BatchExecutor;
use parallel::ParallelDispatcher;
use std::sync::Arc;
use table_cache::ResolveMode;
use tracing::{debug, instrument};

/// Main API for table access
///
/// Cloning is cheap: clones share the backend, the handle cache and the
/// configuration. Each facade owns its [`OperationContext`], so overrides
/// are made by deriving a new facade and never change the one they came from.
#[derive(Clone)]
pub struct TableStorage {
    backend: Arc<dyn TableBackend>,
    cache: Arc<TableHandleCache>,
    config: Arc<StorageConfig>,
    ctx: OperationContext,
}

impl TableStorage {
    /// Create a storage facade with default configuration.
    pub fn new<B>(backend: B) -> Self
    where
        B: TableBackend + 'static,
    {
        Self::with_config(backend, StorageConfig::default())
    }

    pub fn with_config<B>(backend: B, config: StorageConfig) -> Self
    where
        B: TableBackend + 'static,
    {
        let cache = Arc::new(TableHandleCache::from_config(&config));
        Self::with_cache(Arc::new(backend), cache, config)
    }

    /// Share a backend and handle cache between several facades.
    pub fn with_cache(
        backend: Arc<dyn TableBackend>,
        cache: Arc<TableHandleCache>,
        config: StorageConfig,
    ) -> Self {
        Self {
            backend,
            cache,
            config: Arc::new(config),
            ctx: OperationContext::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn TableBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<TableHandleCache> {
        &self.cache
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// A facade that uses `table_name` instead of the record type's table.
    ///
    /// `self` is left as it was; the override lasts as long as the returned
    /// facade and is visible only to its holder.
    pub fn with_table_name(&self, table_name: impl Into<String>) -> TableStorage {
        let mut derived = self.clone();
        derived.ctx = derived.ctx.with_table_name(table_name);
        derived
    }

    /// A facade whose operations observe `token`.
    pub fn with_cancellation(&self, token: CancellationToken) -> TableStorage {
        let mut derived = self.clone();
        derived.ctx = derived.ctx.with_cancellation(token);
        derived
    }

    /// Overrides carried by this facade.
    pub fn context(&self) -> &OperationContext {
        &self.ctx
    }

    /// Parallel options built from configuration.
    pub fn parallel_options(&self) -> ParallelOptions {
        ParallelOptions::from_config(&self.config.parallel)
    }

    /// Physical table for records of type `T` under the current overrides.
    pub fn table_name<T: TableRecord>(&self) -> String {
        self.context().table_for::<T>()
    }

    /// Resolve the table for `T`, creating it if needed.
    pub fn ensure_table<T: TableRecord>(&self) -> Result<TableHandle> {
        let table = self.table_name::<T>();
        self.cache.resolve(self.backend.as_ref(), &table, ResolveMode::CREATE)
    }

    /// Delete a table by name and forget its handle. Returns whether it existed.
    pub fn delete_table(&self, name: &str) -> Result<bool> {
        self.cache.delete_table(self.backend.as_ref(), name)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn add_entity<T: TableRecord>(&self, record: &T) -> Result<()> {
        self.do_operation(record, OperationKind::Insert)
    }

    pub fn add_entities<T: TableRecord>(&self, records: &[T]) -> Result<BatchReport> {
        self.do_operations(records, OperationKind::Insert)
    }

    pub fn add_entities_parallel<T: TableRecord>(
        &self,
        records: &[T],
        options: &ParallelOptions,
    ) -> Result<bool> {
        self.do_operations_parallel(records, OperationKind::Insert, options)
            .map(JoinOutcome::is_completed)
    }

    pub fn update_entity<T: TableRecord>(&self, record: &T) -> Result<()> {
        self.do_operation(record, OperationKind::Replace)
    }

    pub fn update_entities<T: TableRecord>(&self, records: &[T]) -> Result<BatchReport> {
        self.do_operations(records, OperationKind::Replace)
    }

    pub fn update_entities_parallel<T: TableRecord>(
        &self,
        records: &[T],
        options: &ParallelOptions,
    ) -> Result<bool> {
        self.do_operations_parallel(records, OperationKind::Replace, options)
            .map(JoinOutcome::is_completed)
    }

    pub fn remove_entity<T: TableRecord>(&self, record: &T) -> Result<()> {
        self.do_operation(record, OperationKind::Delete)
    }

    pub fn remove_entities<T: TableRecord>(&self, records: &[T]) -> Result<BatchReport> {
        self.do_operations(records, OperationKind::Delete)
    }

    pub fn remove_entities_parallel<T: TableRecord>(
        &self,
        records: &[T],
        options: &ParallelOptions,
    ) -> Result<bool> {
        self.do_operations_parallel(records, OperationKind::Delete, options)
            .map(JoinOutcome::is_completed)
    }

    /// Apply `kind` to a single record as a one-entity batch.
    pub fn do_operation<T: TableRecord>(&self, record: &T, kind: OperationKind) -> Result<()> {
        self.do_operations(std::slice::from_ref(record), kind)
            .map(|_| ())
    }

    /// Apply `kind` to every record, one partition-aligned batch at a time.
    #[instrument(skip(self, records), fields(count = records.len()), level = "debug")]
    pub fn do_operations<T: TableRecord>(
        &self,
        records: &[T],
        kind: OperationKind,
    ) -> Result<BatchReport> {
        let table = self.ctx.table_for::<T>();
        let entities = records.iter().map(T::to_entity).collect();
        self.executor().apply(&self.ctx, &table, entities, kind)
    }

    /// Apply `kind` to every record on a bounded worker pool.
    ///
    /// The `*_entities_parallel` helpers reduce the outcome to a flag that
    /// is `true` only for [`JoinOutcome::Completed`]; empty input, a
    /// timeout and a cancellation all read as `false` there. Callers that
    /// need to tell those apart use this method. Failures recorded before
    /// an early return come back as `BatchFailed` with `interrupted` set.
    #[instrument(skip(self, records, options), fields(count = records.len()), level = "debug")]
    pub fn do_operations_parallel<T: TableRecord>(
        &self,
        records: &[T],
        kind: OperationKind,
        options: &ParallelOptions,
    ) -> Result<JoinOutcome> {
        let table = self.ctx.table_for::<T>();
        let entities = records.iter().map(T::to_entity).collect();
        ParallelDispatcher::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.cache),
            self.config.effective_batch_size(),
        )
        .apply(&self.ctx, &table, entities, kind, options)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Point lookup. Empty keys short-circuit to `Ok(None)`.
    pub fn get_entity<T: TableRecord>(&self, partition_key: &str, row_key: &str) -> Result<Option<T>> {
        if partition_key.is_empty() || row_key.is_empty() {
            return Ok(None);
        }
        let table = self.table_name::<T>();
        let handle = self
            .cache
            .resolve(self.backend.as_ref(), &table, ResolveMode::EXISTING)?;
        self.backend
            .get(handle.name(), partition_key, row_key)
            .map_err(|e| StorageError::backend(&table, e))?
            .map(T::from_entity)
            .transpose()
    }

    /// First page of records matching `filter`, bounded by the page size.
    pub fn get_entities<T: TableRecord>(&self, filter: Option<&Predicate>) -> Result<Vec<T>> {
        self.query(filter, false)
    }

    /// Every record matching `filter`, following continuation tokens to the end.
    pub fn get_all_entities<T: TableRecord>(&self, filter: Option<&Predicate>) -> Result<Vec<T>> {
        self.query(filter, true)
    }

    fn query<T: TableRecord>(&self, filter: Option<&Predicate>, drain: bool) -> Result<Vec<T>> {
        let filter = filter.map(Predicate::compile).transpose()?;
        let table = self.table_name::<T>();
        let handle = self
            .cache
            .resolve(self.backend.as_ref(), &table, ResolveMode::EXISTING)?;

        let mut records = Vec::new();
        let mut continuation: Option<ContinuationToken> = None;
        let mut pages = 0usize;
        loop {
            let page = self
                .backend
                .query_page(
                    handle.name(),
                    filter.as_deref(),
                    self.config.query.page_size,
                    continuation.as_ref(),
                )
                .map_err(|e| StorageError::backend(&table, e))?;
            pages += 1;
            for entity in page.entities {
                records.push(T::from_entity(entity)?);
            }
            continuation = page.continuation;
            if !drain || continuation.is_none() {
                break;
            }
        }
        debug!(table = %table, pages, count = records.len(), filter = ?filter, "query complete");
        Ok(records)
    }

    fn executor(&self) -> BatchExecutor<'_> {
        BatchExecutor::new(
            self.backend.as_ref(),
            &self.cache,
            self.config.effective_batch_size(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;

    fn storage() -> TableStorage {
        let config = StorageConfig {
            table_creation: RetryPolicy::immediate(3),
            cache_eviction: RetryPolicy::immediate(3),
            jitter_seed: Some(11),
            ..StorageConfig::default()
        };
        TableStorage::with_config(MemoryBackend::new(), config)
    }

    #[test]
    fn test_single_entity_round_trip() {
        let storage = storage();
        let entity = Entity::new("Nature", "r1").with_field("Cost", 2.5);
        storage.add_entity(&entity).unwrap();

        let stored: Entity = storage.get_entity("Nature", "r1").unwrap().unwrap();
        assert_eq!(stored.field("Cost"), Some(&Value::Double(2.5)));
        assert!(stored.version.is_some());

        storage
            .update_entity(&Entity::new("Nature", "r1").with_field("Cost", 4.0))
            .unwrap();
        let stored: Entity = storage.get_entity("Nature", "r1").unwrap().unwrap();
        assert_eq!(stored.field("Cost"), Some(&Value::Double(4.0)));

        storage.remove_entity(&stored).unwrap();
        assert!(storage.get_entity::<Entity>("Nature", "r1").unwrap().is_none());
    }

    #[test]
    fn test_get_entity_with_empty_key_skips_backend() {
        let storage = storage();
        assert!(storage.get_entity::<Entity>("", "r1").unwrap().is_none());
        assert!(storage.get_entity::<Entity>("p", "").unwrap().is_none());
    }

    #[test]
    fn test_reads_require_existing_table() {
        let storage = storage();
        assert!(matches!(
            storage.get_entity::<Entity>("p", "r"),
            Err(StorageError::TableNotFound { .. })
        ));
        assert!(matches!(
            storage.get_entities::<Entity>(None),
            Err(StorageError::TableNotFound { .. })
        ));
    }

    #[test]
    fn test_update_of_missing_row_reports_key() {
        let storage = storage();
        storage.ensure_table::<Entity>().unwrap();
        let err = storage
            .update_entity(&Entity::new("Nature", "ghost"))
            .unwrap_err();
        match err {
            StorageError::EntityNotFound { table, key } => {
                assert_eq!(table, "EntityTable");
                assert_eq!(key, EntityKey::new("Nature", "ghost"));
            }
            other => panic!("expected EntityNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_filter_fails_before_io() {
        let storage = storage();
        let filter = Field::int32("Count").equals("many");
        assert!(matches!(
            storage.get_entities::<Entity>(Some(&filter)),
            Err(StorageError::TypeMismatch(_))
        ));
    }
}
