//! Partition-aware bulk writes.
//!
//! Entities are grouped by partition key, each group is paged into chunks
//! of at most the batch size, and every chunk goes to the backend as one
//! atomic call. A failed chunk stops the remaining chunks of its own
//! partition only; other partitions carry on and the failure is reported
//! once the whole call has run.

use crate::backend::{BatchOutcome, TableBackend};
use crate::config::MAX_BATCH_SIZE;
use crate::context::OperationContext;
use crate::error::{BatchFailure, ChunkFailure, ChunkFailureReason, Interruption, Result, StorageError};
use crate::model::{Entity, Mutation, OperationKind};
use crate::table_cache::{ResolveMode, TableHandleCache};
use hashbrown::HashMap;
use tracing::{debug, instrument, warn};

/// Entities sharing one partition key, in their original relative order.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionGroup {
    pub partition_key: String,
    pub entities: Vec<Entity>,
}

impl PartitionGroup {
    pub fn chunk_count(&self, max_batch_size: usize) -> usize {
        self.entities.len().div_ceil(max_batch_size.max(1))
    }
}

/// Group entities by partition key. Groups appear in first-seen order.
pub fn partition_by_key(entities: Vec<Entity>) -> Vec<PartitionGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<PartitionGroup> = Vec::new();
    for entity in entities {
        match index.get(&entity.partition_key) {
            Some(&slot) => groups[slot].entities.push(entity),
            None => {
                index.insert(entity.partition_key.clone(), groups.len());
                groups.push(PartitionGroup {
                    partition_key: entity.partition_key.clone(),
                    entities: vec![entity],
                });
            }
        }
    }
    groups
}

/// Split into pages of at most `size`; the last page holds the remainder.
pub fn into_chunks(mut entities: Vec<Entity>, size: usize) -> Vec<Vec<Entity>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(entities.len().div_ceil(size));
    while entities.len() > size {
        let rest = entities.split_off(size);
        chunks.push(entities);
        entities = rest;
    }
    if !entities.is_empty() {
        chunks.push(entities);
    }
    chunks
}

/// Totals for a fully applied call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub partitions: usize,
    pub chunks: usize,
    pub entities: usize,
}

impl BatchReport {
    pub fn merge(&mut self, other: BatchReport) {
        self.partitions += other.partitions;
        self.chunks += other.chunks;
        self.entities += other.entities;
    }
}

pub struct BatchExecutor<'a> {
    backend: &'a dyn TableBackend,
    cache: &'a TableHandleCache,
    max_batch_size: usize,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(backend: &'a dyn TableBackend, cache: &'a TableHandleCache, max_batch_size: usize) -> Self {
        Self {
            backend,
            cache,
            max_batch_size: max_batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Apply `kind` to every entity in `table`.
    ///
    /// Chunks are atomic, the call is not: on `BatchFailed` the chunks
    /// counted as applied stay applied. Cancellation is checked before every
    /// chunk. With nothing failed yet it surfaces as `OperationCancelled`;
    /// otherwise the recorded failures are returned marked as interrupted.
    #[instrument(skip(self, ctx, entities), fields(count = entities.len()), level = "debug")]
    pub fn apply(
        &self,
        ctx: &OperationContext,
        table: &str,
        mut entities: Vec<Entity>,
        kind: OperationKind,
    ) -> Result<BatchReport> {
        if entities.is_empty() {
            return Ok(BatchReport::default());
        }
        for entity in &entities {
            entity.validate()?;
        }

        let mode = if kind.creates_rows() {
            ResolveMode::CREATE
        } else {
            ResolveMode::EXISTING
        };
        if kind.requires_version() {
            self.hydrate_versions(table, &mut entities)?;
        }

        let groups = partition_by_key(entities);
        let mut report = BatchReport {
            partitions: groups.len(),
            ..BatchReport::default()
        };
        let chunk_counts: Vec<usize> = groups
            .iter()
            .map(|group| group.chunk_count(self.max_batch_size))
            .collect();
        let mut failures = Vec::new();
        let mut skipped_chunks = 0;
        let mut interrupted = None;

        'groups: for (group_index, group) in groups.into_iter().enumerate() {
            let partition_key = group.partition_key;
            let chunks = into_chunks(group.entities, self.max_batch_size);
            let chunk_count = chunks.len();

            for (chunk_index, chunk) in chunks.into_iter().enumerate() {
                if let Err(cancelled) = ctx.check_cancelled(table, &partition_key, chunk_index) {
                    if failures.is_empty() {
                        return Err(cancelled);
                    }
                    let unsent = chunk_count - chunk_index
                        + chunk_counts[group_index + 1..].iter().sum::<usize>();
                    warn!(table, partition_key = %partition_key, chunk_index, unsent, "cancelled after chunk failures");
                    skipped_chunks += unsent;
                    interrupted = Some(Interruption::Cancelled);
                    break 'groups;
                }
                let handle = self.cache.resolve(self.backend, table, mode)?;

                let size = chunk.len();
                let mutations: Vec<Mutation> =
                    chunk.into_iter().map(|e| Mutation::new(kind, e)).collect();
                let reason = match self.backend.execute_batch(handle.name(), &mutations) {
                    Ok(BatchOutcome::Applied) => {
                        debug!(table, partition_key = %partition_key, chunk_index, size, %kind, "chunk applied");
                        report.chunks += 1;
                        report.entities += size;
                        continue;
                    }
                    Ok(BatchOutcome::Conflict { index }) => ChunkFailureReason::Conflict { index },
                    Ok(BatchOutcome::Rejected { index, reason }) => {
                        ChunkFailureReason::Rejected { index, reason }
                    }
                    Err(e) => ChunkFailureReason::Backend(e),
                };

                let remaining = chunk_count - chunk_index - 1;
                warn!(
                    table,
                    partition_key = %partition_key,
                    chunk_index,
                    skipped = remaining,
                    reason = %reason,
                    "chunk failed, skipping the rest of the partition"
                );
                failures.push(ChunkFailure {
                    table: table.to_string(),
                    partition_key: partition_key.clone(),
                    chunk_index,
                    row_keys: mutations.into_iter().map(|m| m.entity.row_key).collect(),
                    reason,
                });
                skipped_chunks += remaining;
                break;
            }
        }

        if failures.is_empty() {
            Ok(report)
        } else {
            Err(StorageError::BatchFailed(Box::new(BatchFailure {
                failures,
                applied_chunks: report.chunks,
                skipped_chunks,
                interrupted,
            })))
        }
    }

    /// Fill in missing version tokens from the stored rows.
    fn hydrate_versions(&self, table: &str, entities: &mut [Entity]) -> Result<()> {
        if entities.iter().all(|e| e.version.is_some()) {
            return Ok(());
        }
        let handle = self.cache.resolve(self.backend, table, ResolveMode::EXISTING)?;
        for entity in entities.iter_mut().filter(|e| e.version.is_none()) {
            let stored = self
                .backend
                .get(handle.name(), &entity.partition_key, &entity.row_key)
                .map_err(|e| StorageError::backend(table, e))?;
            match stored {
                Some(stored) => entity.version = stored.version,
                None => {
                    return Err(StorageError::EntityNotFound {
                        table: table.to_string(),
                        key: entity.key(),
                    })
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cancel::CancellationToken;
    use crate::config::RetryPolicy;

    fn rows(pk: &str, count: usize) -> Vec<Entity> {
        (0..count)
            .map(|i| Entity::new(pk, format!("{i:05}")).with_field("n", i as i32))
            .collect()
    }

    fn cache() -> TableHandleCache {
        TableHandleCache::new(RetryPolicy::immediate(3), RetryPolicy::immediate(3), Some(1))
    }

    #[test]
    fn test_partition_keeps_relative_order() {
        let mut entities = rows("a", 3);
        entities.insert(1, Entity::new("b", "x"));
        let groups = partition_by_key(entities);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].partition_key, "a");
        let order: Vec<_> = groups[0].entities.iter().map(|e| e.row_key.as_str()).collect();
        assert_eq!(order, ["00000", "00001", "00002"]);
        assert_eq!(groups[1].entities.len(), 1);
    }

    #[test]
    fn test_chunks_hold_remainder_last() {
        let sizes: Vec<_> = into_chunks(rows("a", 250), 100).iter().map(Vec::len).collect();
        assert_eq!(sizes, [100, 100, 50]);
        assert!(into_chunks(Vec::new(), 100).is_empty());
        assert_eq!(into_chunks(rows("a", 100), 100).len(), 1);
    }

    #[test]
    fn test_apply_reports_totals() {
        let backend = MemoryBackend::new();
        let cache = cache();
        let executor = BatchExecutor::new(&backend, &cache, 100);
        let mut entities = rows("a", 150);
        entities.extend(rows("b", 20));
        let report = executor
            .apply(&OperationContext::new(), "Events", entities, OperationKind::Insert)
            .unwrap();
        assert_eq!(
            report,
            BatchReport {
                partitions: 2,
                chunks: 3,
                entities: 170
            }
        );
        assert_eq!(backend.row_count("Events"), Some(170));
    }

    #[test]
    fn test_failed_chunk_skips_rest_of_partition_only() {
        let backend = MemoryBackend::new();
        let cache = cache();
        let executor = BatchExecutor::new(&backend, &cache, 10);
        backend.reject_batch_call(1);
        let mut entities = rows("a", 30);
        entities.extend(rows("b", 15));

        let err = executor
            .apply(&OperationContext::new(), "Events", entities, OperationKind::Insert)
            .unwrap_err();
        let failure = match err {
            StorageError::BatchFailed(failure) => failure,
            other => panic!("expected batch failure, got {other:?}"),
        };
        assert_eq!(failure.failures.len(), 1);
        let first = failure.first().unwrap();
        assert_eq!(first.partition_key, "a");
        assert_eq!(first.chunk_index, 0);
        assert_eq!(first.row_keys.len(), 10);
        assert_eq!(failure.skipped_chunks, 2);
        assert_eq!(failure.applied_chunks, 2);
        assert_eq!(backend.row_count("Events"), Some(15));
    }

    #[test]
    fn test_cancelled_before_first_chunk() {
        let backend = MemoryBackend::new();
        let cache = cache();
        let executor = BatchExecutor::new(&backend, &cache, 100);
        let token = CancellationToken::new();
        token.cancel();
        let ctx = OperationContext::new().with_cancellation(token);
        let err = executor
            .apply(&ctx, "Events", rows("a", 5), OperationKind::Insert)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(backend.batch_calls().is_empty());
    }

    #[test]
    fn test_cancel_after_a_failed_chunk_keeps_the_failure() {
        let backend = MemoryBackend::new();
        let cache = cache();
        let executor = BatchExecutor::new(&backend, &cache, 10);
        let token = CancellationToken::new();
        let trigger = token.clone();
        backend.reject_batch_call(2);
        backend.set_batch_observer(move |call| {
            if !call.applied {
                trigger.cancel();
            }
        });

        let mut entities = rows("a", 25);
        entities.extend(rows("b", 20));
        let ctx = OperationContext::new().with_cancellation(token);
        let err = executor
            .apply(&ctx, "Events", entities, OperationKind::Insert)
            .unwrap_err();
        let failure = match err {
            StorageError::BatchFailed(failure) => failure,
            other => panic!("expected batch failure, got {other:?}"),
        };
        assert_eq!(failure.interrupted, Some(Interruption::Cancelled));
        assert_eq!(failure.failures.len(), 1);
        assert_eq!(failure.first().unwrap().chunk_index, 1);
        assert_eq!(failure.applied_chunks, 1);
        // One page left in "a", both pages of "b".
        assert_eq!(failure.skipped_chunks, 3);
        assert_eq!(backend.batch_calls().len(), 2);
        assert_eq!(backend.row_count("Events"), Some(10));
    }

    #[test]
    fn test_versioned_kinds_hydrate_tokens() {
        let backend = MemoryBackend::new();
        let cache = cache();
        let executor = BatchExecutor::new(&backend, &cache, 100);
        let ctx = OperationContext::new();
        executor
            .apply(&ctx, "Events", rows("a", 3), OperationKind::Insert)
            .unwrap();

        let updated: Vec<_> = rows("a", 3)
            .into_iter()
            .map(|e| e.with_field("n", 99_i32))
            .collect();
        executor
            .apply(&ctx, "Events", updated, OperationKind::Replace)
            .unwrap();
        let stored = backend.get("Events", "a", "00001").unwrap().unwrap();
        assert_eq!(stored.field("n"), Some(&crate::model::Value::Int32(99)));

        let err = executor
            .apply(&ctx, "Events", rows("zzz", 1), OperationKind::Delete)
            .unwrap_err();
        assert!(matches!(err, StorageError::EntityNotFound { .. }));
    }

    #[test]
    fn test_versioned_kinds_require_existing_table() {
        let backend = MemoryBackend::new();
        let cache = cache();
        let executor = BatchExecutor::new(&backend, &cache, 100);
        let err = executor
            .apply(&OperationContext::new(), "Events", rows("a", 1), OperationKind::Delete)
            .unwrap_err();
        assert!(matches!(err, StorageError::TableNotFound { .. }));
        assert_eq!(backend.create_calls(), 0);
    }

    #[test]
    fn test_invalid_entity_stops_before_any_call() {
        let backend = MemoryBackend::new();
        let cache = cache();
        let executor = BatchExecutor::new(&backend, &cache, 100);
        let mut entities = rows("a", 2);
        entities.push(Entity::new("a", ""));
        let err = executor
            .apply(&OperationContext::new(), "Events", entities, OperationKind::Insert)
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidEntity { .. }));
        assert!(backend.batch_calls().is_empty());
    }
}
