//! Bounded parallel bulk dispatch.
//!
//! The input is cut into contiguous shards, one per worker, and every
//! worker runs the full partition-and-execute pipeline over its own shard.
//! The caller blocks until every worker reports, the timeout elapses or
//! the cancellation signal fires. Workers that are still running at that
//! point are left to finish their current chunk in the background; results
//! that had already arrived are still reported.

use crate::backend::TableBackend;
use crate::batch::{BatchExecutor, BatchReport};
use crate::cancel::CancellationToken;
use crate::config::{ParallelConfig, DEFAULT_MAX_WORKERS, MAX_BATCH_SIZE};
use crate::context::OperationContext;
use crate::error::{BatchFailure, Interruption, Result, StorageError};
use crate::model::{Entity, OperationKind};
use crate::table_cache::TableHandleCache;
use crossbeam_channel::{after, bounded, never, select};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
pub struct ParallelOptions {
    pub max_workers: usize,
    /// Bounds the join only; backend calls are never interrupted.
    pub timeout: Option<Duration>,
    /// Replaces the ambient signal for this call when set.
    pub cancellation: Option<CancellationToken>,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            timeout: None,
            cancellation: None,
        }
    }
}

impl ParallelOptions {
    pub fn from_config(config: &ParallelConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            timeout: config.timeout(),
            cancellation: None,
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

/// Contiguous shard ranges for `count` entities.
///
/// `min(max_workers, ceil(count / max_batch_size))` shards of
/// `count / shards` entities each; the last shard takes the remainder.
pub fn shard_bounds(count: usize, max_workers: usize, max_batch_size: usize) -> Vec<Range<usize>> {
    if count == 0 || max_workers == 0 {
        return Vec::new();
    }
    let shards = max_workers.min(count.div_ceil(max_batch_size.max(1)));
    let size = count / shards;
    (0..shards)
        .map(|i| {
            let start = i * size;
            let end = if i + 1 == shards { count } else { start + size };
            start..end
        })
        .collect()
}

/// How a parallel join ended when no worker reported a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Every worker finished.
    Completed,
    /// Nothing to do; no worker was started.
    Empty,
    Cancelled,
    /// The join deadline passed first.
    TimedOut,
}

impl JoinOutcome {
    pub fn is_completed(self) -> bool {
        self == JoinOutcome::Completed
    }
}

pub struct ParallelDispatcher {
    backend: Arc<dyn TableBackend>,
    cache: Arc<TableHandleCache>,
    max_batch_size: usize,
}

impl ParallelDispatcher {
    pub fn new(backend: Arc<dyn TableBackend>, cache: Arc<TableHandleCache>, max_batch_size: usize) -> Self {
        Self {
            backend,
            cache,
            max_batch_size: max_batch_size.clamp(1, MAX_BATCH_SIZE),
        }
    }

    /// Apply `kind` to `entities` with at most `options.max_workers` workers.
    ///
    /// Worker failures are merged into one `BatchFailed`. When the join is
    /// cut short, failures from workers that had already reported are still
    /// returned, marked with the interruption; otherwise the outcome says
    /// whether the call completed, was cancelled or timed out.
    #[instrument(skip(self, ctx, entities, options), fields(count = entities.len()), level = "debug")]
    pub fn apply(
        &self,
        ctx: &OperationContext,
        table: &str,
        mut entities: Vec<Entity>,
        kind: OperationKind,
        options: &ParallelOptions,
    ) -> Result<JoinOutcome> {
        if entities.is_empty() {
            return Ok(JoinOutcome::Empty);
        }
        if options.max_workers == 0 {
            return Err(StorageError::Configuration(
                "parallel dispatch needs at least one worker".to_string(),
            ));
        }

        let mut ctx = ctx.clone();
        if let Some(cancellation) = &options.cancellation {
            ctx.cancellation = cancellation.clone();
        }

        let bounds = shard_bounds(entities.len(), options.max_workers, self.max_batch_size);
        let shard_count = bounds.len();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(shard_count)
            .thread_name(|i| format!("tablerust-shard-{i}"))
            .panic_handler(|_| warn!("bulk worker panicked"))
            .build()
            .map_err(|e| StorageError::Configuration(format!("worker pool: {e}")))?;

        let mut shards = Vec::with_capacity(shard_count);
        for range in bounds.iter().rev() {
            shards.push(entities.split_off(range.start));
        }
        shards.reverse();

        let (done_tx, done_rx) = bounded(shard_count);
        for (shard, shard_entities) in shards.into_iter().enumerate() {
            let backend = Arc::clone(&self.backend);
            let cache = Arc::clone(&self.cache);
            let ctx = ctx.clone();
            let table = table.to_string();
            let done_tx = done_tx.clone();
            let max_batch_size = self.max_batch_size;
            debug!(table = %table, shard, size = shard_entities.len(), "spawning bulk worker");
            pool.spawn(move || {
                let executor = BatchExecutor::new(backend.as_ref(), &cache, max_batch_size);
                let result = executor.apply(&ctx, &table, shard_entities, kind);
                let _ = done_tx.send((shard, result));
            });
        }
        drop(done_tx);
        drop(pool);

        let deadline = options.timeout.map(after).unwrap_or_else(never);
        let cancelled = ctx.cancellation.receiver().clone();
        let mut results = Vec::with_capacity(shard_count);
        while results.len() < shard_count {
            select! {
                recv(done_rx) -> message => match message {
                    Ok(result) => results.push(result),
                    Err(_) => break,
                },
                recv(cancelled) -> _ => {
                    results.extend(done_rx.try_iter());
                    debug!(table, finished = results.len(), "bulk join cancelled");
                    return merge_results(results, Some(Interruption::Cancelled))
                        .map(|_| JoinOutcome::Cancelled);
                }
                recv(deadline) -> _ => {
                    results.extend(done_rx.try_iter());
                    warn!(table, finished = results.len(), shards = shard_count, "bulk join timed out");
                    return merge_results(results, Some(Interruption::TimedOut))
                        .map(|_| JoinOutcome::TimedOut);
                }
            }
        }

        debug!(table, shards = shard_count, "bulk join complete");
        if let Some(shard) = missing_shard(shard_count, &results) {
            return Err(StorageError::WorkerPanicked {
                table: table.to_string(),
                shard,
            });
        }
        Ok(match merge_results(results, None)? {
            Some(_) => JoinOutcome::Cancelled,
            None => JoinOutcome::Completed,
        })
    }
}

type ShardResult = (usize, Result<BatchReport>);

fn missing_shard(shard_count: usize, results: &[ShardResult]) -> Option<usize> {
    (0..shard_count).find(|shard| !results.iter().any(|(s, _)| s == shard))
}

/// Fold worker results into one error, or the interruption seen if none failed.
///
/// A hard error wins over chunk failures. Chunk failures are merged in
/// shard order and carry `interrupted`, or `Cancelled` when a worker
/// stopped on the signal by itself.
fn merge_results(
    mut results: Vec<ShardResult>,
    mut interrupted: Option<Interruption>,
) -> Result<Option<Interruption>> {
    results.sort_by_key(|(shard, _)| *shard);

    let mut merged: Option<BatchFailure> = None;
    let mut first_error: Option<StorageError> = None;
    for (_, result) in results {
        match result {
            Ok(_) => {}
            Err(StorageError::BatchFailed(failure)) => match merged.as_mut() {
                Some(merged) => merged.absorb(*failure),
                None => merged = Some(*failure),
            },
            Err(e) if e.is_cancelled() => {
                interrupted.get_or_insert(Interruption::Cancelled);
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        if let Some(failure) = &merged {
            warn!(failed_chunks = failure.failures.len(), "chunk failures superseded by worker error");
        }
        return Err(e);
    }
    if let Some(mut failure) = merged {
        failure.interrupted = interrupted.or(failure.interrupted);
        return Err(StorageError::BatchFailed(Box::new(failure)));
    }
    Ok(interrupted)
}
