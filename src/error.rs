//! # Errors
//!
//! Every failure surfaced by the storage layer. Errors carry the table
//! name, the affected keys and the chunk index wherever one applies so a
//! caller can localize a failure inside a bulk operation.

use crate::backend::BackendError;
use crate::model::EntityKey;
use std::fmt;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Contradictory or out-of-range settings supplied by the caller.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid entity {key}: {reason}")]
    InvalidEntity { key: EntityKey, reason: String },

    #[error("table {table} does not exist and must be created first")]
    TableNotFound { table: String },

    #[error("table {table} was not created in {attempts} attempts")]
    TableCreationFailed {
        table: String,
        attempts: u32,
        #[source]
        last_error: Option<BackendError>,
    },

    /// The remote table is gone but the local handle could not be dropped.
    /// This is a local-consistency warning, not data loss.
    #[error("table {table} was deleted but its cached handle was not evicted in {attempts} attempts")]
    CacheEvictionFailed { table: String, attempts: u32 },

    #[error("unsupported predicate: {0}")]
    UnsupportedPredicate(String),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A concurrency-checked write targeted a row that does not exist.
    #[error("entity {key} not found in table {table}")]
    EntityNotFound { table: String, key: EntityKey },

    #[error(transparent)]
    BatchFailed(Box<BatchFailure>),

    #[error("operation cancelled before chunk {chunk_index} of partition {partition_key:?} in table {table}")]
    OperationCancelled {
        table: String,
        partition_key: String,
        chunk_index: usize,
    },

    /// A bulk worker died without reporting; its shard's outcome is unknown.
    #[error("worker for shard {shard} of table {table} panicked")]
    WorkerPanicked { table: String, shard: usize },

    #[error("backend failure on table {table}: {source}")]
    Backend {
        table: String,
        #[source]
        source: BackendError,
    },
}

impl StorageError {
    pub(crate) fn backend(table: &str, source: BackendError) -> Self {
        StorageError::Backend {
            table: table.to_string(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::OperationCancelled { .. })
    }
}

/// Why a single chunk was not applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkFailureReason {
    /// Version or existence conflict at `index` within the chunk.
    Conflict { index: usize },
    /// The backend refused the batch as a whole or the entity at `index`.
    Rejected { index: Option<usize>, reason: String },
    /// The call itself failed; whether it was applied is unknown.
    Backend(BackendError),
}

impl fmt::Display for ChunkFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkFailureReason::Conflict { index } => write!(f, "conflict at entity {index}"),
            ChunkFailureReason::Rejected {
                index: Some(index),
                reason,
            } => write!(f, "rejected at entity {index}: {reason}"),
            ChunkFailureReason::Rejected { index: None, reason } => write!(f, "rejected: {reason}"),
            ChunkFailureReason::Backend(err) => write!(f, "{err}"),
        }
    }
}

/// One chunk of one partition that the backend did not apply.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    pub table: String,
    pub partition_key: String,
    pub chunk_index: usize,
    pub row_keys: Vec<String>,
    pub reason: ChunkFailureReason,
}

impl ChunkFailure {
    /// Row key of the entity the backend pointed at, if any.
    pub fn failed_row_key(&self) -> Option<&str> {
        let index = match &self.reason {
            ChunkFailureReason::Conflict { index } => Some(*index),
            ChunkFailureReason::Rejected { index, .. } => *index,
            ChunkFailureReason::Backend(_) => None,
        };
        index.and_then(|i| self.row_keys.get(i)).map(String::as_str)
    }
}

/// Why a bulk write stopped before every chunk was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    Cancelled,
    /// The parallel join deadline passed; workers may still be running.
    TimedOut,
}

impl fmt::Display for Interruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interruption::Cancelled => write!(f, "cancelled"),
            Interruption::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Outcome of a bulk write that did not fully apply.
///
/// Chunks are atomic but the operation is not: chunks counted in
/// `applied_chunks` stay applied, and the chunks counted in
/// `skipped_chunks` (later pages of a failed partition, or everything left
/// when the call was interrupted) were never sent.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub failures: Vec<ChunkFailure>,
    pub applied_chunks: usize,
    pub skipped_chunks: usize,
    /// Set when the call also stopped early. Counters then cover only the
    /// work that had reported back.
    pub interrupted: Option<Interruption>,
}

impl BatchFailure {
    pub fn first(&self) -> Option<&ChunkFailure> {
        self.failures.first()
    }

    pub(crate) fn absorb(&mut self, other: BatchFailure) {
        self.failures.extend(other.failures);
        self.applied_chunks += other.applied_chunks;
        self.skipped_chunks += other.skipped_chunks;
        self.interrupted = self.interrupted.or(other.interrupted);
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failures.first() {
            Some(first) => write!(
                f,
                "batch failed in table {}, partition {:?}, chunk {} ({} rows): {}",
                first.table,
                first.partition_key,
                first.chunk_index,
                first.row_keys.len(),
                first.reason
            )?,
            None => write!(f, "batch failed")?,
        }
        write!(
            f,
            "; {} chunk(s) applied, {} skipped, {} failed",
            self.applied_chunks,
            self.skipped_chunks,
            self.failures.len()
        )?;
        if let Some(interruption) = self.interrupted {
            write!(f, "; {interruption} before completion")?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchFailure {}
