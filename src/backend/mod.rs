//! # Backend
//!
//! The request/response primitives of the remote table store. The storage
//! layer only ever talks to a [`TableBackend`]; [`MemoryBackend`] is a
//! complete in-process implementation.

mod filter_eval;
mod memory;

pub use filter_eval::{compare_values, parse_filter, ComparisonOp, FilterExpr, Operand};
pub use memory::{BatchCall, BatchObserver, MemoryBackend};

use crate::model::{Entity, Mutation};
use std::sync::Arc;

/// Failure of a backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Throttling, timeouts or a concurrent create/delete in progress.
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("table {0} does not exist")]
    TableMissing(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(String),
    #[error("backend failure: {0}")]
    Other(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Another caller created the table, or it is still being deleted.
    Conflict,
}

/// Result of one atomic batch call. Nothing is applied unless `Applied`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied,
    Conflict { index: usize },
    Rejected { index: Option<usize>, reason: String },
}

/// Position to resume a paged query from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContinuationToken {
    pub next_partition_key: String,
    pub next_row_key: String,
}

impl ContinuationToken {
    pub fn new(next_partition_key: impl Into<String>, next_row_key: impl Into<String>) -> Self {
        Self {
            next_partition_key: next_partition_key.into(),
            next_row_key: next_row_key.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPage {
    pub entities: Vec<Entity>,
    pub continuation: Option<ContinuationToken>,
}

/// Blocking client for a partitioned key-value table store.
pub trait TableBackend: Send + Sync {
    fn table_exists(&self, table: &str) -> BackendResult<bool>;

    fn create_table(&self, table: &str) -> BackendResult<CreateOutcome>;

    /// Returns whether the table existed.
    fn delete_table(&self, table: &str) -> BackendResult<bool>;

    fn get(&self, table: &str, partition_key: &str, row_key: &str)
        -> BackendResult<Option<Entity>>;

    /// Apply every mutation or none. All mutations share one partition key.
    fn execute_batch(&self, table: &str, mutations: &[Mutation]) -> BackendResult<BatchOutcome>;

    /// Fetch up to `take` entities matching `filter`, in key order.
    fn query_page(
        &self,
        table: &str,
        filter: Option<&str>,
        take: usize,
        continuation: Option<&ContinuationToken>,
    ) -> BackendResult<QueryPage>;
}

impl<B: TableBackend + ?Sized> TableBackend for Arc<B> {
    fn table_exists(&self, table: &str) -> BackendResult<bool> {
        (**self).table_exists(table)
    }

    fn create_table(&self, table: &str) -> BackendResult<CreateOutcome> {
        (**self).create_table(table)
    }

    fn delete_table(&self, table: &str) -> BackendResult<bool> {
        (**self).delete_table(table)
    }

    fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> BackendResult<Option<Entity>> {
        (**self).get(table, partition_key, row_key)
    }

    fn execute_batch(&self, table: &str, mutations: &[Mutation]) -> BackendResult<BatchOutcome> {
        (**self).execute_batch(table, mutations)
    }

    fn query_page(
        &self,
        table: &str,
        filter: Option<&str>,
        take: usize,
        continuation: Option<&ContinuationToken>,
    ) -> BackendResult<QueryPage> {
        (**self).query_page(table, filter, take, continuation)
    }
}
