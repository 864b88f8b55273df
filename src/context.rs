//! Per-call operation context.
//!
//! The context travels by value: a facade owns one, every call passes it
//! down explicitly and every bulk worker gets its own copy. An override is a
//! new context derived from an existing one, so the original is never
//! mutated and nothing has to be restored.

use crate::cancel::CancellationToken;
use crate::error::{Result, StorageError};
use crate::model::TableRecord;

#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    /// Replaces the record type's default table name when set.
    pub table_name: Option<String>,
    pub cancellation: CancellationToken,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Physical table name for records of type `T`.
    pub fn table_for<T: TableRecord>(&self) -> String {
        self.table_name
            .clone()
            .unwrap_or_else(T::default_table_name)
    }

    /// Fail with `OperationCancelled` if the signal has fired.
    pub fn check_cancelled(&self, table: &str, partition_key: &str, chunk_index: usize) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(StorageError::OperationCancelled {
                table: table.to_string(),
                partition_key: partition_key.to_string(),
                chunk_index,
            });
        }
        Ok(())
    }
}
