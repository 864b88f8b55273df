//! In-process table store.
//!
//! Rows are kept per table in key order, so query pages and continuation
//! tokens are deterministic. Every successful write stamps a fresh version
//! token and timestamp. Fault injection hooks let tests drive the retry,
//! failure and cancellation paths of the storage layer.

use super::{
    filter_eval::parse_filter, BackendError, BackendResult, BatchOutcome, ContinuationToken,
    CreateOutcome, QueryPage, TableBackend,
};
use crate::config::{DEFAULT_QUERY_PAGE_SIZE, MAX_BATCH_SIZE};
use crate::model::{Entity, EntityKey, Mutation, OperationKind, Value, VersionToken};
use crate::predicate::literal::truncate_to_tick;
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

/// Record of one `execute_batch` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchCall {
    pub table: String,
    /// Distinct partition keys in the call, in first-seen order.
    pub partition_keys: Vec<String>,
    pub size: usize,
    pub applied: bool,
}

/// Callback run after every batch call, outside the store's locks.
pub type BatchObserver = Arc<dyn Fn(&BatchCall) + Send + Sync>;

#[derive(Default)]
struct Faults {
    transient_exists: u32,
    create_conflicts: u32,
    /// 1-based index of the batch call to reject.
    reject_batch_call: Option<usize>,
    batch_latency: Option<Duration>,
}

type Rows = BTreeMap<EntityKey, Entity>;

pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Rows>>,
    next_version: AtomicU64,
    page_size: usize,
    max_batch_size: usize,
    faults: Mutex<Faults>,
    observer: RwLock<Option<BatchObserver>>,
    create_calls: AtomicUsize,
    tables_created: AtomicUsize,
    batch_count: AtomicUsize,
    batch_log: Mutex<Vec<BatchCall>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            page_size: DEFAULT_QUERY_PAGE_SIZE,
            max_batch_size: MAX_BATCH_SIZE,
            faults: Mutex::new(Faults::default()),
            observer: RwLock::new(None),
            create_calls: AtomicUsize::new(0),
            tables_created: AtomicUsize::new(0),
            batch_count: AtomicUsize::new(0),
            batch_log: Mutex::new(Vec::new()),
        }
    }

    /// Cap on entities returned per query page, regardless of what callers ask for.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Fail the next `count` existence checks with a transient error.
    pub fn inject_transient_exists(&self, count: u32) {
        self.faults.lock().transient_exists = count;
    }

    /// Answer the next `count` create calls with a conflict without creating.
    pub fn inject_create_conflicts(&self, count: u32) {
        self.faults.lock().create_conflicts = count;
    }

    /// Reject the `call`-th batch call (1-based, counting every call made so far).
    pub fn reject_batch_call(&self, call: usize) {
        self.faults.lock().reject_batch_call = Some(call);
    }

    pub fn set_batch_latency(&self, latency: Duration) {
        self.faults.lock().batch_latency = Some(latency);
    }

    pub fn set_batch_observer(&self, observer: impl Fn(&BatchCall) + Send + Sync + 'static) {
        *self.observer.write() = Some(Arc::new(observer));
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn tables_created(&self) -> usize {
        self.tables_created.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> Vec<BatchCall> {
        self.batch_log.lock().clone()
    }

    /// Number of rows in `table`, or `None` when the table does not exist.
    pub fn row_count(&self, table: &str) -> Option<usize> {
        self.tables.read().get(table).map(BTreeMap::len)
    }

    fn next_version(&self) -> VersionToken {
        let n = self.next_version.fetch_add(1, Ordering::SeqCst);
        VersionToken::new(format!("W/\"{n}\""))
    }

    /// Version, timestamp and tick-truncate a row before it is stored.
    fn stamp(&self, mut entity: Entity, now: OffsetDateTime) -> Entity {
        for value in entity.fields.values_mut() {
            if let Value::DateTime(dt) = value {
                *dt = truncate_to_tick(*dt);
            }
        }
        entity.version = Some(self.next_version());
        entity.timestamp = Some(truncate_to_tick(now));
        entity
    }

    fn validate_shape(&self, mutations: &[Mutation]) -> Option<BatchOutcome> {
        if mutations.is_empty() {
            return Some(BatchOutcome::Rejected {
                index: None,
                reason: "batch is empty".to_string(),
            });
        }
        if mutations.len() > self.max_batch_size {
            return Some(BatchOutcome::Rejected {
                index: None,
                reason: format!(
                    "batch holds {} operations, limit is {}",
                    mutations.len(),
                    self.max_batch_size
                ),
            });
        }
        let partition_key = &mutations[0].entity.partition_key;
        let mut row_keys = HashSet::with_capacity(mutations.len());
        for (index, mutation) in mutations.iter().enumerate() {
            if &mutation.entity.partition_key != partition_key {
                return Some(BatchOutcome::Rejected {
                    index: Some(index),
                    reason: "batch spans more than one partition key".to_string(),
                });
            }
            if !row_keys.insert(mutation.entity.row_key.as_str()) {
                return Some(BatchOutcome::Rejected {
                    index: Some(index),
                    reason: format!("row key {:?} appears twice", mutation.entity.row_key),
                });
            }
        }
        None
    }

    /// Check every mutation against the current rows without changing them.
    fn check_preconditions(rows: &Rows, mutations: &[Mutation]) -> Option<BatchOutcome> {
        for (index, mutation) in mutations.iter().enumerate() {
            let existing = rows.get(&mutation.entity.key());
            match mutation.kind {
                OperationKind::Insert => {
                    if existing.is_some() {
                        return Some(BatchOutcome::Conflict { index });
                    }
                }
                OperationKind::Replace | OperationKind::Merge | OperationKind::Delete => {
                    let Some(expected) = mutation.entity.version.as_ref() else {
                        return Some(BatchOutcome::Rejected {
                            index: Some(index),
                            reason: format!("{} requires a version token", mutation.kind),
                        });
                    };
                    let Some(current) = existing else {
                        return Some(BatchOutcome::Rejected {
                            index: Some(index),
                            reason: "entity does not exist".to_string(),
                        });
                    };
                    if current.version.as_ref() != Some(expected) {
                        return Some(BatchOutcome::Conflict { index });
                    }
                }
                OperationKind::InsertOrReplace | OperationKind::InsertOrMerge => {}
            }
        }
        None
    }

    fn apply(&self, rows: &mut Rows, mutations: &[Mutation]) {
        let now = OffsetDateTime::now_utc();
        for mutation in mutations {
            let key = mutation.entity.key();
            match mutation.kind {
                OperationKind::Delete => {
                    rows.remove(&key);
                }
                OperationKind::Merge | OperationKind::InsertOrMerge => {
                    let merged = match rows.remove(&key) {
                        Some(mut current) => {
                            current.fields.extend(
                                mutation
                                    .entity
                                    .fields
                                    .iter()
                                    .map(|(k, v)| (k.clone(), v.clone())),
                            );
                            current
                        }
                        None => mutation.entity.clone(),
                    };
                    rows.insert(key, self.stamp(merged, now));
                }
                OperationKind::Insert
                | OperationKind::Replace
                | OperationKind::InsertOrReplace => {
                    rows.insert(key, self.stamp(mutation.entity.clone(), now));
                }
            }
        }
    }

    fn record(&self, table: &str, mutations: &[Mutation], applied: bool) {
        let mut partition_keys: Vec<String> = Vec::new();
        for mutation in mutations {
            if !partition_keys.contains(&mutation.entity.partition_key) {
                partition_keys.push(mutation.entity.partition_key.clone());
            }
        }
        let call = BatchCall {
            table: table.to_string(),
            partition_keys,
            size: mutations.len(),
            applied,
        };
        self.batch_log.lock().push(call.clone());
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer(&call);
        }
    }
}

impl TableBackend for MemoryBackend {
    fn table_exists(&self, table: &str) -> BackendResult<bool> {
        {
            let mut faults = self.faults.lock();
            if faults.transient_exists > 0 {
                faults.transient_exists -= 1;
                return Err(BackendError::Transient(format!(
                    "existence check for {table} timed out"
                )));
            }
        }
        Ok(self.tables.read().contains_key(table))
    }

    fn create_table(&self, table: &str) -> BackendResult<CreateOutcome> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut faults = self.faults.lock();
            if faults.create_conflicts > 0 {
                faults.create_conflicts -= 1;
                debug!(table, "injected create conflict");
                return Ok(CreateOutcome::Conflict);
            }
        }
        let mut tables = self.tables.write();
        if tables.contains_key(table) {
            return Ok(CreateOutcome::Conflict);
        }
        tables.insert(table.to_string(), Rows::new());
        self.tables_created.fetch_add(1, Ordering::SeqCst);
        debug!(table, "table created");
        Ok(CreateOutcome::Created)
    }

    fn delete_table(&self, table: &str) -> BackendResult<bool> {
        Ok(self.tables.write().remove(table).is_some())
    }

    fn get(
        &self,
        table: &str,
        partition_key: &str,
        row_key: &str,
    ) -> BackendResult<Option<Entity>> {
        let tables = self.tables.read();
        let rows = tables
            .get(table)
            .ok_or_else(|| BackendError::TableMissing(table.to_string()))?;
        Ok(rows.get(&EntityKey::new(partition_key, row_key)).cloned())
    }

    fn execute_batch(&self, table: &str, mutations: &[Mutation]) -> BackendResult<BatchOutcome> {
        let call = self.batch_count.fetch_add(1, Ordering::SeqCst) + 1;
        let (reject, latency) = {
            let faults = self.faults.lock();
            (faults.reject_batch_call == Some(call), faults.batch_latency)
        };
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }

        let outcome = if let Some(outcome) = self.validate_shape(mutations) {
            outcome
        } else if reject {
            BatchOutcome::Rejected {
                index: None,
                reason: format!("batch call {call} rejected by fault injection"),
            }
        } else {
            let mut tables = self.tables.write();
            let rows = tables
                .get_mut(table)
                .ok_or_else(|| BackendError::TableMissing(table.to_string()))?;
            match Self::check_preconditions(rows, mutations) {
                Some(outcome) => outcome,
                None => {
                    self.apply(rows, mutations);
                    BatchOutcome::Applied
                }
            }
        };

        debug!(table, call, size = mutations.len(), ?outcome, "batch executed");
        self.record(table, mutations, outcome == BatchOutcome::Applied);
        Ok(outcome)
    }

    fn query_page(
        &self,
        table: &str,
        filter: Option<&str>,
        take: usize,
        continuation: Option<&ContinuationToken>,
    ) -> BackendResult<QueryPage> {
        let filter = filter.map(parse_filter).transpose()?;
        let limit = take.clamp(1, self.page_size);
        let tables = self.tables.read();
        let rows = tables
            .get(table)
            .ok_or_else(|| BackendError::TableMissing(table.to_string()))?;

        let start = match continuation {
            Some(token) => Bound::Included(EntityKey::new(
                token.next_partition_key.clone(),
                token.next_row_key.clone(),
            )),
            None => Bound::Unbounded,
        };

        let mut page = QueryPage::default();
        for (key, entity) in rows.range((start, Bound::Unbounded)) {
            if let Some(filter) = &filter {
                if !filter.matches(entity) {
                    continue;
                }
            }
            if page.entities.len() == limit {
                page.continuation = Some(ContinuationToken::new(
                    key.partition_key.clone(),
                    key.row_key.clone(),
                ));
                break;
            }
            page.entities.push(entity.clone());
        }
        Ok(page)
    }
}
