//! Process-wide memo of resolved table handles.
//!
//! Lookups are lock-free on a hit. Creation of a missing table is
//! serialized per table name and retried with jittered backoff, so
//! concurrent resolves of the same name issue a single remote create and
//! all observe the same committed handle. Handles live until their table
//! is deleted through the cache; there is no other teardown.

use crate::backend::{BackendError, CreateOutcome, TableBackend};
use crate::config::{RetryPolicy, StorageConfig, MAX_TABLE_NAME_LEN, MIN_TABLE_NAME_LEN};
use crate::error::{Result, StorageError};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Binding between a table name and the backend table resource.
#[derive(Clone)]
pub struct TableHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    name: String,
}

impl TableHandle {
    fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name: name.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether both handles come from the same committed resolution.
    pub fn same_table(&self, other: &TableHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TableHandle").field(&self.inner.name).finish()
    }
}

/// How a cache miss is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolveMode {
    pub create_if_missing: bool,
    /// The caller is about to delete the table; an absent table is not an error.
    pub delete_intent: bool,
}

impl ResolveMode {
    pub const EXISTING: ResolveMode = ResolveMode {
        create_if_missing: false,
        delete_intent: false,
    };
    pub const CREATE: ResolveMode = ResolveMode {
        create_if_missing: true,
        delete_intent: false,
    };
    pub const DELETE: ResolveMode = ResolveMode {
        create_if_missing: false,
        delete_intent: true,
    };
}

pub struct TableHandleCache {
    handles: DashMap<String, TableHandle>,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
    creation: RetryPolicy,
    eviction: RetryPolicy,
    jitter: Mutex<StdRng>,
}

impl fmt::Debug for TableHandleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableHandleCache")
            .field("handles", &self.handles.len())
            .field("creation", &self.creation)
            .field("eviction", &self.eviction)
            .finish()
    }
}

impl Default for TableHandleCache {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

impl TableHandleCache {
    /// An empty cache. A `seed` makes the backoff jitter reproducible.
    pub fn new(creation: RetryPolicy, eviction: RetryPolicy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            handles: DashMap::new(),
            name_locks: DashMap::new(),
            creation,
            eviction,
            jitter: Mutex::new(rng),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.table_creation, config.cache_eviction, config.jitter_seed)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handles.contains_key(name)
    }

    pub fn cached(&self, name: &str) -> Option<TableHandle> {
        self.handles.get(name).map(|entry| entry.value().clone())
    }

    /// Resolve `name` to a handle, consulting the backend on a miss.
    #[instrument(skip(self, backend), level = "debug")]
    pub fn resolve(
        &self,
        backend: &dyn TableBackend,
        name: &str,
        mode: ResolveMode,
    ) -> Result<TableHandle> {
        if mode.create_if_missing && mode.delete_intent {
            return Err(StorageError::Configuration(format!(
                "table {name} cannot be resolved for both creation and deletion"
            )));
        }
        validate_table_name(name)?;

        if let Some(handle) = self.cached(name) {
            return Ok(handle);
        }

        if !mode.create_if_missing {
            let exists = backend
                .table_exists(name)
                .map_err(|e| StorageError::backend(name, e))?;
            return match (exists, mode.delete_intent) {
                (true, _) => Ok(self.commit(name)),
                // Not memoized: the table is about to go away anyway.
                (false, true) => Ok(TableHandle::new(name)),
                (false, false) => Err(StorageError::TableNotFound {
                    table: name.to_string(),
                }),
            };
        }

        self.create(backend, name)
    }

    fn create(&self, backend: &dyn TableBackend, name: &str) -> Result<TableHandle> {
        let lock = self.name_lock(name);
        let _creating = lock.lock();

        if let Some(handle) = self.cached(name) {
            return Ok(handle);
        }

        let attempts = self.creation.attempts;
        let mut last_error: Option<BackendError> = None;
        for attempt in 1..=attempts {
            match materialize(backend, name) {
                Ok(true) => {
                    debug!(table = name, attempt, "table resolved");
                    return Ok(self.commit(name));
                }
                Ok(false) => {
                    warn!(table = name, attempt, "table creation conflicted");
                }
                Err(e) if e.is_transient() => {
                    warn!(table = name, attempt, error = %e, "table creation failed transiently");
                    last_error = Some(e);
                }
                Err(e) => {
                    self.forget_name_lock(name, &lock);
                    return Err(StorageError::backend(name, e));
                }
            }

            if let Some(handle) = self.cached(name) {
                return Ok(handle);
            }
            if attempt < attempts {
                std::thread::sleep(self.backoff(&self.creation));
            }
        }

        self.forget_name_lock(name, &lock);
        Err(StorageError::TableCreationFailed {
            table: name.to_string(),
            attempts,
            last_error,
        })
    }

    /// Delete `name` remotely and drop its cached handle.
    ///
    /// Returns whether the table existed. An empty name is a no-op.
    #[instrument(skip(self, backend), level = "debug")]
    pub fn delete_table(&self, backend: &dyn TableBackend, name: &str) -> Result<bool> {
        if name.is_empty() {
            return Ok(false);
        }
        let handle = self.resolve(backend, name, ResolveMode::DELETE)?;
        let existed = backend
            .delete_table(handle.name())
            .map_err(|e| StorageError::backend(name, e))?;
        debug!(table = name, existed, "table deleted");
        self.evict(name)?;
        Ok(existed)
    }

    /// Remove the cached handle, waiting out any creation in progress.
    pub fn evict(&self, name: &str) -> Result<()> {
        let lock = self.name_lock(name);
        let attempts = self.eviction.attempts;
        for attempt in 1..=attempts {
            let wait = self.backoff(&self.eviction);
            if let Some(_held) = lock.try_lock_for(wait) {
                self.handles.remove(name);
                self.forget_name_lock(name, &lock);
                return Ok(());
            }
            warn!(table = name, attempt, "cached handle is busy, eviction retried");
        }
        warn!(
            table = name,
            attempts, "table deleted remotely but its cached handle was not evicted"
        );
        Err(StorageError::CacheEvictionFailed {
            table: name.to_string(),
            attempts,
        })
    }

    /// Insert unless another caller already committed a handle.
    fn commit(&self, name: &str) -> TableHandle {
        self.handles
            .entry(name.to_string())
            .or_insert_with(|| TableHandle::new(name))
            .value()
            .clone()
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.name_locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the map's entry for `name` if `lock` is it and nobody else holds a clone.
    fn forget_name_lock(&self, name: &str, lock: &Arc<Mutex<()>>) {
        self.name_locks
            .remove_if(name, |_, held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) == 2);
    }

    #[cfg(test)]
    fn name_lock_count(&self) -> usize {
        self.name_locks.len()
    }

    fn backoff(&self, policy: &RetryPolicy) -> Duration {
        let jitter = if policy.jitter_ms == 0 {
            0
        } else {
            self.jitter.lock().random_range(0..=policy.jitter_ms)
        };
        policy.base_delay() + Duration::from_millis(jitter)
    }
}

/// `Ok(true)` once the table exists, `Ok(false)` on a create conflict.
fn materialize(backend: &dyn TableBackend, name: &str) -> std::result::Result<bool, BackendError> {
    if backend.table_exists(name)? {
        return Ok(true);
    }
    Ok(backend.create_table(name)? == CreateOutcome::Created)
}

/// Backend naming rule: 3-63 ASCII alphanumerics starting with a letter.
pub fn validate_table_name(name: &str) -> Result<()> {
    let valid_len = (MIN_TABLE_NAME_LEN..=MAX_TABLE_NAME_LEN).contains(&name.len());
    let starts_with_letter = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    if valid_len && starts_with_letter && name.chars().all(|c| c.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(StorageError::Configuration(format!(
            "invalid table name {name:?}: expected {MIN_TABLE_NAME_LEN}-{MAX_TABLE_NAME_LEN} alphanumeric characters starting with a letter"
        )))
    }
}
