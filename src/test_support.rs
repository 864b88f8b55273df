use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use tablerust_rs::config::RetryPolicy;
use tablerust_rs::{Entity, MemoryBackend, Result, StorageConfig, TableRecord, TableStorage};

pub const PARTITIONS: [&str; 3] = ["Political", "Social", "Nature"];

/// Typed record used across the integration tests.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Event category.
    pub partition_key: String,
    pub row_key: String,
    pub code: Uuid,
    pub number_of_participants: i32,
    pub description: Option<String>,
    pub date_time: OffsetDateTime,
    pub positive: bool,
    pub cost: f64,
}

impl TableRecord for Event {
    const TYPE_NAME: &'static str = "Event";

    fn to_entity(&self) -> Entity {
        let mut entity = Entity::new(self.partition_key.clone(), self.row_key.clone())
            .with_field("Code", self.code)
            .with_field("NumberOfParticipants", self.number_of_participants)
            .with_field("DateTime", self.date_time)
            .with_field("Positive", self.positive)
            .with_field("Cost", self.cost);
        if let Some(description) = &self.description {
            entity.set_field("Description", description.clone());
        }
        entity
    }

    fn from_entity(mut entity: Entity) -> Result<Self> {
        Ok(Self {
            code: entity.take("Code")?,
            number_of_participants: entity.take("NumberOfParticipants")?,
            description: entity.take_opt("Description")?,
            date_time: entity.take("DateTime")?,
            positive: entity.take("Positive")?,
            cost: entity.take("Cost")?,
            partition_key: entity.partition_key,
            row_key: entity.row_key,
        })
    }
}

/// Reference instant the generated event dates count back from.
#[allow(dead_code)]
pub fn base_time() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

/// `count` events spread round-robin over [`PARTITIONS`], one day apart.
#[allow(dead_code)]
pub fn generate_events(count: usize, seed: u64) -> Vec<Event> {
    let mut rng = StdRng::seed_from_u64(seed);
    let base = base_time();
    (0..count)
        .map(|i| {
            let code = uuid::Builder::from_random_bytes(rng.random()).into_uuid();
            let kind = PARTITIONS[i % PARTITIONS.len()];
            Event {
                partition_key: kind.to_string(),
                row_key: code.to_string(),
                code,
                number_of_participants: (i * 1000) as i32,
                description: Some(format!("{kind}{i}")),
                date_time: base - Duration::days(i as i64),
                positive: i % 3 == 0,
                cost: (i as f64 * 1000.0) / 3.0,
            }
        })
        .collect()
}

/// `count` events that all share one partition key, with sequential row keys.
#[allow(dead_code)]
pub fn single_partition_events(partition_key: &str, count: usize) -> Vec<Event> {
    let base = base_time();
    (0..count)
        .map(|i| Event {
            partition_key: partition_key.to_string(),
            row_key: format!("{i:06}"),
            code: Uuid::from_u128(i as u128),
            number_of_participants: i as i32,
            description: None,
            date_time: base,
            positive: true,
            cost: 1.0,
        })
        .collect()
}

/// Configuration that retries without sleeping.
#[allow(dead_code)]
pub fn fast_config() -> StorageConfig {
    StorageConfig {
        table_creation: RetryPolicy::immediate(10),
        cache_eviction: RetryPolicy::immediate(10),
        jitter_seed: Some(42),
        ..StorageConfig::default()
    }
}

/// A facade over a fresh in-memory backend, with the backend kept for inspection.
#[allow(dead_code)]
pub fn memory_storage() -> (Arc<MemoryBackend>, TableStorage) {
    memory_storage_with(MemoryBackend::new())
}

#[allow(dead_code)]
pub fn memory_storage_with(backend: MemoryBackend) -> (Arc<MemoryBackend>, TableStorage) {
    let backend = Arc::new(backend);
    let config = fast_config();
    let cache = Arc::new(tablerust_rs::TableHandleCache::from_config(&config));
    let storage = TableStorage::with_cache(backend.clone(), cache, config);
    (backend, storage)
}

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
