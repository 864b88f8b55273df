//! # Data Model
//!
//! Core data structures for table entities: the two-part key, the optimistic
//! concurrency token, typed field values and the write operation kinds the
//! backend understands.

use crate::config::TABLE_NAME_SUFFIX;
use crate::error::{Result, StorageError};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

/// System property holding the partition key.
pub const PARTITION_KEY: &str = "PartitionKey";
/// System property holding the row key.
pub const ROW_KEY: &str = "RowKey";
/// System property holding the backend's last-modified time.
pub const TIMESTAMP: &str = "Timestamp";

/// Backend type of a field or literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdmType {
    String,
    Boolean,
    Int32,
    Int64,
    Double,
    DateTime,
    Guid,
    Binary,
}

impl EdmType {
    pub fn name(&self) -> &'static str {
        match self {
            EdmType::String => "Edm.String",
            EdmType::Boolean => "Edm.Boolean",
            EdmType::Int32 => "Edm.Int32",
            EdmType::Int64 => "Edm.Int64",
            EdmType::Double => "Edm.Double",
            EdmType::DateTime => "Edm.DateTime",
            EdmType::Guid => "Edm.Guid",
            EdmType::Binary => "Edm.Binary",
        }
    }
}

impl fmt::Display for EdmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    DateTime(OffsetDateTime),
    Guid(Uuid),
    Binary(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> EdmType {
        match self {
            Value::String(_) => EdmType::String,
            Value::Bool(_) => EdmType::Boolean,
            Value::Int32(_) => EdmType::Int32,
            Value::Int64(_) => EdmType::Int64,
            Value::Double(_) => EdmType::Double,
            Value::DateTime(_) => EdmType::DateTime,
            Value::Guid(_) => EdmType::Guid,
            Value::Binary(_) => EdmType::Binary,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<OffsetDateTime> for Value {
    fn from(value: OffsetDateTime) -> Self {
        Value::DateTime(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Guid(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Binary(value)
    }
}

/// Extraction of a concrete Rust type from a [`Value`].
pub trait FromValue: Sized {
    const EDM_TYPE: EdmType;

    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_from_value {
    ($ty:ty, $variant:ident, $edm:ident) => {
        impl FromValue for $ty {
            const EDM_TYPE: EdmType = EdmType::$edm;

            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_from_value!(String, String, String);
impl_from_value!(bool, Bool, Boolean);
impl_from_value!(i32, Int32, Int32);
impl_from_value!(i64, Int64, Int64);
impl_from_value!(f64, Double, Double);
impl_from_value!(OffsetDateTime, DateTime, DateTime);
impl_from_value!(Uuid, Guid, Guid);
impl_from_value!(Vec<u8>, Binary, Binary);

/// Opaque optimistic-concurrency marker assigned by the backend on every write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of an entity inside a table. Orders by partition, then row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub partition_key: String,
    pub row_key: String,
}

impl EntityKey {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:?}, {:?})", self.partition_key, self.row_key)
    }
}

/// A schema-less table row.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub partition_key: String,
    pub row_key: String,
    /// Absent when the prior version is unknown.
    pub version: Option<VersionToken>,
    /// Last-modified time, maintained by the backend.
    pub timestamp: Option<OffsetDateTime>,
    pub fields: BTreeMap<String, Value>,
}

impl Entity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            version: None,
            timestamp: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: VersionToken) -> Self {
        self.version = Some(version);
        self
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.partition_key.clone(), self.row_key.clone())
    }

    /// Look up a property by name, including the system properties.
    pub fn property(&self, name: &str) -> Option<Cow<'_, Value>> {
        match name {
            PARTITION_KEY => Some(Cow::Owned(Value::String(self.partition_key.clone()))),
            ROW_KEY => Some(Cow::Owned(Value::String(self.row_key.clone()))),
            TIMESTAMP => self.timestamp.map(|ts| Cow::Owned(Value::DateTime(ts))),
            _ => self.fields.get(name).map(Cow::Borrowed),
        }
    }

    /// Remove and convert a required field.
    pub fn take<T: FromValue>(&mut self, name: &str) -> Result<T> {
        let value = self
            .fields
            .remove(name)
            .ok_or_else(|| StorageError::InvalidEntity {
                key: self.key(),
                reason: format!("missing field {name}"),
            })?;
        let found = value.data_type();
        T::from_value(value).ok_or_else(|| {
            StorageError::TypeMismatch(format!(
                "field {name} of entity {} is {found}, expected {}",
                self.key(),
                T::EDM_TYPE
            ))
        })
    }

    /// Remove and convert an optional field.
    pub fn take_opt<T: FromValue>(&mut self, name: &str) -> Result<Option<T>> {
        if self.fields.contains_key(name) {
            self.take(name).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Both keys must be non-empty before an entity reaches the backend.
    pub fn validate(&self) -> Result<()> {
        if self.partition_key.is_empty() {
            return Err(StorageError::InvalidEntity {
                key: self.key(),
                reason: "partition key is empty".to_string(),
            });
        }
        if self.row_key.is_empty() {
            return Err(StorageError::InvalidEntity {
                key: self.key(),
                reason: "row key is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Conversion between a typed record and a table [`Entity`].
///
/// The table a record lives in defaults to its type name with underscores
/// removed and a `Table` suffix, e.g. `Sensor_Reading` maps to
/// `SensorReadingTable`.
pub trait TableRecord: Sized {
    const TYPE_NAME: &'static str;

    fn to_entity(&self) -> Entity;

    fn from_entity(entity: Entity) -> Result<Self>;

    fn default_table_name() -> String {
        default_table_name(Self::TYPE_NAME)
    }
}

pub fn default_table_name(type_name: &str) -> String {
    let mut name: String = type_name.chars().filter(|c| *c != '_').collect();
    name.push_str(TABLE_NAME_SUFFIX);
    name
}

impl TableRecord for Entity {
    const TYPE_NAME: &'static str = "Entity";

    fn to_entity(&self) -> Entity {
        self.clone()
    }

    fn from_entity(entity: Entity) -> Result<Self> {
        Ok(entity)
    }
}

/// Write operations accepted by a backend batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Replace,
    Merge,
    Delete,
    InsertOrReplace,
    InsertOrMerge,
}

impl OperationKind {
    /// Concurrency-checked kinds need the row's current version token.
    pub fn requires_version(self) -> bool {
        matches!(
            self,
            OperationKind::Replace | OperationKind::Merge | OperationKind::Delete
        )
    }

    /// Kinds that may bring a row into existence.
    pub fn creates_rows(self) -> bool {
        matches!(
            self,
            OperationKind::Insert | OperationKind::InsertOrReplace | OperationKind::InsertOrMerge
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Replace => "replace",
            OperationKind::Merge => "merge",
            OperationKind::Delete => "delete",
            OperationKind::InsertOrReplace => "insert_or_replace",
            OperationKind::InsertOrMerge => "insert_or_merge",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entry of a backend batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub kind: OperationKind,
    pub entity: Entity,
}

impl Mutation {
    pub fn new(kind: OperationKind, entity: Entity) -> Self {
        Self { kind, entity }
    }
}
