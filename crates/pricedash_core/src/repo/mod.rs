//! Repository contract and key-value store implementation.
//!
//! # Responsibility
//! - Define a storage-agnostic CRUD/batch/query contract over keyed records.
//! - Isolate native request shapes (expressions, placeholders, chunking)
//!   from callers.
//!
//! # Invariants
//! - Keys are derived from records by a pure extractor; records embed their
//!   key fields.
//! - `get`, `delete` and `partial_update` report a missing item as
//!   `RepoError::NotFound` and never create one.
//! - Batch operations are chunked to the store's limits; chunks run
//!   concurrently and a failing chunk does not roll back the others.
//! - `query` returns exactly `limit` items when at least that many match,
//!   and a cursor that resumes right after the last returned item.
//!
//! # See also
//! - `crate::store` for the native request contract.

mod error;
mod query;
mod table;

pub use error::{RepoError, RepoResult};
pub use table::TableRepository;

use crate::predicate::{Predicate, Scalar};
use crate::store::Item;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Pure function deriving a record's key.
pub type KeyExtractor<K, V> = Arc<dyn Fn(&V) -> K + Send + Sync>;

/// Key/record pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<K, V> {
    pub key: K,
    pub value: V,
}

impl<K, V> Entry<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }
}

/// Partial set of fields to write onto an existing record.
///
/// `None` marks a field as absent: it is skipped, not removed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    fields: BTreeMap<String, Option<Value>>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), Some(value.into()));
        self
    }

    pub fn unset(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), None);
        self
    }

    /// Builds a patch from a serializable partial record; `null` fields are absent.
    pub fn from_serializable<T: Serialize>(partial: &T) -> RepoResult<Self> {
        match serde_json::to_value(partial)? {
            Value::Object(map) => Ok(Self {
                fields: map
                    .into_iter()
                    .map(|(field, value)| (field, (!value.is_null()).then_some(value)))
                    .collect(),
            }),
            other => Err(RepoError::InvalidRecord(format!(
                "patch must serialize to an object, got {other}"
            ))),
        }
    }

    /// Fields with a value, in field-name order.
    pub fn present(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields
            .iter()
            .filter_map(|(field, value)| value.as_ref().map(|value| (field.as_str(), value)))
    }

    pub fn is_empty(&self) -> bool {
        self.present().next().is_none()
    }
}

/// Key plus the patch to apply to its record.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchEntry<K> {
    pub key: K,
    pub patch: Patch,
}

impl<K> PatchEntry<K> {
    pub fn new(key: K, patch: Patch) -> Self {
        Self { key, patch }
    }
}

/// Where a query reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTarget {
    /// The table itself, with the named attribute as partition key.
    Primary(String),
    /// A registered secondary index.
    Index(String),
}

/// Comparison applied to the range (sort) key of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeBound {
    Eq(Scalar),
    Lt(Scalar),
    Le(Scalar),
    Gt(Scalar),
    Ge(Scalar),
    Between(Scalar, Scalar),
    BeginsWith(String),
}

/// Range-key condition on a named attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeCondition {
    pub field: String,
    pub bound: RangeBound,
}

impl RangeCondition {
    pub fn new(field: impl Into<String>, bound: RangeBound) -> Self {
        Self {
            field: field.into(),
            bound,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::new(field, RangeBound::Eq(value.into()))
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::new(field, RangeBound::Lt(value.into()))
    }

    pub fn le(field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::new(field, RangeBound::Le(value.into()))
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::new(field, RangeBound::Gt(value.into()))
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Scalar>) -> Self {
        Self::new(field, RangeBound::Ge(value.into()))
    }

    pub fn between(
        field: impl Into<String>,
        low: impl Into<Scalar>,
        high: impl Into<Scalar>,
    ) -> Self {
        Self::new(field, RangeBound::Between(low.into(), high.into()))
    }

    pub fn begins_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::new(field, RangeBound::BeginsWith(prefix.into()))
    }
}

/// Opaque continuation token returned by `query`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(Item);

impl Cursor {
    pub(crate) fn from_item(item: Item) -> Self {
        Self(item)
    }

    pub(crate) fn into_item(self) -> Item {
        self.0
    }

    /// Key attributes this cursor resumes after.
    pub fn as_item(&self) -> &Item {
        &self.0
    }
}

/// Arguments of `Repository::query`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryArgs {
    pub target: Option<QueryTarget>,
    pub partition: Option<Scalar>,
    pub range: Option<RangeCondition>,
    /// Native order when `true`, reversed otherwise.
    pub forward: bool,
    pub start_key: Option<Cursor>,
    /// Unset means every matching item.
    pub limit: Option<usize>,
    pub filter: Option<Predicate>,
}

impl Default for QueryArgs {
    fn default() -> Self {
        Self {
            target: None,
            partition: None,
            range: None,
            forward: true,
            start_key: None,
            limit: None,
            filter: None,
        }
    }
}

impl QueryArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_index(mut self, name: impl Into<String>) -> Self {
        self.target = Some(QueryTarget::Index(name.into()));
        self
    }

    pub fn on_primary(mut self, partition_field: impl Into<String>) -> Self {
        self.target = Some(QueryTarget::Primary(partition_field.into()));
        self
    }

    pub fn partition(mut self, value: impl Into<Scalar>) -> Self {
        self.partition = Some(value.into());
        self
    }

    pub fn range(mut self, condition: RangeCondition) -> Self {
        self.range = Some(condition);
        self
    }

    pub fn backward(mut self) -> Self {
        self.forward = false;
        self
    }

    pub fn start_key(mut self, cursor: Cursor) -> Self {
        self.start_key = Some(cursor);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }
}

/// Result page of `Repository::query`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutput<K, V> {
    pub items: Vec<Entry<K, V>>,
    /// Set when more items may follow; pass back as `QueryArgs::start_key`.
    pub last_evaluated_key: Option<Cursor>,
}

/// Storage-agnostic contract over keyed records.
///
/// Batch methods may partially apply: chunks are independent requests.
/// Every chunk is awaited before a batch call reports the first failure.
#[async_trait]
pub trait Repository<K, V>: Send + Sync
where
    K: Send + 'static,
    V: Send + 'static,
{
    /// Writes `value` under `key`, replacing any existing record.
    async fn put(&self, key: K, value: V) -> RepoResult<()>;

    /// Writes every entry; for repeated keys the last entry wins.
    async fn put_many(&self, entries: Vec<Entry<K, V>>) -> RepoResult<()>;

    async fn get(&self, key: K) -> RepoResult<V>;

    /// Returns the records found; missing keys are omitted.
    async fn get_many(&self, keys: Vec<K>) -> RepoResult<Vec<V>>;

    async fn delete(&self, key: K) -> RepoResult<()>;

    /// Deletes without existence checks.
    async fn delete_many(&self, keys: Vec<K>) -> RepoResult<()>;

    async fn partial_update(&self, key: K, patch: Patch) -> RepoResult<()>;

    /// Applies patches atomically per chunk of the store's transaction limit.
    async fn partial_update_many(&self, entries: Vec<PatchEntry<K>>) -> RepoResult<()>;

    async fn query(&self, args: QueryArgs) -> RepoResult<QueryOutput<K, V>>;
}
