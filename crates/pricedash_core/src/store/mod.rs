//! Native key-value store contract.
//!
//! # Responsibility
//! - Describe the request/response shapes of a partitioned document store
//!   with secondary indexes, query/scan paging and placeholder-based
//!   expressions.
//! - Keep the adapter in `repo` independent of any concrete client.
//!
//! # Invariants
//! - Every placeholder referenced by an expression must be defined in the
//!   request, and every defined placeholder must be referenced.
//! - Batch requests are bounded by the `*_MAX_*` constants below.
//! - A page carries `last_evaluated_key` only when the store stopped early.

pub(crate) mod expr;
pub mod memory;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub use memory::{MemoryStats, MemoryStore, MemoryStoreOptions, TableSchema};

/// Stored document: attribute name -> value.
pub type Item = Map<String, Value>;
/// `#placeholder` -> attribute name.
pub type AttributeNames = BTreeMap<String, String>;
/// `:placeholder` -> value.
pub type AttributeValues = BTreeMap<String, Value>;

/// Max put/delete requests in one `batch_write_item` call.
pub const BATCH_WRITE_MAX_ITEMS: usize = 25;
/// Max keys in one `batch_get_item` call.
pub const BATCH_GET_MAX_KEYS: usize = 100;
/// Max updates in one `transact_write_items` call.
pub const TRANSACT_WRITE_MAX_ITEMS: usize = 25;

/// Cancellation code reported for a failed condition inside a transaction.
pub const CONDITIONAL_CHECK_FAILED: &str = "ConditionalCheckFailed";
/// Cancellation code reported for transaction members that did not fail.
pub const CANCELLATION_NONE: &str = "None";

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a native store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A condition expression evaluated to false.
    ConditionalCheckFailed,
    /// A transaction was rolled back; one code per member, in request order.
    TransactionCanceled { reasons: Vec<String> },
    /// Unknown table or index.
    ResourceNotFound(String),
    /// Malformed request (bad expression, key schema mismatch, limits).
    Validation(String),
    /// Request rate exceeded the provisioned capacity.
    ThroughputExceeded(String),
    /// Network or client failure before the store answered.
    Transport(String),
}

impl StoreError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ThroughputExceeded(_) | Self::Transport(_))
    }

    /// Whether a transaction was cancelled because a member's condition failed.
    pub fn has_failed_condition(&self) -> bool {
        match self {
            Self::ConditionalCheckFailed => true,
            Self::TransactionCanceled { reasons } => reasons
                .iter()
                .any(|reason| reason == CONDITIONAL_CHECK_FAILED),
            _ => false,
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConditionalCheckFailed => write!(f, "the conditional request failed"),
            Self::TransactionCanceled { reasons } => write!(
                f,
                "transaction cancelled, please refer cancellation reasons for specific reasons [{}]",
                reasons.join(", ")
            ),
            Self::ResourceNotFound(message) => write!(f, "requested resource not found: {message}"),
            Self::Validation(message) => write!(f, "validation error: {message}"),
            Self::ThroughputExceeded(message) => {
                write!(f, "provisioned throughput exceeded: {message}")
            }
            Self::Transport(message) => write!(f, "transport failure: {message}"),
        }
    }
}

impl Error for StoreError {}

#[derive(Debug, Clone, PartialEq)]
pub struct GetItemInput {
    pub table_name: String,
    pub key: Item,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutItemInput {
    pub table_name: String,
    pub item: Item,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteItemInput {
    pub table_name: String,
    pub key: Item,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: AttributeNames,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateItemInput {
    pub table_name: String,
    pub key: Item,
    /// `SET #a = :a, ...` / `REMOVE #b`.
    pub update_expression: String,
    pub condition_expression: Option<String>,
    pub expression_attribute_names: AttributeNames,
    pub expression_attribute_values: AttributeValues,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    Put { item: Item },
    Delete { key: Item },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchWriteItemInput {
    pub table_name: String,
    pub requests: Vec<WriteRequest>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchWriteItemOutput {
    /// Requests the store accepted but did not apply.
    pub unprocessed: Vec<WriteRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchGetItemInput {
    pub table_name: String,
    pub keys: Vec<Item>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetItemOutput {
    /// Found items, in no particular order.
    pub items: Vec<Item>,
    pub unprocessed_keys: Vec<Item>,
}

/// All-or-nothing group of conditional updates.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactWriteItemsInput {
    pub updates: Vec<UpdateItemInput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryInput {
    pub table_name: String,
    pub index_name: Option<String>,
    /// `#pk = :pk` optionally followed by `AND <range condition>`.
    pub key_condition_expression: String,
    pub filter_expression: Option<String>,
    pub expression_attribute_names: AttributeNames,
    pub expression_attribute_values: AttributeValues,
    pub exclusive_start_key: Option<Item>,
    /// Max items evaluated (not returned) by this request.
    pub limit: Option<usize>,
    pub scan_index_forward: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanInput {
    pub table_name: String,
    pub index_name: Option<String>,
    pub filter_expression: Option<String>,
    pub expression_attribute_names: AttributeNames,
    pub expression_attribute_values: AttributeValues,
    pub exclusive_start_key: Option<Item>,
    pub limit: Option<usize>,
}

/// One page of a query or scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageOutput {
    pub items: Vec<Item>,
    pub last_evaluated_key: Option<Item>,
}

/// Native operations of the backing store.
#[async_trait]
pub trait NativeStore: Send + Sync {
    async fn get_item(&self, input: GetItemInput) -> StoreResult<Option<Item>>;

    async fn put_item(&self, input: PutItemInput) -> StoreResult<()>;

    async fn delete_item(&self, input: DeleteItemInput) -> StoreResult<()>;

    async fn update_item(&self, input: UpdateItemInput) -> StoreResult<()>;

    async fn batch_write_item(&self, input: BatchWriteItemInput)
        -> StoreResult<BatchWriteItemOutput>;

    async fn batch_get_item(&self, input: BatchGetItemInput) -> StoreResult<BatchGetItemOutput>;

    async fn transact_write_items(&self, input: TransactWriteItemsInput) -> StoreResult<()>;

    async fn query(&self, input: QueryInput) -> StoreResult<PageOutput>;

    async fn scan(&self, input: ScanInput) -> StoreResult<PageOutput>;
}
