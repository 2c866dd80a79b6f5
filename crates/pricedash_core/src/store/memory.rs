//! In-process implementation of the native store.
//!
//! # Responsibility
//! - Hold tables (partition key, optional range key, sparse secondary
//!   indexes) in memory behind one async `RwLock`.
//! - Enforce the same request validation and paging rules a hosted store
//!   applies, so adapter bugs surface in tests.
//!
//! # Invariants
//! - Queries and scans walk items in key order (index key, then table key).
//! - A page stops after `page_item_limit` evaluated items or once
//!   `page_byte_limit` serialized bytes have been read; the continuation
//!   key is the last evaluated item's key and is set only if items remain.
//! - Transactions validate every member condition before applying any write.

use super::expr::{self, Bindings, Condition, PlaceholderUsage, UpdateAction};
use super::{
    AttributeNames, AttributeValues, BatchGetItemInput, BatchGetItemOutput, BatchWriteItemInput,
    BatchWriteItemOutput, DeleteItemInput, GetItemInput, Item, NativeStore, PageOutput,
    PutItemInput, QueryInput, ScanInput, StoreError, StoreResult, TransactWriteItemsInput,
    UpdateItemInput, WriteRequest, BATCH_GET_MAX_KEYS, BATCH_WRITE_MAX_ITEMS, CANCELLATION_NONE,
    CONDITIONAL_CHECK_FAILED, TRANSACT_WRITE_MAX_ITEMS,
};
use crate::config::IndexDescriptor;
use async_trait::async_trait;
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use tokio::sync::RwLock;

static NAME_ALIAS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^#[A-Za-z0-9_]+$").expect("valid name alias regex"));
static VALUE_ALIAS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^:[A-Za-z0-9_]+$").expect("valid value alias regex"));

const DEFAULT_PAGE_ITEM_LIMIT: usize = 100;
const DEFAULT_PAGE_BYTE_LIMIT: usize = 1024 * 1024;

/// Paging caps applied to every query/scan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStoreOptions {
    pub page_item_limit: usize,
    pub page_byte_limit: usize,
}

impl Default for MemoryStoreOptions {
    fn default() -> Self {
        Self {
            page_item_limit: DEFAULT_PAGE_ITEM_LIMIT,
            page_byte_limit: DEFAULT_PAGE_BYTE_LIMIT,
        }
    }
}

/// Key schema of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub partition_key: String,
    pub range_key: Option<String>,
    pub indexes: BTreeMap<String, IndexDescriptor>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition_key: partition_key.into(),
            range_key: None,
            indexes: BTreeMap::new(),
        }
    }

    pub fn with_range_key(mut self, range_key: impl Into<String>) -> Self {
        self.range_key = Some(range_key.into());
        self
    }

    pub fn with_index(mut self, name: impl Into<String>, index: IndexDescriptor) -> Self {
        self.indexes.insert(name.into(), index);
        self
    }
}

/// Request counters, one per native operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub get_item: usize,
    pub put_item: usize,
    pub delete_item: usize,
    pub update_item: usize,
    pub batch_write_item: usize,
    pub batch_get_item: usize,
    pub transact_write_items: usize,
    pub query: usize,
    pub scan: usize,
}

#[derive(Default)]
struct Counters {
    get_item: AtomicUsize,
    put_item: AtomicUsize,
    delete_item: AtomicUsize,
    update_item: AtomicUsize,
    batch_write_item: AtomicUsize,
    batch_get_item: AtomicUsize,
    transact_write_items: AtomicUsize,
    query: AtomicUsize,
    scan: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, AtomicOrdering::Relaxed);
}

#[derive(Debug, Clone)]
enum KeyValue {
    Number(f64),
    String(String),
}

impl KeyValue {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_f64().map(Self::Number),
            Value::String(text) => Some(Self::String(text.clone())),
            _ => None,
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(lhs), Self::Number(rhs)) => lhs.total_cmp(rhs),
            (Self::Number(_), Self::String(_)) => Ordering::Less,
            (Self::String(_), Self::Number(_)) => Ordering::Greater,
            (Self::String(lhs), Self::String(rhs)) => lhs.cmp(rhs),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

type PrimaryKey = (KeyValue, Option<KeyValue>);

/// Sort position of an item within a table or index walk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Position {
    index: Option<(KeyValue, KeyValue)>,
    primary: PrimaryKey,
}

struct MemoryTable {
    schema: TableSchema,
    rows: BTreeMap<PrimaryKey, Item>,
}

impl MemoryTable {
    fn key_attribute_count(&self) -> usize {
        1 + usize::from(self.schema.range_key.is_some())
    }

    fn index(&self, name: &str) -> StoreResult<&IndexDescriptor> {
        self.schema.indexes.get(name).ok_or_else(|| {
            StoreError::Validation(format!(
                "the table does not have the specified index: {name}"
            ))
        })
    }

    /// Primary key of a full item (extra attributes allowed).
    fn primary_key_of(&self, item: &Item) -> StoreResult<PrimaryKey> {
        let partition = scalar_key(item, &self.schema.partition_key)?;
        let range = match &self.schema.range_key {
            Some(range_key) => Some(scalar_key(item, range_key)?),
            None => None,
        };
        Ok((partition, range))
    }

    /// Primary key of a request key (exactly the key attributes).
    fn key_from_request(&self, key: &Item) -> StoreResult<PrimaryKey> {
        if key.len() != self.key_attribute_count() {
            return Err(StoreError::Validation(
                "the provided key element does not match the schema".to_string(),
            ));
        }
        self.primary_key_of(key)
    }

    fn key_names(&self) -> (&str, Option<&str>) {
        (
            self.schema.partition_key.as_str(),
            self.schema.range_key.as_deref(),
        )
    }

    fn candidates(&self, index: Option<&IndexDescriptor>) -> Vec<(Position, &Item)> {
        match index {
            None => self
                .rows
                .iter()
                .map(|(primary, item)| {
                    (
                        Position {
                            index: None,
                            primary: primary.clone(),
                        },
                        item,
                    )
                })
                .collect(),
            Some(index) => {
                let mut entries: Vec<(Position, &Item)> = self
                    .rows
                    .iter()
                    .filter_map(|(primary, item)| {
                        let partition = KeyValue::from_value(item.get(&index.partition_key)?)?;
                        let range = KeyValue::from_value(item.get(&index.range_key)?)?;
                        Some((
                            Position {
                                index: Some((partition, range)),
                                primary: primary.clone(),
                            },
                            item,
                        ))
                    })
                    .collect();
                entries.sort_by(|lhs, rhs| lhs.0.cmp(&rhs.0));
                entries
            }
        }
    }

    fn position_of(&self, key: &Item, index: Option<&IndexDescriptor>) -> StoreResult<Position> {
        let invalid = || StoreError::Validation("the provided starting key is invalid".to_string());
        let primary = self.primary_key_of(key).map_err(|_| invalid())?;
        let index = match index {
            Some(index) => {
                let partition = key
                    .get(&index.partition_key)
                    .and_then(KeyValue::from_value)
                    .ok_or_else(invalid)?;
                let range = key
                    .get(&index.range_key)
                    .and_then(KeyValue::from_value)
                    .ok_or_else(invalid)?;
                Some((partition, range))
            }
            None => None,
        };
        Ok(Position { index, primary })
    }

    /// Key attributes of `item` used as a continuation token.
    fn key_item(&self, item: &Item, index: Option<&IndexDescriptor>) -> Item {
        let (partition_key, range_key) = self.key_names();
        let mut names = vec![partition_key];
        names.extend(range_key);
        if let Some(index) = index {
            names.push(index.partition_key.as_str());
            names.push(index.range_key.as_str());
        }

        names
            .into_iter()
            .filter_map(|name| item.get(name).map(|value| (name.to_string(), value.clone())))
            .collect()
    }
}

fn scalar_key(item: &Item, attribute: &str) -> StoreResult<KeyValue> {
    item.get(attribute)
        .and_then(KeyValue::from_value)
        .ok_or_else(|| {
            StoreError::Validation(format!(
                "one or more parameter values were invalid: missing or non-scalar key attribute {attribute}"
            ))
        })
}

fn item_size(item: &Item) -> usize {
    serde_json::to_vec(item).map_or(0, |bytes| bytes.len())
}

fn check_aliases(names: &AttributeNames, values: &AttributeValues) -> StoreResult<()> {
    if let Some(bad) = names.keys().find(|name| !NAME_ALIAS_RE.is_match(name)) {
        return Err(StoreError::Validation(format!(
            "expression attribute names must start with '#' and contain only [A-Za-z0-9_]: {bad}"
        )));
    }
    if let Some(bad) = values.keys().find(|value| !VALUE_ALIAS_RE.is_match(value)) {
        return Err(StoreError::Validation(format!(
            "expression attribute values must start with ':' and contain only [A-Za-z0-9_]: {bad}"
        )));
    }
    Ok(())
}

fn parse_condition_field(
    source: Option<&str>,
    label: &str,
    usage: &mut PlaceholderUsage,
) -> StoreResult<Option<Condition>> {
    let Some(source) = source else {
        return Ok(None);
    };
    let condition = expr::parse_condition(source)
        .map_err(|err| StoreError::Validation(format!("invalid {label}: {err}")))?;
    usage.condition(&condition);
    Ok(Some(condition))
}

fn check_usage(usage: &PlaceholderUsage, bindings: Bindings<'_>) -> StoreResult<()> {
    usage.check(bindings).map_err(StoreError::Validation)
}

/// Key conditions allow one partition equality plus one range condition.
fn check_key_condition(
    condition: &Condition,
    bindings: Bindings<'_>,
    partition_key: &str,
    range_key: Option<&str>,
) -> StoreResult<()> {
    let unsupported = || StoreError::Validation("query key condition not supported".to_string());
    let mut partition_terms = 0;
    let mut range_terms = 0;

    for term in condition.conjuncts() {
        let (path, is_equality) = match term {
            Condition::Compare(expr::Operand::Path(path), op, expr::Operand::Value(_)) => {
                if *op == expr::Comparator::Ne {
                    return Err(unsupported());
                }
                (path, *op == expr::Comparator::Eq)
            }
            Condition::Between(
                expr::Operand::Path(path),
                expr::Operand::Value(_),
                expr::Operand::Value(_),
            )
            | Condition::BeginsWith(expr::Operand::Path(path), expr::Operand::Value(_)) => {
                (path, false)
            }
            _ => return Err(unsupported()),
        };

        let name = bindings.attribute_name(path).ok_or_else(unsupported)?;
        if name == partition_key && is_equality {
            partition_terms += 1;
        } else if Some(name) == range_key {
            range_terms += 1;
        } else {
            return Err(unsupported());
        }
    }

    if partition_terms != 1 || range_terms > 1 {
        return Err(unsupported());
    }
    Ok(())
}

struct PreparedUpdate {
    table_name: String,
    primary: PrimaryKey,
    actions: Vec<UpdateAction>,
    condition: Option<Condition>,
}

fn prepare_update(table: &MemoryTable, input: &UpdateItemInput) -> StoreResult<PreparedUpdate> {
    let primary = table.key_from_request(&input.key)?;
    check_aliases(
        &input.expression_attribute_names,
        &input.expression_attribute_values,
    )?;

    let mut usage = PlaceholderUsage::default();
    let actions = expr::parse_update(&input.update_expression)
        .map_err(|err| StoreError::Validation(format!("invalid UpdateExpression: {err}")))?;
    usage.update(&actions);
    let condition = parse_condition_field(
        input.condition_expression.as_deref(),
        "ConditionExpression",
        &mut usage,
    )?;

    let bindings = Bindings::new(
        &input.expression_attribute_names,
        &input.expression_attribute_values,
    );
    check_usage(&usage, bindings)?;

    let (partition_key, range_key) = table.key_names();
    for action in &actions {
        let path = match action {
            UpdateAction::Set(path, _) | UpdateAction::Remove(path) => path,
        };
        if let Some(name) = bindings.attribute_name(path) {
            if name == partition_key || Some(name) == range_key {
                return Err(StoreError::Validation(format!(
                    "cannot update attribute {name}; this attribute is part of the key"
                )));
            }
        }
    }

    Ok(PreparedUpdate {
        table_name: input.table_name.clone(),
        primary,
        actions,
        condition,
    })
}

fn condition_holds(
    condition: Option<&Condition>,
    current: Option<&Item>,
    bindings: Bindings<'_>,
) -> bool {
    let empty = Item::new();
    condition.map_or(true, |condition| {
        condition.evaluate(current.unwrap_or(&empty), bindings)
    })
}

#[derive(Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    write_failure: Option<(String, Value)>,
}

impl State {
    fn table(&self, name: &str) -> StoreResult<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::ResourceNotFound(format!("table {name}")))
    }

    fn table_mut(&mut self, name: &str) -> StoreResult<&mut MemoryTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::ResourceNotFound(format!("table {name}")))
    }

    fn check_write_failure(&self, item: &Item) -> StoreResult<()> {
        match &self.write_failure {
            Some((attribute, value))
                if item
                    .get(attribute)
                    .is_some_and(|candidate| expr::values_equal(candidate, value)) =>
            {
                Err(StoreError::ThroughputExceeded(format!(
                    "injected failure for {attribute}={value}"
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Native store kept entirely in process memory.
pub struct MemoryStore {
    state: RwLock<State>,
    options: MemoryStoreOptions,
    counters: Counters,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_options(MemoryStoreOptions::default())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: MemoryStoreOptions) -> Self {
        Self {
            state: RwLock::new(State::default()),
            options,
            counters: Counters::default(),
        }
    }

    /// Creates an empty table. Fails if the name is taken.
    pub async fn create_table(&self, schema: TableSchema) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.tables.contains_key(&schema.name) {
            return Err(StoreError::Validation(format!(
                "table already exists: {}",
                schema.name
            )));
        }
        debug!(
            "event=create_table module=store status=ok table={} indexes={}",
            schema.name,
            schema.indexes.len()
        );
        state.tables.insert(
            schema.name.clone(),
            MemoryTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Makes every write touching an item with `attribute == value` fail
    /// with `ThroughputExceeded`, rejecting the whole request.
    pub async fn fail_writes_matching(&self, attribute: impl Into<String>, value: Value) {
        self.state.write().await.write_failure = Some((attribute.into(), value));
    }

    pub async fn clear_write_failures(&self) {
        self.state.write().await.write_failure = None;
    }

    /// All items of a table in key order.
    pub async fn items(&self, table_name: &str) -> StoreResult<Vec<Item>> {
        let state = self.state.read().await;
        Ok(state.table(table_name)?.rows.values().cloned().collect())
    }

    pub fn stats(&self) -> MemoryStats {
        let load = |counter: &AtomicUsize| counter.load(AtomicOrdering::Relaxed);
        MemoryStats {
            get_item: load(&self.counters.get_item),
            put_item: load(&self.counters.put_item),
            delete_item: load(&self.counters.delete_item),
            update_item: load(&self.counters.update_item),
            batch_write_item: load(&self.counters.batch_write_item),
            batch_get_item: load(&self.counters.batch_get_item),
            transact_write_items: load(&self.counters.transact_write_items),
            query: load(&self.counters.query),
            scan: load(&self.counters.scan),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn page(
        &self,
        table: &MemoryTable,
        index: Option<&IndexDescriptor>,
        candidates: Vec<(Position, &Item)>,
        start: Option<Position>,
        forward: bool,
        filter: Option<&Condition>,
        bindings: Bindings<'_>,
        limit: Option<usize>,
    ) -> StoreResult<PageOutput> {
        if limit == Some(0) {
            return Err(StoreError::Validation(
                "limit must be greater than or equal to 1".to_string(),
            ));
        }
        let item_cap = limit.map_or(self.options.page_item_limit, |limit| {
            limit.min(self.options.page_item_limit)
        });

        let skip = match &start {
            None => 0,
            Some(start) => candidates
                .iter()
                .position(|(position, _)| {
                    if forward {
                        position > start
                    } else {
                        position < start
                    }
                })
                .unwrap_or(candidates.len()),
        };

        let mut items = Vec::new();
        let mut evaluated = 0;
        let mut bytes = 0;
        let mut last_evaluated: Option<&Item> = None;
        let mut stopped_early = false;

        for (_, item) in &candidates[skip..] {
            let size = item_size(item);
            if evaluated == item_cap || (evaluated > 0 && bytes + size > self.options.page_byte_limit)
            {
                stopped_early = true;
                break;
            }
            evaluated += 1;
            bytes += size;
            last_evaluated = Some(*item);
            if filter.map_or(true, |filter| filter.evaluate(item, bindings)) {
                items.push((*item).clone());
            }
        }

        debug!(
            "event=store_page module=store status=ok table={} index={} evaluated={} returned={} more={}",
            table.schema.name,
            index.map_or("-", |index| index.partition_key.as_str()),
            evaluated,
            items.len(),
            stopped_early
        );

        let last_evaluated_key = if stopped_early {
            last_evaluated.map(|item| table.key_item(item, index))
        } else {
            None
        };
        Ok(PageOutput {
            items,
            last_evaluated_key,
        })
    }
}

#[async_trait]
impl NativeStore for MemoryStore {
    async fn get_item(&self, input: GetItemInput) -> StoreResult<Option<Item>> {
        bump(&self.counters.get_item);
        let state = self.state.read().await;
        let table = state.table(&input.table_name)?;
        let primary = table.key_from_request(&input.key)?;
        Ok(table.rows.get(&primary).cloned())
    }

    async fn put_item(&self, input: PutItemInput) -> StoreResult<()> {
        bump(&self.counters.put_item);
        let mut state = self.state.write().await;
        state.check_write_failure(&input.item)?;
        let table = state.table_mut(&input.table_name)?;
        let primary = table.primary_key_of(&input.item)?;
        table.rows.insert(primary, input.item);
        Ok(())
    }

    async fn delete_item(&self, input: DeleteItemInput) -> StoreResult<()> {
        bump(&self.counters.delete_item);
        let mut state = self.state.write().await;
        state.check_write_failure(&input.key)?;
        let table = state.table_mut(&input.table_name)?;
        let primary = table.key_from_request(&input.key)?;

        let values = AttributeValues::new();
        check_aliases(&input.expression_attribute_names, &values)?;
        let mut usage = PlaceholderUsage::default();
        let condition = parse_condition_field(
            input.condition_expression.as_deref(),
            "ConditionExpression",
            &mut usage,
        )?;
        let bindings = Bindings::new(&input.expression_attribute_names, &values);
        check_usage(&usage, bindings)?;

        if !condition_holds(condition.as_ref(), table.rows.get(&primary), bindings) {
            return Err(StoreError::ConditionalCheckFailed);
        }
        table.rows.remove(&primary);
        Ok(())
    }

    async fn update_item(&self, input: UpdateItemInput) -> StoreResult<()> {
        bump(&self.counters.update_item);
        let mut state = self.state.write().await;
        state.check_write_failure(&input.key)?;
        let table = state.table_mut(&input.table_name)?;
        let prepared = prepare_update(table, &input)?;
        let bindings = Bindings::new(
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        );

        let current = table.rows.get(&prepared.primary);
        if !condition_holds(prepared.condition.as_ref(), current, bindings) {
            return Err(StoreError::ConditionalCheckFailed);
        }

        let mut item = current.cloned().unwrap_or_else(|| input.key.clone());
        expr::apply_update(&prepared.actions, &mut item, bindings).map_err(StoreError::Validation)?;
        table.rows.insert(prepared.primary, item);
        Ok(())
    }

    async fn batch_write_item(
        &self,
        input: BatchWriteItemInput,
    ) -> StoreResult<BatchWriteItemOutput> {
        bump(&self.counters.batch_write_item);
        if input.requests.is_empty() || input.requests.len() > BATCH_WRITE_MAX_ITEMS {
            return Err(StoreError::Validation(format!(
                "batch write must contain 1..={BATCH_WRITE_MAX_ITEMS} requests, got {}",
                input.requests.len()
            )));
        }

        let mut state = self.state.write().await;
        for request in &input.requests {
            match request {
                WriteRequest::Put { item } => state.check_write_failure(item)?,
                WriteRequest::Delete { key } => state.check_write_failure(key)?,
            }
        }

        let table = state.table_mut(&input.table_name)?;
        let mut seen = BTreeSet::new();
        let mut resolved = Vec::with_capacity(input.requests.len());
        for request in input.requests {
            let primary = match &request {
                WriteRequest::Put { item } => table.primary_key_of(item)?,
                WriteRequest::Delete { key } => table.key_from_request(key)?,
            };
            if !seen.insert(primary.clone()) {
                return Err(StoreError::Validation(
                    "provided list of item keys contains duplicates".to_string(),
                ));
            }
            resolved.push((primary, request));
        }

        for (primary, request) in resolved {
            match request {
                WriteRequest::Put { item } => {
                    table.rows.insert(primary, item);
                }
                WriteRequest::Delete { .. } => {
                    table.rows.remove(&primary);
                }
            }
        }
        Ok(BatchWriteItemOutput::default())
    }

    async fn batch_get_item(&self, input: BatchGetItemInput) -> StoreResult<BatchGetItemOutput> {
        bump(&self.counters.batch_get_item);
        if input.keys.is_empty() || input.keys.len() > BATCH_GET_MAX_KEYS {
            return Err(StoreError::Validation(format!(
                "batch get must contain 1..={BATCH_GET_MAX_KEYS} keys, got {}",
                input.keys.len()
            )));
        }

        let state = self.state.read().await;
        let table = state.table(&input.table_name)?;
        let mut seen = BTreeSet::new();
        let mut items = Vec::new();
        for key in &input.keys {
            let primary = table.key_from_request(key)?;
            if !seen.insert(primary.clone()) {
                return Err(StoreError::Validation(
                    "provided list of item keys contains duplicates".to_string(),
                ));
            }
            if let Some(item) = table.rows.get(&primary) {
                items.push(item.clone());
            }
        }
        Ok(BatchGetItemOutput {
            items,
            unprocessed_keys: Vec::new(),
        })
    }

    async fn transact_write_items(&self, input: TransactWriteItemsInput) -> StoreResult<()> {
        bump(&self.counters.transact_write_items);
        if input.updates.is_empty() || input.updates.len() > TRANSACT_WRITE_MAX_ITEMS {
            return Err(StoreError::Validation(format!(
                "transaction must contain 1..={TRANSACT_WRITE_MAX_ITEMS} items, got {}",
                input.updates.len()
            )));
        }

        let mut state = self.state.write().await;
        for update in &input.updates {
            state.check_write_failure(&update.key)?;
        }

        let mut prepared = Vec::with_capacity(input.updates.len());
        let mut seen = BTreeSet::new();
        for update in &input.updates {
            let table = state.table(&update.table_name)?;
            let member = prepare_update(table, update)?;
            if !seen.insert((member.table_name.clone(), member.primary.clone())) {
                return Err(StoreError::Validation(
                    "transaction request cannot include multiple operations on one item"
                        .to_string(),
                ));
            }
            prepared.push(member);
        }

        let mut reasons = Vec::with_capacity(prepared.len());
        for (member, update) in prepared.iter().zip(&input.updates) {
            let table = state.table(&member.table_name)?;
            let bindings = Bindings::new(
                &update.expression_attribute_names,
                &update.expression_attribute_values,
            );
            let holds = condition_holds(
                member.condition.as_ref(),
                table.rows.get(&member.primary),
                bindings,
            );
            reasons.push(if holds {
                CANCELLATION_NONE.to_string()
            } else {
                CONDITIONAL_CHECK_FAILED.to_string()
            });
        }
        if reasons.iter().any(|reason| reason != CANCELLATION_NONE) {
            return Err(StoreError::TransactionCanceled { reasons });
        }

        for (member, update) in prepared.into_iter().zip(&input.updates) {
            let bindings = Bindings::new(
                &update.expression_attribute_names,
                &update.expression_attribute_values,
            );
            let table = state.table_mut(&member.table_name)?;
            let mut item = table
                .rows
                .get(&member.primary)
                .cloned()
                .unwrap_or_else(|| update.key.clone());
            expr::apply_update(&member.actions, &mut item, bindings)
                .map_err(StoreError::Validation)?;
            table.rows.insert(member.primary, item);
        }
        Ok(())
    }

    async fn query(&self, input: QueryInput) -> StoreResult<PageOutput> {
        bump(&self.counters.query);
        let state = self.state.read().await;
        let table = state.table(&input.table_name)?;
        let index = input
            .index_name
            .as_deref()
            .map(|name| table.index(name))
            .transpose()?;
        let (partition_key, range_key) = match index {
            Some(index) => (index.partition_key.as_str(), Some(index.range_key.as_str())),
            None => table.key_names(),
        };

        check_aliases(
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        )?;
        let mut usage = PlaceholderUsage::default();
        let key_condition = parse_condition_field(
            Some(input.key_condition_expression.as_str()),
            "KeyConditionExpression",
            &mut usage,
        )?
        .ok_or_else(|| StoreError::Validation("missing KeyConditionExpression".to_string()))?;
        let filter = parse_condition_field(
            input.filter_expression.as_deref(),
            "FilterExpression",
            &mut usage,
        )?;
        let bindings = Bindings::new(
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        );
        check_usage(&usage, bindings)?;
        check_key_condition(&key_condition, bindings, partition_key, range_key)?;

        let mut candidates = table.candidates(index);
        candidates.retain(|(_, item)| key_condition.evaluate(item, bindings));
        if !input.scan_index_forward {
            candidates.reverse();
        }
        let start = input
            .exclusive_start_key
            .as_ref()
            .map(|key| table.position_of(key, index))
            .transpose()?;

        self.page(
            table,
            index,
            candidates,
            start,
            input.scan_index_forward,
            filter.as_ref(),
            bindings,
            input.limit,
        )
    }

    async fn scan(&self, input: ScanInput) -> StoreResult<PageOutput> {
        bump(&self.counters.scan);
        let state = self.state.read().await;
        let table = state.table(&input.table_name)?;
        let index = input
            .index_name
            .as_deref()
            .map(|name| table.index(name))
            .transpose()?;

        check_aliases(
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        )?;
        let mut usage = PlaceholderUsage::default();
        let filter = parse_condition_field(
            input.filter_expression.as_deref(),
            "FilterExpression",
            &mut usage,
        )?;
        let bindings = Bindings::new(
            &input.expression_attribute_names,
            &input.expression_attribute_values,
        );
        check_usage(&usage, bindings)?;

        let candidates = table.candidates(index);
        let start = input
            .exclusive_start_key
            .as_ref()
            .map(|key| table.position_of(key, index))
            .transpose()?;

        self.page(
            table,
            index,
            candidates,
            start,
            true,
            filter.as_ref(),
            bindings,
            input.limit,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryStore, MemoryStoreOptions, TableSchema};
    use crate::config::IndexDescriptor;
    use crate::store::{
        AttributeNames, AttributeValues, BatchWriteItemInput, DeleteItemInput, GetItemInput,
        Item, NativeStore, PutItemInput, QueryInput, ScanInput, StoreError,
        TransactWriteItemsInput, UpdateItemInput, WriteRequest,
    };
    use serde_json::{json, Value};

    fn item(value: Value) -> Item {
        value.as_object().cloned().unwrap()
    }

    fn names(pairs: &[(&str, &str)]) -> AttributeNames {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn values(pairs: &[(&str, Value)]) -> AttributeValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn prices_store(options: MemoryStoreOptions) -> MemoryStore {
        let store = MemoryStore::with_options(options);
        store
            .create_table(
                TableSchema::new("prices", "coin_id")
                    .with_range_key("ts")
                    .with_index("by-currency", IndexDescriptor::new("currency", "ts")),
            )
            .await
            .unwrap();
        for (coin, ts, currency) in [
            ("btc", 1, "usd"),
            ("btc", 2, "eur"),
            ("btc", 3, "usd"),
            ("eth", 1, "usd"),
            ("eth", 2, "eur"),
        ] {
            store
                .put_item(PutItemInput {
                    table_name: "prices".to_string(),
                    item: item(json!({"coin_id": coin, "ts": ts, "currency": currency})),
                })
                .await
                .unwrap();
        }
        store
    }

    fn scan_input(limit: Option<usize>, start: Option<Item>) -> ScanInput {
        ScanInput {
            table_name: "prices".to_string(),
            index_name: None,
            filter_expression: None,
            expression_attribute_names: AttributeNames::new(),
            expression_attribute_values: AttributeValues::new(),
            exclusive_start_key: start,
            limit,
        }
    }

    #[tokio::test]
    async fn scan_pages_by_item_cap_and_resumes_after_cursor() {
        let store = prices_store(MemoryStoreOptions {
            page_item_limit: 2,
            ..MemoryStoreOptions::default()
        })
        .await;

        let first = store.scan(scan_input(None, None)).await.unwrap();
        assert_eq!(first.items.len(), 2);
        let cursor = first.last_evaluated_key.unwrap();
        assert_eq!(Value::Object(cursor.clone()), json!({"coin_id": "btc", "ts": 2}));

        let second = store.scan(scan_input(None, Some(cursor))).await.unwrap();
        assert_eq!(second.items[0]["ts"], json!(3));

        let third = store
            .scan(scan_input(None, second.last_evaluated_key))
            .await
            .unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.last_evaluated_key.is_none());
    }

    #[tokio::test]
    async fn byte_cap_stops_page_but_always_reads_one_item() {
        let store = prices_store(MemoryStoreOptions {
            page_item_limit: 100,
            page_byte_limit: 1,
        })
        .await;

        let page = store.scan(scan_input(None, None)).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.last_evaluated_key.is_some());
    }

    #[tokio::test]
    async fn index_query_walks_index_order_and_reports_index_keys() {
        let store = prices_store(MemoryStoreOptions {
            page_item_limit: 1,
            ..MemoryStoreOptions::default()
        })
        .await;

        let page = store
            .query(QueryInput {
                table_name: "prices".to_string(),
                index_name: Some("by-currency".to_string()),
                key_condition_expression: "#pk = :pk".to_string(),
                filter_expression: None,
                expression_attribute_names: names(&[("#pk", "currency")]),
                expression_attribute_values: values(&[(":pk", json!("usd"))]),
                exclusive_start_key: None,
                limit: None,
                scan_index_forward: true,
            })
            .await
            .unwrap();

        assert_eq!(page.items[0]["coin_id"], json!("btc"));
        assert_eq!(
            Value::Object(page.last_evaluated_key.unwrap()),
            json!({"coin_id": "btc", "ts": 1, "currency": "usd"})
        );
    }

    #[tokio::test]
    async fn query_rejects_non_key_conditions_and_unused_placeholders() {
        let store = prices_store(MemoryStoreOptions::default()).await;
        let base = QueryInput {
            table_name: "prices".to_string(),
            index_name: None,
            key_condition_expression: "#pk = :pk".to_string(),
            filter_expression: None,
            expression_attribute_names: names(&[("#pk", "currency")]),
            expression_attribute_values: values(&[(":pk", json!("usd"))]),
            exclusive_start_key: None,
            limit: None,
            scan_index_forward: true,
        };

        let err = store.query(base.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(message) if message.contains("key condition")));

        let mut unused = base;
        unused.expression_attribute_names = names(&[("#pk", "coin_id"), ("#x", "x")]);
        let err = store.query(unused).await.unwrap_err();
        assert!(matches!(err, StoreError::Validation(message) if message.contains("unused")));
    }

    #[tokio::test]
    async fn conditional_delete_and_update_fail_on_missing_item() {
        let store = prices_store(MemoryStoreOptions::default()).await;
        let key = item(json!({"coin_id": "doge", "ts": 1}));

        let err = store
            .delete_item(DeleteItemInput {
                table_name: "prices".to_string(),
                key: key.clone(),
                condition_expression: Some("attribute_exists(#k0)".to_string()),
                expression_attribute_names: names(&[("#k0", "coin_id")]),
            })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::ConditionalCheckFailed);

        let err = store
            .update_item(UpdateItemInput {
                table_name: "prices".to_string(),
                key: key.clone(),
                update_expression: "SET #u0 = :u0".to_string(),
                condition_expression: Some("attribute_exists(#k0)".to_string()),
                expression_attribute_names: names(&[("#u0", "price"), ("#k0", "coin_id")]),
                expression_attribute_values: values(&[(":u0", json!(1))]),
            })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::ConditionalCheckFailed);

        let absent = store
            .get_item(GetItemInput {
                table_name: "prices".to_string(),
                key,
            })
            .await
            .unwrap();
        assert!(absent.is_none());
    }

    #[tokio::test]
    async fn update_cannot_touch_key_attributes() {
        let store = prices_store(MemoryStoreOptions::default()).await;
        let err = store
            .update_item(UpdateItemInput {
                table_name: "prices".to_string(),
                key: item(json!({"coin_id": "btc", "ts": 1})),
                update_expression: "SET #u0 = :u0".to_string(),
                condition_expression: None,
                expression_attribute_names: names(&[("#u0", "ts")]),
                expression_attribute_values: values(&[(":u0", json!(9))]),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(message) if message.contains("part of the key")));
    }

    #[tokio::test]
    async fn transaction_is_all_or_nothing() {
        let store = prices_store(MemoryStoreOptions::default()).await;
        let update = |coin: &str, price: i64| UpdateItemInput {
            table_name: "prices".to_string(),
            key: item(json!({"coin_id": coin, "ts": 1})),
            update_expression: "SET #u0 = :u0".to_string(),
            condition_expression: Some("attribute_exists(#k0)".to_string()),
            expression_attribute_names: names(&[("#u0", "price"), ("#k0", "coin_id")]),
            expression_attribute_values: values(&[(":u0", json!(price))]),
        };

        let err = store
            .transact_write_items(TransactWriteItemsInput {
                updates: vec![update("btc", 10), update("doge", 20)],
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::TransactionCanceled {
                reasons: vec!["None".to_string(), "ConditionalCheckFailed".to_string()]
            }
        );

        let items = store.items("prices").await.unwrap();
        assert!(items.iter().all(|item| !item.contains_key("price")));
    }

    #[tokio::test]
    async fn batch_write_rejects_duplicates_and_injected_failures() {
        let store = prices_store(MemoryStoreOptions::default()).await;
        let put = |coin: &str| WriteRequest::Put {
            item: item(json!({"coin_id": coin, "ts": 9})),
        };

        let err = store
            .batch_write_item(BatchWriteItemInput {
                table_name: "prices".to_string(),
                requests: vec![put("ada"), put("ada")],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        store.fail_writes_matching("coin_id", json!("sol")).await;
        let err = store
            .batch_write_item(BatchWriteItemInput {
                table_name: "prices".to_string(),
                requests: vec![put("ada"), put("sol")],
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.items("prices").await.unwrap().len(), 5);

        store.clear_write_failures().await;
        store
            .batch_write_item(BatchWriteItemInput {
                table_name: "prices".to_string(),
                requests: vec![put("ada"), put("sol")],
            })
            .await
            .unwrap();
        assert_eq!(store.items("prices").await.unwrap().len(), 7);
        assert_eq!(store.stats().batch_write_item, 3);
    }

    #[tokio::test]
    async fn unknown_table_and_index_are_reported() {
        let store = prices_store(MemoryStoreOptions::default()).await;
        let mut input = scan_input(None, None);
        input.table_name = "missing".to_string();
        assert!(matches!(
            store.scan(input).await.unwrap_err(),
            StoreError::ResourceNotFound(_)
        ));

        let mut input = scan_input(None, None);
        input.index_name = Some("nope".to_string());
        assert!(matches!(
            store.scan(input).await.unwrap_err(),
            StoreError::Validation(_)
        ));
    }
}
