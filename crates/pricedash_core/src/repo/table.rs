//! `Repository` over a single native-store table.
//!
//! # Responsibility
//! - Translate repository calls into native requests: key items, condition
//!   expressions, update expressions and batch/transaction chunks.
//! - Map native failures to repository semantics (`NotFound`).
//!
//! # Invariants
//! - Existence checks condition on `attribute_exists` of every key field.
//! - `put` stamps `createdAt` (epoch millis) only if the record has none;
//!   `partial_update` always stamps `updatedAt` (RFC 3339, millis, UTC).
//! - Unprocessed batch items are logged and not retried.
//! - Batch chunks all run to completion; the call then fails with the first
//!   chunk error in chunk order.

use super::{
    Entry, KeyExtractor, Patch, PatchEntry, QueryArgs, QueryOutput, RepoError, RepoResult,
    Repository,
};
use crate::config::{ConfigError, TableOptions};
use crate::store::{
    AttributeNames, AttributeValues, BatchGetItemInput, BatchWriteItemInput, DeleteItemInput,
    GetItemInput, Item, NativeStore, PutItemInput, StoreError, StoreResult,
    TransactWriteItemsInput,
    UpdateItemInput, WriteRequest, BATCH_GET_MAX_KEYS, BATCH_WRITE_MAX_ITEMS,
    TRANSACT_WRITE_MAX_ITEMS,
};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::future::join_all;
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub(crate) const CREATED_AT: &str = "createdAt";
pub(crate) const UPDATED_AT: &str = "updatedAt";

/// Table-backed repository for records `V` keyed by `K`.
pub struct TableRepository<K, V, S> {
    pub(super) store: Arc<S>,
    pub(super) options: TableOptions,
    pub(super) extractor: KeyExtractor<K, V>,
}

impl<K, V, S> TableRepository<K, V, S>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: NativeStore,
{
    /// Creates a repository without validating `options`.
    pub fn new(
        store: Arc<S>,
        options: TableOptions,
        extractor: impl Fn(&V) -> K + Send + Sync + 'static,
    ) -> Self {
        Self {
            store,
            options,
            extractor: Arc::new(extractor),
        }
    }

    /// Validates `options` and creates a repository.
    pub fn from_options(
        store: Arc<S>,
        options: TableOptions,
        extractor: impl Fn(&V) -> K + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self::new(store, options, extractor))
    }

    pub fn table_name(&self) -> &str {
        &self.options.table_name
    }

    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    pub(super) fn store_failure(&self, event: &str, err: StoreError) -> RepoError {
        error!(
            "event={} module=repo status=error table={} error={}",
            event, self.options.table_name, err
        );
        RepoError::Store(err)
    }

    fn update_input(&self, key: Item, patch: &Patch, updated_at: &str) -> UpdateItemInput {
        let mut names = AttributeNames::new();
        let mut values = AttributeValues::new();
        let mut assignments = Vec::new();

        let stamp = Value::String(updated_at.to_string());
        let fields = patch
            .present()
            .filter(|(field, _)| !key.contains_key(*field) && *field != UPDATED_AT)
            .chain(std::iter::once((UPDATED_AT, &stamp)));
        for (i, (field, value)) in fields.enumerate() {
            names.insert(format!("#u{i}"), field.to_string());
            values.insert(format!(":u{i}"), value.clone());
            assignments.push(format!("#u{i} = :u{i}"));
        }

        let condition = key_exists_condition(&key, &mut names);
        UpdateItemInput {
            table_name: self.options.table_name.clone(),
            key,
            update_expression: format!("SET {}", assignments.join(", ")),
            condition_expression: Some(condition),
            expression_attribute_names: names,
            expression_attribute_values: values,
        }
    }

    async fn batch_write(&self, event: &str, requests: Vec<WriteRequest>) -> RepoResult<()> {
        if requests.is_empty() {
            return Ok(());
        }

        let chunks = requests
            .chunks(BATCH_WRITE_MAX_ITEMS)
            .map(|chunk| {
                self.store.batch_write_item(BatchWriteItemInput {
                    table_name: self.options.table_name.clone(),
                    requests: chunk.to_vec(),
                })
            })
            .collect::<Vec<_>>();
        let chunk_count = chunks.len();
        let outputs = settle(join_all(chunks).await)
            .map_err(|err| self.store_failure(event, err))?;

        for output in outputs {
            if !output.unprocessed.is_empty() {
                warn!(
                    "event={} module=repo status=partial table={} unprocessed={}",
                    event,
                    self.options.table_name,
                    output.unprocessed.len()
                );
            }
        }
        debug!(
            "event={} module=repo status=ok table={} requests={} chunks={}",
            event,
            self.options.table_name,
            requests.len(),
            chunk_count
        );
        Ok(())
    }

    fn unique_key_items(&self, keys: Vec<K>) -> RepoResult<Vec<Item>> {
        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(keys.len());
        for key in keys {
            let item = to_item(&key)?;
            if seen.insert(render_key(&item)) {
                unique.push(item);
            }
        }
        Ok(unique)
    }
}

#[async_trait]
impl<K, V, S> Repository<K, V> for TableRepository<K, V, S>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: NativeStore,
{
    async fn put(&self, key: K, value: V) -> RepoResult<()> {
        let key = to_item(&key)?;
        let mut item = to_item(&value)?;
        item.extend(key);
        if !item.contains_key(CREATED_AT) {
            item.insert(CREATED_AT.to_string(), Value::from(Utc::now().timestamp_millis()));
        }

        self.store
            .put_item(PutItemInput {
                table_name: self.options.table_name.clone(),
                item,
            })
            .await
            .map_err(|err| self.store_failure("repo_put", err))?;
        debug!(
            "event=repo_put module=repo status=ok table={}",
            self.options.table_name
        );
        Ok(())
    }

    async fn put_many(&self, entries: Vec<Entry<K, V>>) -> RepoResult<()> {
        // The store rejects repeated keys within one batch.
        let mut positions = HashMap::new();
        let mut requests = Vec::with_capacity(entries.len());
        for entry in &entries {
            let mut item = to_item(&entry.key)?;
            let rendered = render_key(&item);
            item.extend(to_item(&entry.value)?);
            let request = WriteRequest::Put { item };
            match positions.get(&rendered) {
                Some(&at) => requests[at] = request,
                None => {
                    positions.insert(rendered, requests.len());
                    requests.push(request);
                }
            }
        }
        self.batch_write("repo_put_many", requests).await
    }

    async fn get(&self, key: K) -> RepoResult<V> {
        let key = to_item(&key)?;
        let rendered = render_key(&key);
        let found = self
            .store
            .get_item(GetItemInput {
                table_name: self.options.table_name.clone(),
                key,
            })
            .await
            .map_err(|err| self.store_failure("repo_get", err))?;

        match found {
            Some(item) => from_item(item),
            None => Err(RepoError::NotFound(rendered)),
        }
    }

    async fn get_many(&self, keys: Vec<K>) -> RepoResult<Vec<V>> {
        let keys = self.unique_key_items(keys)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = keys
            .chunks(BATCH_GET_MAX_KEYS)
            .map(|chunk| {
                self.store.batch_get_item(BatchGetItemInput {
                    table_name: self.options.table_name.clone(),
                    keys: chunk.to_vec(),
                })
            })
            .collect::<Vec<_>>();
        let outputs = settle(join_all(chunks).await)
            .map_err(|err| self.store_failure("repo_get_many", err))?;

        let mut records = Vec::new();
        for output in outputs {
            if !output.unprocessed_keys.is_empty() {
                warn!(
                    "event=repo_get_many module=repo status=partial table={} unprocessed={}",
                    self.options.table_name,
                    output.unprocessed_keys.len()
                );
            }
            for item in output.items {
                records.push(from_item(item)?);
            }
        }
        Ok(records)
    }

    async fn delete(&self, key: K) -> RepoResult<()> {
        let key = to_item(&key)?;
        let rendered = render_key(&key);
        let mut names = AttributeNames::new();
        let condition = key_exists_condition(&key, &mut names);

        let result = self
            .store
            .delete_item(DeleteItemInput {
                table_name: self.options.table_name.clone(),
                key,
                condition_expression: Some(condition),
                expression_attribute_names: names,
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(StoreError::ConditionalCheckFailed) => Err(RepoError::NotFound(rendered)),
            Err(err) => Err(self.store_failure("repo_delete", err)),
        }
    }

    async fn delete_many(&self, keys: Vec<K>) -> RepoResult<()> {
        let requests = self
            .unique_key_items(keys)?
            .into_iter()
            .map(|key| WriteRequest::Delete { key })
            .collect();
        self.batch_write("repo_delete_many", requests).await
    }

    async fn partial_update(&self, key: K, patch: Patch) -> RepoResult<()> {
        let key = to_item(&key)?;
        let rendered = render_key(&key);
        let input = self.update_input(key, &patch, &now_rfc3339());

        match self.store.update_item(input).await {
            Ok(()) => Ok(()),
            Err(StoreError::ConditionalCheckFailed) => Err(RepoError::NotFound(rendered)),
            Err(err) => Err(self.store_failure("repo_partial_update", err)),
        }
    }

    async fn partial_update_many(&self, entries: Vec<PatchEntry<K>>) -> RepoResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let updated_at = now_rfc3339();
        let updates = entries
            .iter()
            .map(|entry| -> RepoResult<UpdateItemInput> {
                Ok(self.update_input(to_item(&entry.key)?, &entry.patch, &updated_at))
            })
            .collect::<RepoResult<Vec<_>>>()?;

        let chunks = updates
            .chunks(TRANSACT_WRITE_MAX_ITEMS)
            .map(|chunk| {
                self.store.transact_write_items(TransactWriteItemsInput {
                    updates: chunk.to_vec(),
                })
            })
            .collect::<Vec<_>>();
        match settle(join_all(chunks).await) {
            Ok(_) => {
                debug!(
                    "event=repo_partial_update_many module=repo status=ok table={} updates={}",
                    self.options.table_name,
                    updates.len()
                );
                Ok(())
            }
            Err(err) if err.has_failed_condition() => {
                warn!(
                    "event=repo_partial_update_many module=repo status=not_found table={} error={}",
                    self.options.table_name, err
                );
                Err(RepoError::NotFound(format!(
                    "one or more of {} keys",
                    updates.len()
                )))
            }
            Err(err) => Err(self.store_failure("repo_partial_update_many", err)),
        }
    }

    async fn query(&self, args: QueryArgs) -> RepoResult<QueryOutput<K, V>> {
        self.run_query(args).await
    }
}

/// Collects settled chunk results, failing with the first error.
fn settle<T>(results: Vec<StoreResult<T>>) -> StoreResult<Vec<T>> {
    let failed = results.iter().filter(|result| result.is_err()).count();
    let mut outputs = Vec::with_capacity(results.len());
    for result in results {
        match result {
            Ok(output) => outputs.push(output),
            Err(err) => {
                if failed > 1 {
                    warn!("event=repo_batch module=repo status=error failed_chunks={failed}");
                }
                return Err(err);
            }
        }
    }
    Ok(outputs)
}

/// Builds `attribute_exists(#k0) AND ...` over every key field.
fn key_exists_condition(key: &Item, names: &mut AttributeNames) -> String {
    key.keys()
        .enumerate()
        .map(|(i, field)| {
            names.insert(format!("#k{i}"), field.clone());
            format!("attribute_exists(#k{i})")
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

pub(super) fn to_item<T: Serialize>(value: &T) -> RepoResult<Item> {
    match serde_json::to_value(value)? {
        Value::Object(item) => Ok(item),
        other => Err(RepoError::InvalidRecord(format!(
            "expected an object, got {other}"
        ))),
    }
}

pub(super) fn from_item<T: DeserializeOwned>(item: Item) -> RepoResult<T> {
    Ok(serde_json::from_value(Value::Object(item))?)
}

fn render_key(key: &Item) -> String {
    Value::Object(key.clone()).to_string()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
