//! Paginated query engine.
//!
//! # Responsibility
//! - Route a `QueryArgs` to a native Query (index or table partition) or a
//!   native Scan, once per call.
//! - Follow continuation keys until the caller's limit is met or the store
//!   reports no more items, then cut the result back to exactly `limit`.
//!
//! # Invariants
//! - Every native request of one call carries the same routing, key
//!   condition and filter; only the start key changes.
//! - No page cap is sent to the store: its own page limits decide page size.
//! - A truncated result resumes after its last item: the cursor is that
//!   item's extracted key plus, for index routes, the index key attributes.

use super::table::{from_item, to_item, TableRepository};
use super::{
    Cursor, Entry, QueryArgs, QueryOutput, QueryTarget, RangeBound, RangeCondition, RepoError,
    RepoResult,
};
use crate::config::IndexDescriptor;
use crate::predicate::compile;
use crate::store::{
    AttributeNames, AttributeValues, Item, NativeStore, PageOutput, QueryInput, ScanInput,
};
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Native request parameters shared by every page of one call.
struct QueryPlan<'a> {
    index: Option<(&'a str, &'a IndexDescriptor)>,
    /// `None` routes to a scan.
    key_condition: Option<String>,
    filter: Option<String>,
    names: AttributeNames,
    values: AttributeValues,
    forward: bool,
}

impl QueryPlan<'_> {
    fn route(&self) -> &'static str {
        match (&self.key_condition, self.index) {
            (Some(_), Some(_)) => "index_query",
            (Some(_), None) => "table_query",
            (None, Some(_)) => "index_scan",
            (None, None) => "table_scan",
        }
    }
}

impl<K, V, S> TableRepository<K, V, S>
where
    K: Serialize + DeserializeOwned + Send + Sync + 'static,
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
    S: NativeStore,
{
    pub(super) async fn run_query(&self, args: QueryArgs) -> RepoResult<QueryOutput<K, V>> {
        if args.limit == Some(0) {
            return Ok(QueryOutput {
                items: Vec::new(),
                last_evaluated_key: args.start_key,
            });
        }

        let plan = self.plan(&args)?;
        debug!(
            "event=repo_query module=repo status=start table={} route={} limit={:?}",
            self.options.table_name,
            plan.route(),
            args.limit
        );

        let mut items: Vec<Item> = Vec::new();
        let mut start = args.start_key.clone().map(Cursor::into_item);
        let mut pages = 0usize;
        loop {
            let page = self.fetch(&plan, start).await?;
            pages += 1;
            items.extend(page.items);
            start = page.last_evaluated_key;
            debug!(
                "event=repo_query module=repo status=fetching table={} page={} accumulated={} more={}",
                self.options.table_name,
                pages,
                items.len(),
                start.is_some()
            );

            let satisfied = args.limit.is_some_and(|limit| items.len() >= limit);
            if satisfied || start.is_none() {
                break;
            }
        }

        let truncated = match args.limit {
            Some(limit) if items.len() > limit => {
                items.truncate(limit);
                true
            }
            _ => false,
        };
        let last_raw = if truncated { items.last().cloned() } else { None };

        let entries = items
            .into_iter()
            .map(|item| -> RepoResult<Entry<K, V>> {
                let value: V = from_item(item)?;
                Ok(Entry::new((self.extractor)(&value), value))
            })
            .collect::<RepoResult<Vec<_>>>()?;

        let last_evaluated_key = match (last_raw, entries.last()) {
            (Some(raw), Some(last)) => Some(truncation_cursor(
                &last.key,
                &raw,
                plan.index.map(|(_, index)| index),
            )?),
            _ => start.map(Cursor::from_item),
        };

        debug!(
            "event=repo_query module=repo status=ok state={} table={} pages={} items={} more={}",
            if truncated { "truncated_done" } else { "done" },
            self.options.table_name,
            pages,
            entries.len(),
            last_evaluated_key.is_some()
        );
        Ok(QueryOutput {
            items: entries,
            last_evaluated_key,
        })
    }

    fn plan<'a>(&'a self, args: &'a QueryArgs) -> RepoResult<QueryPlan<'a>> {
        let index = match &args.target {
            Some(QueryTarget::Index(name)) => {
                let descriptor = self
                    .options
                    .indexes
                    .get(name)
                    .ok_or_else(|| RepoError::UnknownIndex(name.clone()))?;
                Some((name.as_str(), descriptor))
            }
            _ => None,
        };
        let partition_field = match (&args.target, index) {
            (_, Some((_, descriptor))) => Some(descriptor.partition_key.as_str()),
            (Some(QueryTarget::Primary(field)), None) => Some(field.as_str()),
            _ => None,
        };

        let mut names = AttributeNames::new();
        let mut values = AttributeValues::new();
        let mut key_terms = Vec::new();
        let mut filter_terms = Vec::new();

        if let (Some(field), Some(partition)) = (partition_field, &args.partition) {
            names.insert("#pk".to_string(), field.to_string());
            values.insert(":pk".to_string(), partition.to_value());
            key_terms.push("#pk = :pk".to_string());
        }
        if let Some(range) = &args.range {
            let term = range_expression(range, &mut names, &mut values);
            if key_terms.is_empty() {
                filter_terms.push(format!("({term})"));
            } else {
                key_terms.push(term);
            }
        }
        if let Some(filter) = &args.filter {
            let compiled = compile(filter, 0)?;
            names.extend(compiled.names);
            values.extend(compiled.values);
            filter_terms.push(compiled.expression);
        }

        Ok(QueryPlan {
            index,
            key_condition: (!key_terms.is_empty()).then(|| key_terms.join(" AND ")),
            filter: (!filter_terms.is_empty()).then(|| filter_terms.join(" AND ")),
            names,
            values,
            forward: args.forward,
        })
    }

    async fn fetch(&self, plan: &QueryPlan<'_>, start: Option<Item>) -> RepoResult<PageOutput> {
        let table_name = self.options.table_name.clone();
        let index_name = plan.index.map(|(name, _)| name.to_string());
        let result = match &plan.key_condition {
            Some(key_condition) => {
                self.store
                    .query(QueryInput {
                        table_name,
                        index_name,
                        key_condition_expression: key_condition.clone(),
                        filter_expression: plan.filter.clone(),
                        expression_attribute_names: plan.names.clone(),
                        expression_attribute_values: plan.values.clone(),
                        exclusive_start_key: start,
                        limit: None,
                        scan_index_forward: plan.forward,
                    })
                    .await
            }
            None => {
                self.store
                    .scan(ScanInput {
                        table_name,
                        index_name,
                        filter_expression: plan.filter.clone(),
                        expression_attribute_names: plan.names.clone(),
                        expression_attribute_values: plan.values.clone(),
                        exclusive_start_key: start,
                        limit: None,
                    })
                    .await
            }
        };
        result.map_err(|err| self.store_failure("repo_query", err))
    }
}

/// Renders a range-key condition, registering `#sk` / `:sk*` placeholders.
fn range_expression(
    range: &RangeCondition,
    names: &mut AttributeNames,
    values: &mut AttributeValues,
) -> String {
    names.insert("#sk".to_string(), range.field.clone());
    let mut bind = |placeholder: &str, value: serde_json::Value| {
        values.insert(placeholder.to_string(), value);
    };

    match &range.bound {
        RangeBound::Eq(value) => {
            bind(":sk", value.to_value());
            "#sk = :sk".to_string()
        }
        RangeBound::Lt(value) => {
            bind(":sk", value.to_value());
            "#sk < :sk".to_string()
        }
        RangeBound::Le(value) => {
            bind(":sk", value.to_value());
            "#sk <= :sk".to_string()
        }
        RangeBound::Gt(value) => {
            bind(":sk", value.to_value());
            "#sk > :sk".to_string()
        }
        RangeBound::Ge(value) => {
            bind(":sk", value.to_value());
            "#sk >= :sk".to_string()
        }
        RangeBound::Between(low, high) => {
            bind(":sk_lo", low.to_value());
            bind(":sk_hi", high.to_value());
            "#sk BETWEEN :sk_lo AND :sk_hi".to_string()
        }
        RangeBound::BeginsWith(prefix) => {
            bind(":sk", serde_json::Value::String(prefix.clone()));
            "begins_with(#sk, :sk)".to_string()
        }
    }
}

fn truncation_cursor<K: Serialize>(
    key: &K,
    raw: &Item,
    index: Option<&IndexDescriptor>,
) -> RepoResult<Cursor> {
    let mut cursor = to_item(key)?;
    if let Some(index) = index {
        for attribute in [&index.partition_key, &index.range_key] {
            if let Some(value) = raw.get(attribute) {
                cursor.insert(attribute.clone(), value.clone());
            }
        }
    }
    Ok(Cursor::from_item(cursor))
}
