use pricedash_core::store::StoreError;
use pricedash_core::{
    price_key, Entry, Granularity, MemoryStore, Patch, PatchEntry, PriceData, PriceKey, RepoError,
    Repository, TableOptions, TableRepository, TableSchema,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

const TABLE: &str = "PriceData";

async fn price_repo() -> (Arc<MemoryStore>, TableRepository<PriceKey, PriceData, MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store
        .create_table(TableSchema::new(TABLE, "coin_id").with_range_key("timestamp_currency"))
        .await
        .unwrap();
    let repo = TableRepository::new(Arc::clone(&store), TableOptions::new(TABLE), price_key);
    (store, repo)
}

fn records(coin: &str, count: usize) -> Vec<PriceData> {
    (0..count)
        .map(|i| {
            PriceData::new(
                coin,
                "usd",
                format!("{:013}", 1_700_000_000_000u64 + i as u64),
                i as f64,
                Granularity::Hourly,
            )
        })
        .collect()
}

fn entries(records: &[PriceData]) -> Vec<Entry<PriceKey, PriceData>> {
    records
        .iter()
        .map(|record| Entry::new(record.key(), record.clone()))
        .collect()
}

#[tokio::test]
async fn put_many_chunks_by_25_and_get_many_returns_all() {
    let (store, repo) = price_repo().await;
    let seeded = records("bitcoin", 60);

    repo.put_many(entries(&seeded)).await.unwrap();
    assert_eq!(store.stats().batch_write_item, 3);

    let loaded = repo
        .get_many(seeded.iter().map(PriceData::key).collect())
        .await
        .unwrap();
    assert_eq!(loaded.len(), 60);
    assert_eq!(store.stats().batch_get_item, 1);
}

#[tokio::test]
async fn empty_batches_issue_no_requests() {
    let (store, repo) = price_repo().await;

    repo.put_many(Vec::new()).await.unwrap();
    repo.delete_many(Vec::new()).await.unwrap();
    repo.partial_update_many(Vec::new()).await.unwrap();
    assert!(repo.get_many(Vec::new()).await.unwrap().is_empty());

    let stats = store.stats();
    assert_eq!(stats.batch_write_item, 0);
    assert_eq!(stats.batch_get_item, 0);
    assert_eq!(stats.transact_write_items, 0);
}

#[tokio::test]
async fn get_many_omits_missing_and_collapses_duplicates() {
    let (store, repo) = price_repo().await;
    let seeded = records("bitcoin", 230);
    repo.put_many(entries(&seeded)).await.unwrap();

    let mut keys: Vec<PriceKey> = seeded.iter().map(PriceData::key).collect();
    keys.extend(records("dogecoin", 10).iter().map(PriceData::key));
    keys.extend(seeded[..10].iter().map(PriceData::key));

    let loaded = repo.get_many(keys).await.unwrap();

    assert_eq!(loaded.len(), 230);
    let unique: HashSet<String> = loaded.iter().map(|r| r.timestamp_currency.clone()).collect();
    assert_eq!(unique.len(), 230);
    // 240 distinct keys -> chunks of 100, 100, 40.
    assert_eq!(store.stats().batch_get_item, 3);
}

#[tokio::test]
async fn delete_many_removes_all_and_tolerates_missing() {
    let (store, repo) = price_repo().await;
    let seeded = records("bitcoin", 30);
    repo.put_many(entries(&seeded)).await.unwrap();

    let mut keys: Vec<PriceKey> = seeded.iter().map(PriceData::key).collect();
    keys.push(PriceKey::new("dogecoin", "1", "usd"));
    repo.delete_many(keys).await.unwrap();

    assert!(store.items(TABLE).await.unwrap().is_empty());
    assert_eq!(store.stats().batch_write_item, 2 + 2);
}

#[tokio::test]
async fn failing_chunk_does_not_roll_back_other_chunks() {
    let (store, repo) = price_repo().await;
    let mut seeded = records("bitcoin", 25);
    seeded.extend(records("dogecoin", 25));
    store.fail_writes_matching("coin_id", json!("dogecoin")).await;

    let err = repo.put_many(entries(&seeded)).await.unwrap_err();

    assert!(matches!(
        err,
        RepoError::Store(StoreError::ThroughputExceeded(_))
    ));
    assert!(err.is_transient());
    let items = store.items(TABLE).await.unwrap();
    assert_eq!(items.len(), 25);
    assert!(items.iter().all(|item| item["coin_id"] == json!("bitcoin")));
}

#[tokio::test]
async fn failing_first_chunk_still_sends_later_chunks() {
    let (store, repo) = price_repo().await;
    let mut seeded = records("dogecoin", 25);
    seeded.extend(records("bitcoin", 25));
    store.fail_writes_matching("coin_id", json!("dogecoin")).await;

    let err = repo.put_many(entries(&seeded)).await.unwrap_err();

    assert!(matches!(
        err,
        RepoError::Store(StoreError::ThroughputExceeded(_))
    ));
    assert_eq!(store.stats().batch_write_item, 2);
    let items = store.items(TABLE).await.unwrap();
    assert_eq!(items.len(), 25);
    assert!(items.iter().all(|item| item["coin_id"] == json!("bitcoin")));
}

#[tokio::test]
async fn delete_many_sends_every_chunk_when_the_first_fails() {
    let (store, repo) = price_repo().await;
    let mut seeded = records("dogecoin", 25);
    seeded.extend(records("bitcoin", 10));
    repo.put_many(entries(&seeded)).await.unwrap();
    store.fail_writes_matching("coin_id", json!("dogecoin")).await;

    let err = repo
        .delete_many(seeded.iter().map(PriceData::key).collect())
        .await
        .unwrap_err();

    assert!(err.is_transient());
    let items = store.items(TABLE).await.unwrap();
    assert_eq!(items.len(), 25);
    assert!(items.iter().all(|item| item["coin_id"] == json!("dogecoin")));
}

#[tokio::test]
async fn put_many_keeps_the_last_entry_for_a_repeated_key() {
    let (store, repo) = price_repo().await;
    let first = records("bitcoin", 1).remove(0);
    let mut second = first.clone();
    second.price = 42.0;
    let other = records("ethereum", 1).remove(0);

    repo.put_many(entries(&[first.clone(), other, second.clone()]))
        .await
        .unwrap();

    assert_eq!(store.stats().batch_write_item, 1);
    assert_eq!(store.items(TABLE).await.unwrap().len(), 2);
    assert_eq!(repo.get(first.key()).await.unwrap(), second);
}

#[tokio::test]
async fn partial_update_many_commits_later_chunks_when_the_first_is_cancelled() {
    let (store, repo) = price_repo().await;
    let seeded = records("bitcoin", 30);
    repo.put_many(entries(&seeded)).await.unwrap();

    let mut patches = vec![PatchEntry::new(
        PriceKey::new("bitcoin", "0000000000000", "usd"),
        Patch::new().set("price", -1.0),
    )];
    patches.extend(
        seeded
            .iter()
            .map(|record| PatchEntry::new(record.key(), Patch::new().set("price", -1.0))),
    );

    let err = repo.partial_update_many(patches).await.unwrap_err();
    assert!(matches!(err, RepoError::NotFound(_)));
    assert_eq!(store.stats().transact_write_items, 2);

    let updated = store
        .items(TABLE)
        .await
        .unwrap()
        .iter()
        .filter(|item| item["price"] == json!(-1.0))
        .count();
    // First chunk (missing + 24) cancelled, second chunk (6) committed.
    assert_eq!(updated, 6);
}

#[tokio::test]
async fn partial_update_many_updates_every_record_in_transactions_of_25() {
    let (store, repo) = price_repo().await;
    let seeded = records("bitcoin", 30);
    repo.put_many(entries(&seeded)).await.unwrap();

    let patches = seeded
        .iter()
        .map(|record| PatchEntry::new(record.key(), Patch::new().set("price", 99.0)))
        .collect();
    repo.partial_update_many(patches).await.unwrap();

    assert_eq!(store.stats().transact_write_items, 2);
    let items = store.items(TABLE).await.unwrap();
    assert!(items.iter().all(|item| item["price"] == json!(99.0)));
    assert!(items.iter().all(|item| item["updatedAt"].is_string()));
}

#[tokio::test]
async fn partial_update_many_is_atomic_per_chunk_only() {
    let (store, repo) = price_repo().await;
    let seeded = records("bitcoin", 29);
    repo.put_many(entries(&seeded)).await.unwrap();

    let mut patches: Vec<PatchEntry<PriceKey>> = seeded
        .iter()
        .map(|record| PatchEntry::new(record.key(), Patch::new().set("price", -1.0)))
        .collect();
    patches.push(PatchEntry::new(
        PriceKey::new("bitcoin", "0000000000000", "usd"),
        Patch::new().set("price", -1.0),
    ));

    let err = repo.partial_update_many(patches).await.unwrap_err();
    assert!(matches!(err, RepoError::NotFound(_)));

    let items = store.items(TABLE).await.unwrap();
    assert_eq!(items.len(), 29);
    let updated = items
        .iter()
        .filter(|item| item["price"] == json!(-1.0))
        .count();
    // First chunk (25) committed, second chunk (4 + missing) cancelled.
    assert_eq!(updated, 25);
}
