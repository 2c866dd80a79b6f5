use pricedash_core::store::Item;
use pricedash_core::{
    price_key, ConfigError, Granularity, IndexDescriptor, MemoryStore, Patch, PriceData, PriceKey,
    RepoError, Repository, TableOptions, TableRepository, TableSchema,
};
use serde_json::{json, Value};
use std::sync::Arc;

const TABLE: &str = "PriceData";

async fn price_repo() -> (Arc<MemoryStore>, TableRepository<PriceKey, PriceData, MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store
        .create_table(
            TableSchema::new(TABLE, "coin_id")
                .with_range_key("timestamp_currency")
                .with_index(
                    "currency-timestamp",
                    IndexDescriptor::new("currency", "timestamp"),
                ),
        )
        .await
        .unwrap();
    let repo = TableRepository::new(Arc::clone(&store), TableOptions::new(TABLE), price_key);
    (store, repo)
}

async fn value_repo() -> (Arc<MemoryStore>, TableRepository<Value, Value, MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    store
        .create_table(TableSchema::new("things", "id"))
        .await
        .unwrap();
    let repo = TableRepository::new(
        Arc::clone(&store),
        TableOptions::new("things"),
        |value: &Value| json!({ "id": value["id"] }),
    );
    (store, repo)
}

fn btc(timestamp: &str, price: f64) -> PriceData {
    PriceData::new("bitcoin", "usd", timestamp, price, Granularity::Hourly)
}

async fn stored(store: &MemoryStore, table: &str) -> Vec<Item> {
    store.items(table).await.unwrap()
}

#[tokio::test]
async fn put_then_get_roundtrip() {
    let (store, repo) = price_repo().await;
    let record = btc("1700000000000", 37_000.5);

    repo.put(record.key(), record.clone()).await.unwrap();
    let loaded = repo.get(record.key()).await.unwrap();

    assert_eq!(loaded, record);
    let items = stored(&store, TABLE).await;
    assert_eq!(items.len(), 1);
    assert!(items[0]["createdAt"].is_i64());
}

#[tokio::test]
async fn put_merges_key_fields_into_item() {
    let (store, repo) = value_repo().await;

    repo.put(json!({"id": "a"}), json!({"v": 1})).await.unwrap();

    let items = stored(&store, "things").await;
    assert_eq!(items[0]["id"], json!("a"));
    assert_eq!(items[0]["v"], json!(1));
}

#[tokio::test]
async fn put_keeps_existing_created_at() {
    let (store, repo) = value_repo().await;

    repo.put(json!({"id": "a"}), json!({"id": "a", "createdAt": 5}))
        .await
        .unwrap();

    assert_eq!(stored(&store, "things").await[0]["createdAt"], json!(5));
}

#[tokio::test]
async fn put_replaces_existing_record() {
    let (_store, repo) = price_repo().await;
    let record = btc("1", 1.0);
    repo.put(record.key(), record.clone()).await.unwrap();

    let mut replacement = record.clone();
    replacement.price = 2.0;
    replacement.market_cap = Some(10.0);
    repo.put(record.key(), replacement.clone()).await.unwrap();

    assert_eq!(repo.get(record.key()).await.unwrap(), replacement);
}

#[tokio::test]
async fn get_missing_is_not_found() {
    let (store, repo) = price_repo().await;

    let err = repo
        .get(PriceKey::new("bitcoin", "1", "usd"))
        .await
        .unwrap_err();

    assert!(matches!(err, RepoError::NotFound(key) if key.contains("bitcoin")));
    assert!(stored(&store, TABLE).await.is_empty());
}

#[tokio::test]
async fn delete_removes_existing_record() {
    let (store, repo) = price_repo().await;
    let record = btc("1", 1.0);
    repo.put(record.key(), record.clone()).await.unwrap();

    repo.delete(record.key()).await.unwrap();

    assert!(matches!(
        repo.get(record.key()).await,
        Err(RepoError::NotFound(_))
    ));
    assert!(stored(&store, TABLE).await.is_empty());
}

#[tokio::test]
async fn delete_missing_is_not_found_and_leaves_table_untouched() {
    let (store, repo) = price_repo().await;
    let record = btc("1", 1.0);
    repo.put(record.key(), record.clone()).await.unwrap();

    let err = repo
        .delete(PriceKey::new("bitcoin", "2", "usd"))
        .await
        .unwrap_err();

    assert!(matches!(err, RepoError::NotFound(_)));
    assert_eq!(stored(&store, TABLE).await.len(), 1);
}

#[tokio::test]
async fn partial_update_sets_fields_and_stamps_updated_at() {
    let (store, repo) = price_repo().await;
    let record = btc("1", 1.0);
    repo.put(record.key(), record.clone()).await.unwrap();

    repo.partial_update(
        record.key(),
        Patch::new()
            .set("price", 2.5)
            .set("volume_24h", 1_000)
            .unset("market_cap"),
    )
    .await
    .unwrap();

    let loaded = repo.get(record.key()).await.unwrap();
    assert_eq!(loaded.price, 2.5);
    assert_eq!(loaded.volume_24h, Some(1_000.0));
    assert_eq!(loaded.market_cap, None);

    let item = &stored(&store, TABLE).await[0];
    let updated_at = item["updatedAt"].as_str().unwrap();
    assert!(updated_at.ends_with('Z'));
    assert!(chrono::DateTime::parse_from_rfc3339(updated_at).is_ok());
    assert!(item.contains_key("createdAt"));
}

#[tokio::test]
async fn partial_update_ignores_key_fields() {
    let (_store, repo) = price_repo().await;
    let record = btc("1", 1.0);
    repo.put(record.key(), record.clone()).await.unwrap();

    repo.partial_update(
        record.key(),
        Patch::new().set("coin_id", "ethereum").set("price", 3.0),
    )
    .await
    .unwrap();

    let loaded = repo.get(record.key()).await.unwrap();
    assert_eq!(loaded.coin_id, "bitcoin");
    assert_eq!(loaded.price, 3.0);
}

#[tokio::test]
async fn partial_update_from_serializable_skips_null_fields() {
    #[derive(serde::Serialize)]
    struct PriceChange {
        price: Option<f64>,
        price_change_24h: Option<f64>,
    }

    let (_store, repo) = price_repo().await;
    let mut record = btc("1", 1.0);
    record.price_change_24h = Some(-0.5);
    repo.put(record.key(), record.clone()).await.unwrap();

    let patch = Patch::from_serializable(&PriceChange {
        price: Some(1.2),
        price_change_24h: None,
    })
    .unwrap();
    repo.partial_update(record.key(), patch).await.unwrap();

    let loaded = repo.get(record.key()).await.unwrap();
    assert_eq!(loaded.price, 1.2);
    assert_eq!(loaded.price_change_24h, Some(-0.5));
}

#[tokio::test]
async fn partial_update_missing_is_not_found_and_creates_nothing() {
    let (store, repo) = price_repo().await;

    let err = repo
        .partial_update(
            PriceKey::new("bitcoin", "1", "usd"),
            Patch::new().set("price", 1.0),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RepoError::NotFound(_)));
    assert!(stored(&store, TABLE).await.is_empty());
}

#[tokio::test]
async fn missing_table_surfaces_store_error() {
    let store = Arc::new(MemoryStore::new());
    let repo: TableRepository<PriceKey, PriceData, MemoryStore> =
        TableRepository::new(store, TableOptions::new("Missing"), price_key);

    let err = repo
        .get(PriceKey::new("bitcoin", "1", "usd"))
        .await
        .unwrap_err();

    assert!(matches!(err, RepoError::Store(_)));
    assert!(!err.is_transient());
}

#[test]
fn from_options_validates_configuration() {
    let store = Arc::new(MemoryStore::new());
    let result = TableRepository::<PriceKey, PriceData, MemoryStore>::from_options(
        store,
        TableOptions::new("PriceData")
            .with_index("by-coin", IndexDescriptor::new("coin_id", "coin_id")),
        price_key,
    );

    assert!(matches!(
        result,
        Err(ConfigError::DuplicateIndexKey(name)) if name == "by-coin"
    ));
}
