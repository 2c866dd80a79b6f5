//! CLI smoke entry point.
//!
//! # Responsibility
//! - Seed an in-memory price table through the repository contract.
//! - Run one filtered, paginated index query and print the rows as JSON.
//!
//! Usage: `pricedash_cli [absolute-log-dir]`.

use log::info;
use pricedash_core::{
    core_version, default_log_level, init_logging, price_key, Entry, Granularity, IndexDescriptor,
    MemoryStore, MemoryStoreOptions, PriceData, Predicate, QueryArgs, Repository, TableOptions,
    TableRepository, TableSchema,
};
use std::process::ExitCode;
use std::sync::Arc;

const TABLE: &str = "PriceData";
const CURRENCY_INDEX: &str = "currency-timestamp";

#[tokio::main]
async fn main() -> ExitCode {
    if let Some(log_dir) = std::env::args().nth(1) {
        if let Err(err) = init_logging(default_log_level(), &log_dir) {
            eprintln!("logging disabled: {err}");
        }
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("pricedash_core version={}", core_version());

    // Small pages force the engine to follow continuation keys.
    let store = Arc::new(MemoryStore::with_options(MemoryStoreOptions {
        page_item_limit: 3,
        ..MemoryStoreOptions::default()
    }));
    let index = IndexDescriptor::new("currency", "timestamp");
    store
        .create_table(
            TableSchema::new(TABLE, "coin_id")
                .with_range_key("timestamp_currency")
                .with_index(CURRENCY_INDEX, index.clone()),
        )
        .await?;

    let repo = TableRepository::from_options(
        Arc::clone(&store),
        TableOptions::new(TABLE).with_index(CURRENCY_INDEX, index),
        price_key,
    )?;

    let mut entries = Vec::new();
    for (hour, coin, currency, price) in [
        (0, "bitcoin", "usd", 37_000.0),
        (0, "bitcoin", "eur", 34_100.0),
        (0, "ethereum", "usd", 2_050.0),
        (1, "bitcoin", "usd", 37_250.5),
        (1, "ethereum", "usd", 2_041.2),
        (1, "ethereum", "eur", 1_880.9),
        (2, "bitcoin", "usd", 37_410.0),
        (2, "ethereum", "usd", 2_063.7),
    ] {
        let timestamp = (1_700_000_000_000i64 + hour * 3_600_000).to_string();
        let record = PriceData::new(coin, currency, timestamp, price, Granularity::Hourly);
        record.validate()?;
        entries.push(Entry::new(price_key(&record), record));
    }
    repo.put_many(entries).await?;
    info!("event=cli_seed module=cli status=ok table={TABLE}");

    let output = repo
        .query(
            QueryArgs::new()
                .on_index(CURRENCY_INDEX)
                .partition("usd")
                .filter(Predicate::eq("coin_id", "bitcoin"))
                .limit(2),
        )
        .await?;
    for entry in &output.items {
        println!("{}", serde_json::to_string(&entry.value)?);
    }
    match &output.last_evaluated_key {
        Some(cursor) => println!("next={}", serde_json::to_string(cursor)?),
        None => println!("next=none"),
    }
    Ok(())
}
