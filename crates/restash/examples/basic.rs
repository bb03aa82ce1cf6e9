//! Write a response, read it back, then invalidate it by tag.
//!
//! Requires a Redis server at REDIS_URL (default redis://127.0.0.1:6379).

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use restash::prelude::*;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let store = RedisCacheStore::new(
        RedisCacheStoreConfig::new(url)
            .prefix("demo:")
            .cache_tags_header("cache-tag"),
    )
    .await?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)?
        .as_millis() as u64;
    let key = RequestKey::new("http://demo", "GET", "/products/42");
    let response = CachedResponse {
        status_code: 200,
        status_message: "OK".to_string(),
        headers: [
            ("content-type".to_string(), HeaderValue::from("text/plain")),
            ("cache-tag".to_string(), HeaderValue::from("products,product-42")),
        ]
        .into_iter()
        .collect(),
        cached_at: now,
        stale_at: now + 10_000,
        delete_at: now + 60_000,
        ..Default::default()
    };

    let mut sink = store
        .create_write_stream(key.clone(), response)?
        .expect("store accepts writes");
    sink.write(Bytes::from("hello "));
    sink.write(Bytes::from("world"));
    sink.end().await?;

    match store.get(&key).await? {
        Some(hit) => println!(
            "hit: {} with {} body bytes",
            hit.response.status_code,
            hit.body_size()
        ),
        None => println!("miss"),
    }

    store.delete_tags(["products"]).await?;
    println!("after tag purge: {:?}", store.get(&key).await?.is_some());

    store.close().await;
    Ok(())
}
