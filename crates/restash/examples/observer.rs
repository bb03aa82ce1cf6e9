//! Watch the cache keyspace with the manager: stream existing entries, then
//! print add/delete events as stores mutate the backend.
//!
//! Requires a Redis server that allows `CONFIG SET notify-keyspace-events`.

use restash::prelude::*;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let manager = RedisCacheManager::new(RedisCacheManagerConfig::new(url)).await?;

    manager
        .stream_entries(
            |entry| {
                println!(
                    "existing: {} {} {} (tags: {:?})",
                    entry.method, entry.origin, entry.path, entry.cache_tags
                );
            },
            "demo:",
        )
        .await?;

    manager.subscribe().await?;
    let mut events = manager.subscribe_events();
    println!("watching keyspace events, ctrl-c to stop");
    while let Ok(event) = events.recv().await {
        match event {
            ManagerEvent::AddEntry(entry) => {
                println!("add: {} {}{}", entry.id, entry.origin, entry.path)
            }
            ManagerEvent::DeleteEntry { id, key_prefix } => {
                println!("delete: {id} (prefix {key_prefix:?})")
            }
        }
    }

    manager.close().await;
    Ok(())
}
