//! End-to-end tests for the quarry client over an LMDB store

use quarry_client::QuarryClient;
use quarry_core::*;
use quarry_test_utils::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn open_client(dir: &TempDir, transport: Arc<MockTransport>) -> QuarryResult<QuarryClient> {
    init_tracing();
    let config = QuarryConfig::new(StoreConfig::new(dir.path()).with_map_size_mb(16));
    QuarryClient::open(config, transport, Arc::new(RootFieldNormalizer::new()))
}

async fn next_result(results: &mut mpsc::UnboundedReceiver<DispatchResult>) -> DispatchResult {
    timeout(Duration::from_secs(5), results.recv())
        .await
        .expect("result should arrive in time")
        .expect("channel should be open")
}

#[tokio::test]
async fn test_watch_mutate_clear_flow() -> QuarryResult<()> {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let transport = Arc::new(
        MockTransport::new()
            .with_response(fixtures::hero_response("Luke"))
            .with_response(GraphResponse::data(
                json!({"renameHero": {"id": "Hero:1", "name": "Ben"}}),
            ))
            .with_response(fixtures::hero_response("Ben")),
    );
    let client = open_client(&dir, transport.clone())?;

    let (sender, mut results) = mpsc::unbounded_channel();
    let watcher = client.watch(fixtures::hero_query(), None, move |result| {
        let _ = sender.send(result);
    });

    // Empty cache: only the server result arrives.
    let initial = next_result(&mut results).await?;
    assert!(!initial.is_from_cache());
    assert_eq!(initial.data, Some(fixtures::hero_payload("Luke")));

    // Mutation writes Hero:1, which the watcher depends on.
    let mutation = client
        .perform(fixtures::rename_mutation("Ben"), true)
        .collect()
        .await;
    assert!(mutation[0].is_ok());

    let cached = next_result(&mut results).await?;
    assert!(cached.is_from_cache());
    assert_eq!(cached.data, Some(fixtures::hero_payload("Ben")));
    let fetched = next_result(&mut results).await?;
    assert!(!fetched.is_from_cache());
    assert_eq!(transport.call_count(), 3);

    watcher.cancel();

    client.clear_cache(true).await?;
    let after_clear = client
        .fetch(fixtures::hero_query(), CachePolicy::CacheOnly)
        .collect()
        .await;
    assert!(after_clear[0].as_ref().unwrap_err().is_cache_miss());

    // Store stays writable after compaction.
    transport.push(Ok(GraphResponse::data(fixtures::droid_payload("R2-D2"))));
    let refetched = client
        .fetch(fixtures::droid_query(), CachePolicy::FetchOnly)
        .collect()
        .await;
    assert!(refetched[0].is_ok());
    assert_eq!(client.cache().store().row_count().await?, 2);

    Ok(())
}

#[tokio::test]
async fn test_cache_survives_reopen() -> QuarryResult<()> {
    let dir = TempDir::new().expect("Failed to create temp dir");

    {
        let transport = Arc::new(MockTransport::new().with_response(GraphResponse::data(
            fixtures::droid_payload("R2-D2"),
        )));
        let client = open_client(&dir, transport)?;
        let results = client
            .fetch(fixtures::droid_query(), CachePolicy::FetchOnly)
            .collect()
            .await;
        assert!(results[0].is_ok());
    }

    let transport = Arc::new(MockTransport::new());
    let client = open_client(&dir, transport.clone())?;
    let results = client
        .fetch(fixtures::droid_query(), CachePolicy::CacheOnly)
        .collect()
        .await;

    let cached = results[0].as_ref().expect("cached result should survive reopen");
    assert_eq!(cached.data, Some(fixtures::droid_payload("R2-D2")));
    assert_eq!(transport.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_cache_then_fetch_failure_keeps_cached_answer() -> QuarryResult<()> {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let transport = Arc::new(
        MockTransport::new()
            .with_response(fixtures::hero_response("Luke"))
            .with_failure("connection reset"),
    );
    let client = open_client(&dir, transport)?;

    let first = client
        .fetch(fixtures::hero_query(), CachePolicy::CacheThenFetch)
        .collect()
        .await;
    assert_eq!(first.len(), 1);

    let second = client
        .fetch(fixtures::hero_query(), CachePolicy::CacheThenFetch)
        .collect()
        .await;
    assert_eq!(second.len(), 1);
    assert!(second[0].as_ref().expect("cached result").is_from_cache());

    assert_eq!(client.cache().stats().hits, 1);
    Ok(())
}
