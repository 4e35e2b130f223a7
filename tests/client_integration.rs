use futures::StreamExt;
use querycache::{CacheManager, Defaults, Error, QueryClient, QueryFn, QueryOptions, StoreHandle};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn echo() -> QueryFn<Value, u32> {
    QueryFn::from_async(|n: u32| async move { Ok(json!({ "echo": n })) })
}

fn client() -> QueryClient {
    QueryClient::with_manager(Arc::new(CacheManager::new()), Defaults::default())
}

#[tokio::test]
async fn test_handles_share_one_surface() {
    let client = client();
    let query = client
        .register_query(QueryOptions::new("query", json!(null), echo()).with_caching(3))
        .unwrap();
    let store = client
        .register_store(QueryOptions::new("store", json!(null), echo()))
        .unwrap();
    let handles: Vec<Box<dyn StoreHandle<Value, u32>>> = vec![Box::new(query), Box::new(store)];

    for (n, handle) in (1_u32..).zip(&handles) {
        let mut responses = handle.response();
        handle.fetch(n).unwrap();
        let response = timeout(Duration::from_secs(5), responses.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(**response.data().unwrap(), json!({ "echo": n }));
        assert!(handle.mutate(&|_| json!("edited")).unwrap());
    }

    assert!(handles[0].reload().is_ok());
    assert!(matches!(handles[1].reload(), Err(Error::Unsupported(_))));

    for handle in &handles {
        handle.destroy();
    }
    assert!(client.is_empty());
}

#[tokio::test]
async fn test_store_prefetch_and_reset() {
    let client = client();
    let store = client
        .register_store(QueryOptions::new("prefetched", json!(null), echo()).with_prefetch(9))
        .unwrap();
    let mut data = store.select_data().unwrap();
    let seen: Vec<Arc<Value>> = timeout(Duration::from_secs(5), data.by_ref().take(2).collect())
        .await
        .unwrap();
    assert_eq!(*seen[1], json!({ "echo": 9 }));

    store.reset().unwrap();
    let status = store.current_status().unwrap();
    assert_eq!(*status.data, json!(null));
    assert_eq!(status.timestamp, 0);
}

#[tokio::test]
async fn test_clients_keep_separate_registries() {
    let first = client();
    let second = client();
    first
        .register_query(QueryOptions::new("shared-key", json!(null), echo()).with_keep_alive(true))
        .unwrap();
    assert!(first.has("shared-key"));
    assert!(!second.has("shared-key"));
    assert!(first.manager().contains("shared-key"));
    assert!(!second.manager().contains("shared-key"));
}
