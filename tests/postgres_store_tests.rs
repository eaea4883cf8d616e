mod common;

use common::{setup_postgres_store, unique_key};
use idempotency_guard::idempotency::{
    IdempotencyError, IdempotencyFacade, IdempotencyKey, IdempotencyState, IdempotencyStore,
    IdempotencyStrategy, Outcome, StoreBackend, MAX_KEY_LENGTH, NAMESPACE_HTTP, NAMESPACE_JOB,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_postgres_claim_is_exclusive() {
    let store = setup_postgres_store().await;
    let key = unique_key(NAMESPACE_HTTP, "POST /orders");

    assert!(store.claim(&key, 300).await.expect("Failed to claim"));
    assert!(!store.claim(&key, 300).await.expect("Failed to claim"));

    let record = store.get(&key).await.expect("Failed to get").expect("record");
    assert_eq!(record.key, key.canonical());
    assert_eq!(record.state, IdempotencyState::Pending);
    assert_eq!(store.backend(), StoreBackend::Postgres);

    store.release(&key).await.expect("Failed to release");
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_postgres_set_state_and_release() {
    let store = setup_postgres_store().await;
    let key = unique_key(NAMESPACE_HTTP, "POST /orders");

    store.claim(&key, 300).await.expect("Failed to claim");
    store
        .set_state(&key, IdempotencyState::Success)
        .await
        .expect("Failed to set state");

    let record = store.get(&key).await.expect("Failed to get").expect("record");
    assert_eq!(record.state, IdempotencyState::Success);

    store.release(&key).await.expect("Failed to release");
    assert!(store.get(&key).await.expect("Failed to get").is_none());
    assert!(store.claim(&key, 300).await.expect("Failed to reclaim"));

    store.release(&key).await.expect("Failed to release");
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_postgres_expired_claim_can_be_reclaimed() {
    let store = setup_postgres_store().await;
    let key = unique_key(NAMESPACE_JOB, "settle");

    assert!(store.claim(&key, 1).await.expect("Failed to claim"));
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(store.get(&key).await.expect("Failed to get").is_none());
    // no-op on an expired record
    store
        .set_state(&key, IdempotencyState::Success)
        .await
        .expect("Failed to set state");
    assert!(store.claim(&key, 300).await.expect("Failed to reclaim"));

    store.release(&key).await.expect("Failed to release");
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_postgres_purge_expired() {
    let store = setup_postgres_store().await;
    let prefix = format!("purge-{}", Uuid::new_v4().simple());

    for i in 0..3 {
        let key = IdempotencyKey::new(NAMESPACE_JOB, prefix.as_str(), format!("run-{}", i)).unwrap();
        store.claim(&key, 1).await.expect("Failed to claim");
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    let removed = store.purge_expired().await.expect("Failed to purge");
    assert!(removed >= 3);

    common::cleanup_test_data(store.pool(), &format!("{}:{}", NAMESPACE_JOB, prefix)).await;
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_postgres_count_by_state() {
    let store = setup_postgres_store().await;
    let before = store
        .count_by_state(IdempotencyState::Success)
        .await
        .expect("Failed to count");

    let key = unique_key(NAMESPACE_HTTP, "POST /refunds");
    store.claim(&key, 300).await.expect("Failed to claim");
    store
        .set_state(&key, IdempotencyState::Success)
        .await
        .expect("Failed to set state");

    let after = store
        .count_by_state(IdempotencyState::Success)
        .await
        .expect("Failed to count");
    assert!(after >= before + 1);

    store.release(&key).await.expect("Failed to release");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "Requires running PostgreSQL"]
async fn test_postgres_concurrent_execute_runs_once() {
    let store = Arc::new(setup_postgres_store().await);
    let facade = IdempotencyFacade::with_store(store.clone(), IdempotencyStrategy::default());
    let key = unique_key(NAMESPACE_HTTP, "POST /payments");
    let executions = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let (facade, key, executions) = (facade.clone(), key.clone(), executions.clone());
        handles.push(tokio::spawn(async move {
            facade
                .execute_default(&key, || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(())
                })
                .await
        }));
    }

    let mut executed = 0;
    for handle in handles {
        if let Outcome::Executed(()) = handle.await.unwrap().expect("execute") {
            executed += 1;
        }
    }

    assert_eq!(executed, 1);
    assert_eq!(executions.load(Ordering::SeqCst), 1);

    store.release(&key).await.expect("Failed to release");
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_postgres_longest_key_fits_column() {
    let store = setup_postgres_store().await;
    let scope = format!("long-{}", Uuid::new_v4().simple());
    let prefix_len = format!("{}:{}:", NAMESPACE_HTTP, scope).len();
    let discriminator = "k".repeat(MAX_KEY_LENGTH - prefix_len);
    let key = IdempotencyKey::new(NAMESPACE_HTTP, scope.as_str(), discriminator)
        .expect("key at the length limit");

    assert!(store.claim(&key, 300).await.expect("Failed to claim"));
    assert!(!store.claim(&key, 300).await.expect("Failed to claim"));

    store.release(&key).await.expect("Failed to release");
}

#[tokio::test]
#[ignore = "Requires running PostgreSQL"]
async fn test_postgres_oversized_key_never_bypasses() {
    let store = Arc::new(setup_postgres_store().await);
    let facade = IdempotencyFacade::with_store(store, IdempotencyStrategy::default());
    let canonical = format!("{}:POST /orders:{}", NAMESPACE_HTTP, "x".repeat(600));
    let executions = AtomicUsize::new(0);

    for _ in 0..3 {
        let result = facade
            .execute_canonical(&canonical, facade.default_strategy(), || async {
                executions.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(())
            })
            .await;
        assert!(matches!(result, Err(IdempotencyError::InvalidKey(_))));
    }

    assert_eq!(executions.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "Requires running PostgreSQL"]
async fn test_postgres_concurrent_reclaim_of_expired_row() {
    let store = Arc::new(setup_postgres_store().await);
    let key = unique_key(NAMESPACE_JOB, "settle");

    assert!(store.claim(&key, 1).await.expect("Failed to claim"));
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut handles = Vec::new();
    for _ in 0..32 {
        let (store, key) = (store.clone(), key.clone());
        handles.push(tokio::spawn(async move { store.claim(&key, 300).await }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap().expect("claim must not error") {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);

    let record = store.get(&key).await.expect("Failed to get").expect("record");
    assert_eq!(record.state, IdempotencyState::Pending);

    store.release(&key).await.expect("Failed to release");
}
