use anyhow::Result as AnyResult;
use courier_domain::clock::{Clock, ManualClock};
use courier_domain::config::IdempotencyConfig;
use courier_domain::error::DomainError;
use courier_domain::idempotency::{IdempotencyCache, IdempotencyStore, Reservation, StoredResponse};
use courier_domain::memory::InMemoryIdempotencyStore;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn config() -> IdempotencyConfig {
    IdempotencyConfig::builder()
        .ttl(Duration::from_secs(60))
        .wait_timeout(Duration::from_secs(2))
        .wait_poll_interval(Duration::from_millis(10))
        .build()
}

fn created(id: &str) -> StoredResponse {
    StoredResponse::new(201, serde_json::json!({ "account_id": id }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_with_same_key_run_handler_once() -> AnyResult<()> {
    let cache = Arc::new(
        IdempotencyCache::builder()
            .store(Arc::new(InMemoryIdempotencyStore::new()))
            .config(config())
            .build(),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let cache = cache.clone();
        let calls = calls.clone();
        tasks.push(tokio::spawn(async move {
            cache
                .execute("K", "H", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, DomainError>(created("acc-1"))
                })
                .await
        }));
    }

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await??);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(results[0].response, results[1].response);
    assert_eq!(results[0].response, created("acc-1"));
    assert_eq!(results.iter().filter(|r| r.replayed).count(), 1);

    let conflict = cache
        .execute("K", "H2", || async {
            Ok::<_, DomainError>(created("acc-2"))
        })
        .await
        .unwrap_err();
    assert!(conflict.is_conflict());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn completed_key_replays_stored_response_verbatim() -> AnyResult<()> {
    let cache = IdempotencyCache::builder()
        .store(Arc::new(InMemoryIdempotencyStore::new()))
        .config(config())
        .build();
    let ttl = cache.ttl();

    assert_eq!(cache.check_and_reserve("K", "H", ttl).await?, Reservation::Acquired);
    assert_eq!(cache.check_and_reserve("K", "H", ttl).await?, Reservation::InProgress);

    cache.complete("K", "H", &created("acc-1")).await?;
    assert_eq!(
        cache.check_and_reserve("K", "H", ttl).await?,
        Reservation::Replay(created("acc-1"))
    );

    // 已完成的记录不可被覆盖
    let err = cache
        .complete("K", "H", &StoredResponse::new(500, serde_json::Value::Null))
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidState { .. }));

    let err = cache.check_and_reserve("K", "other", ttl).await.unwrap_err();
    assert!(matches!(err, DomainError::IdempotencyConflict { ref key } if key == "K"));
    Ok(())
}

#[tokio::test]
async fn failed_handler_releases_the_key() -> AnyResult<()> {
    let cache = IdempotencyCache::builder()
        .store(Arc::new(InMemoryIdempotencyStore::new()))
        .config(config())
        .build();
    let calls = AtomicUsize::new(0);

    let failed = cache
        .execute("K", "H", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<StoredResponse, _>(DomainError::invalid_state("insufficient funds"))
        })
        .await;
    assert!(failed.is_err());

    let retried = cache
        .execute("K", "H", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DomainError>(created("acc-1"))
        })
        .await?;
    assert!(!retried.replayed);
    assert_eq!(retried.response, created("acc-1"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn waiting_on_unfinished_reservation_times_out() -> AnyResult<()> {
    let cache = IdempotencyCache::builder()
        .store(Arc::new(InMemoryIdempotencyStore::new()))
        .config(
            IdempotencyConfig::builder()
                .ttl(Duration::from_secs(60))
                .wait_timeout(Duration::from_millis(50))
                .wait_poll_interval(Duration::from_millis(10))
                .build(),
        )
        .build();

    assert_eq!(
        cache.check_and_reserve("K", "H", cache.ttl()).await?,
        Reservation::Acquired
    );

    let err = cache
        .execute("K", "H", || async { Ok::<_, DomainError>(created("acc-1")) })
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::IdempotencyInProgress { .. }));
    Ok(())
}

#[tokio::test]
async fn expired_key_can_be_reused_and_is_purged() -> AnyResult<()> {
    let store = Arc::new(InMemoryIdempotencyStore::new());
    let clock = Arc::new(ManualClock::default());
    let cache = IdempotencyCache::builder()
        .store(store.clone())
        .clock(clock.clone())
        .config(config())
        .build();
    let ttl = Duration::from_secs(60);

    assert_eq!(cache.check_and_reserve("K", "H", ttl).await?, Reservation::Acquired);
    cache.complete("K", "H", &created("acc-1")).await?;
    assert_eq!(cache.check_and_reserve("K2", "H", ttl).await?, Reservation::Acquired);

    clock.advance(Duration::from_secs(61));

    // 过期后同一键可用于不同请求
    assert_eq!(cache.check_and_reserve("K", "H2", ttl).await?, Reservation::Acquired);

    assert_eq!(cache.purge_expired().await?, 1);
    let live = store.get("K", clock.now()).await?.unwrap();
    assert_eq!(live.request_hash(), "H2");
    assert!(!live.is_completed());
    assert!(store.get("K2", clock.now()).await?.is_none());
    assert_eq!(store.len(), 1);
    Ok(())
}

#[tokio::test]
async fn waiter_takes_over_after_winner_fails() -> AnyResult<()> {
    let cache = Arc::new(
        IdempotencyCache::builder()
            .store(Arc::new(InMemoryIdempotencyStore::new()))
            .config(config())
            .build(),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let winner = {
        let cache = cache.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            cache
                .execute("K", "H", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err::<StoredResponse, _>(DomainError::invalid_state("insufficient funds"))
                })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let waiter = cache
        .execute("K", "H", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DomainError>(created("acc-1"))
        })
        .await?;

    assert!(winner.await?.is_err());
    assert!(!waiter.replayed);
    assert_eq!(waiter.response, created("acc-1"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    Ok(())
}
