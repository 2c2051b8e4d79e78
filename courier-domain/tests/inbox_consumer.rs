use anyhow::Result as AnyResult;
use courier_domain::broker::{BrokerGateway, InMemoryBroker};
use courier_domain::clock::{Clock, ManualClock};
use courier_domain::config::{InboxConfig, RetentionConfig};
use courier_domain::error::DomainError;
use courier_domain::inbox::{
    ConsumeOutcome, IdempotentConsumer, InboundMessage, InboxStore, MessageHandler,
};
use courier_domain::memory::{InMemoryIdempotencyStore, InMemoryInboxStore};
use courier_domain::outbox::MessageHeaders;
use courier_domain::retention::RetentionSweeper;
use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// 每次调用计数 +1；前 `fail_first` 次返回错误
#[derive(Default)]
struct CountingHandler {
    calls: AtomicUsize,
    fail_first: usize,
}

#[async_trait::async_trait]
impl MessageHandler for CountingHandler {
    fn handler_name(&self) -> &str {
        "counting"
    }

    async fn process(&self, _message: &InboundMessage) -> anyhow::Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_first {
            anyhow::bail!("downstream unavailable");
        }
        Ok(())
    }
}

fn consumer(
    inbox: Arc<InMemoryInboxStore>,
    handler: Arc<CountingHandler>,
    clock: Arc<ManualClock>,
) -> IdempotentConsumer {
    IdempotentConsumer::builder()
        .inbox(inbox)
        .handler(handler)
        .clock(clock)
        .build()
}

#[tokio::test]
async fn duplicate_delivery_runs_handler_once() -> AnyResult<()> {
    let inbox = Arc::new(InMemoryInboxStore::new());
    let handler = Arc::new(CountingHandler::default());
    let clock = Arc::new(ManualClock::default());
    let consumer = consumer(inbox.clone(), handler.clone(), clock.clone());

    let first = consumer
        .on_message("M1", serde_json::json!({ "amount": 5 }))
        .await?;
    assert_eq!(first, ConsumeOutcome::Processed { attempts: 1 });
    let processed_at = clock.now();

    clock.advance(Duration::from_secs(5));
    let second = consumer
        .on_message("M1", serde_json::json!({ "amount": 5 }))
        .await?;
    assert_eq!(second, ConsumeOutcome::Duplicate { processed_at });
    assert!(second.is_duplicate());

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    let record = inbox.get("M1").await?.unwrap();
    assert_eq!(record.attempts(), 1);
    assert_eq!(record.processed_at(), Some(processed_at));
    Ok(())
}

#[tokio::test]
async fn handler_failure_is_recorded_and_redelivery_succeeds() -> AnyResult<()> {
    let inbox = Arc::new(InMemoryInboxStore::new());
    let handler = Arc::new(CountingHandler {
        fail_first: 1,
        ..Default::default()
    });
    let clock = Arc::new(ManualClock::default());
    let consumer = consumer(inbox.clone(), handler.clone(), clock.clone());

    let err = consumer
        .on_message("M2", serde_json::json!({}))
        .await
        .unwrap_err();
    match err {
        DomainError::EventHandler { handler, reason } => {
            assert_eq!(handler, "counting");
            assert!(reason.contains("downstream unavailable"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let record = inbox.get("M2").await?.unwrap();
    assert!(!record.is_processed());
    assert_eq!(record.attempts(), 1);
    assert!(record.last_error().is_some());

    clock.advance(Duration::from_secs(1));
    let retried = consumer.on_message("M2", serde_json::json!({})).await?;
    assert_eq!(retried, ConsumeOutcome::Processed { attempts: 2 });

    let record = inbox.get("M2").await?.unwrap();
    assert!(record.is_processed());
    assert_eq!(record.last_attempt_at(), clock.now());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumes_broker_stream_and_skips_redeliveries() -> AnyResult<()> {
    let broker = Arc::new(InMemoryBroker::new(64));
    let inbox = Arc::new(InMemoryInboxStore::new());
    let handler = Arc::new(CountingHandler::default());
    let consumer = Arc::new(
        IdempotentConsumer::builder()
            .inbox(inbox.clone())
            .handler(handler.clone())
            .build(),
    );

    let stream = broker
        .subscribe()
        .map(|r| r.map(InboundMessage::from))
        .boxed();
    let handle = consumer.clone().spawn(stream);

    let headers = MessageHeaders::new();
    for n in 0..3 {
        broker
            .send("account", "acc-1", &serde_json::json!({ "n": n }), &headers)
            .await?;
    }
    for _ in 0..100 {
        if handler.calls.load(Ordering::SeqCst) >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // 重投第一条消息
    let redelivered = broker.sent()[0].clone();
    let outcome = consumer.consume(&InboundMessage::from(redelivered)).await?;
    assert!(outcome.is_duplicate());

    handle.shutdown();
    handle.join().await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(inbox.len(), 3);
    Ok(())
}

#[tokio::test]
async fn retention_sweep_purges_old_inbox_and_expired_idempotency_records() -> AnyResult<()> {
    let inbox = Arc::new(InMemoryInboxStore::new());
    let idempotency = Arc::new(InMemoryIdempotencyStore::new());
    let clock = Arc::new(ManualClock::default());
    let handler = Arc::new(CountingHandler::default());
    let consumer = consumer(inbox.clone(), handler.clone(), clock.clone());

    consumer.on_message("old", serde_json::json!({})).await?;
    clock.advance(Duration::from_secs(3600));
    consumer.on_message("recent", serde_json::json!({})).await?;

    let sweeper = RetentionSweeper::builder()
        .inbox(inbox.clone())
        .idempotency(idempotency.clone())
        .clock(clock.clone())
        .inbox_config(
            InboxConfig::builder()
                .retention_ttl(Duration::from_secs(1800))
                .build(),
        )
        .config(
            RetentionConfig::builder()
                .sweep_interval(Duration::from_secs(60))
                .build(),
        )
        .build();

    let report = sweeper.sweep_once().await?;
    assert_eq!(report.inbox_purged, 1);
    assert_eq!(report.idempotency_purged, 0);
    assert!(inbox.get("old").await?.is_none());
    assert!(inbox.get("recent").await?.is_some());

    // 清理后同一消息再次到达会被当作新消息处理
    consumer.on_message("old", serde_json::json!({})).await?;
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    Ok(())
}

/// 处理过程中触发保留期清理，模拟清理与处理并发
struct PurgingHandler {
    inbox: Arc<InMemoryInboxStore>,
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl MessageHandler for PurgingHandler {
    fn handler_name(&self) -> &str {
        "purging"
    }

    async fn process(&self, _message: &InboundMessage) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let far_future = chrono::Utc::now() + chrono::Duration::days(365);
        self.inbox.purge_seen_before(far_future).await?;
        Ok(())
    }
}

#[tokio::test]
async fn success_is_checkpointed_even_if_row_was_purged_meanwhile() -> AnyResult<()> {
    let inbox = Arc::new(InMemoryInboxStore::new());
    let handler = Arc::new(PurgingHandler {
        inbox: inbox.clone(),
        calls: AtomicUsize::new(0),
    });
    let consumer = IdempotentConsumer::builder()
        .inbox(inbox.clone())
        .handler(handler.clone())
        .build();

    let first = consumer.on_message("M1", serde_json::json!({})).await?;
    assert!(matches!(first, ConsumeOutcome::Processed { .. }));
    assert!(inbox.get("M1").await?.is_some_and(|m| m.is_processed()));

    let second = consumer.on_message("M1", serde_json::json!({})).await?;
    assert!(second.is_duplicate());
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    Ok(())
}
