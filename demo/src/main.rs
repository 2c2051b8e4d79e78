//! 端到端演示：开户命令 → 同事务写入 outbox → 投递器发布 → 幂等消费者处理
//!
//! 配置：`COURIER_CONFIG` 指向 JSON 配置文件；未设置时使用内置配置。
//! 日志：`RUST_LOG`（默认 `info`）。
//!
use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use chrono::Utc;
use courier_application::command::Command;
use courier_application::command_handler::CommandHandler;
use courier_application::context::AppContext;
use courier_application::error::AppError;
use courier_application::{IdempotentCommandBus, InMemoryCommandBus};
use courier_domain::broker::InMemoryBroker;
use courier_domain::config::RelayConfig;
use courier_domain::context::BusinessContext;
use courier_domain::dispatch::{DispatchCounters, Dispatcher};
use courier_domain::idempotency::IdempotencyCache;
use courier_domain::inbox::{IdempotentConsumer, InboundMessage, MessageHandler};
use courier_domain::memory::{
    InMemoryDatabase, InMemoryIdempotencyStore, InMemoryInboxStore, InMemoryTransaction,
};
use courier_domain::outbox::{EventStore, OutboxEvent, OutboxStore};
use courier_domain::retention::RetentionSweeper;
use courier_domain::transaction::in_transaction;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEMO_CONFIG: &str = r#"{
  "dispatcher": {
    "poll_interval_ms": 100,
    "batch_size": 50,
    "max_retries": 5,
    "backoff_base_ms": 200,
    "backoff_cap_ms": 10000,
    "claim_lease_duration_ms": 30000,
    "send_timeout_ms": 2000,
    "worker_concurrency": 4
  },
  "inbox": { "retention_ttl_ms": 2592000000 },
  "idempotency": {
    "ttl_ms": 86400000,
    "wait_timeout_ms": 5000,
    "wait_poll_interval_ms": 50
  },
  "retention": { "sweep_interval_ms": 60000 }
}"#;

#[derive(Debug, Clone, Serialize)]
struct OpenAccount {
    owner: String,
    initial_balance: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountOpened {
    account_id: String,
    owner: String,
    balance: i64,
}

impl Command for OpenAccount {
    const NAME: &'static str = "account.open";
    const SUCCESS_STATUS: u16 = 201;
    type Output = AccountOpened;
}

struct OpenAccountHandler {
    db: Arc<InMemoryDatabase>,
    seq: AtomicUsize,
}

async fn save_account(
    db: &InMemoryDatabase,
    tx: &mut InMemoryTransaction,
    opened: &AccountOpened,
    event: OutboxEvent,
) -> Result<(), AppError> {
    tx.put_document("accounts", &opened.account_id, serde_json::to_value(opened)?);
    db.append(tx, event).await?;
    Ok(())
}

#[async_trait]
impl CommandHandler<OpenAccount> for OpenAccountHandler {
    async fn handle(&self, ctx: &AppContext, cmd: OpenAccount) -> Result<AccountOpened, AppError> {
        if cmd.initial_balance < 0 {
            return Err(AppError::Validation("initial balance must be >= 0".into()));
        }
        let opened = AccountOpened {
            account_id: format!("acc-{}", self.seq.fetch_add(1, Ordering::SeqCst) + 1),
            owner: cmd.owner,
            balance: cmd.initial_balance,
        };
        let event = OutboxEvent::builder()
            .event_type("account.opened".into())
            .aggregate_type("account".into())
            .aggregate_id(opened.account_id.clone())
            .payload(serde_json::to_value(&opened)?)
            .created_at(Utc::now())
            .build()
            .with_context(&ctx.biz);

        let db = self.db.clone();
        let record = opened.clone();
        in_transaction(self.db.as_ref(), move |tx: &mut InMemoryTransaction| {
            Box::pin(async move { save_account(&db, tx, &record, event).await })
        })
        .await?;
        Ok(opened)
    }
}

/// 下游投影：累计总开户金额
#[derive(Default)]
struct BalanceProjection {
    total: AtomicI64,
    applied: AtomicUsize,
}

#[async_trait]
impl MessageHandler for BalanceProjection {
    fn handler_name(&self) -> &str {
        "balance-projection"
    }

    async fn process(&self, message: &InboundMessage) -> anyhow::Result<()> {
        let opened: AccountOpened = serde_json::from_value(message.payload.clone())
            .context("decode account.opened payload")?;
        self.total.fetch_add(opened.balance, Ordering::SeqCst);
        self.applied.fetch_add(1, Ordering::SeqCst);
        info!(
            account_id = %opened.account_id,
            correlation_id = message.header("correlation-id").unwrap_or("-"),
            "projection applied"
        );
        Ok(())
    }
}

async fn load_config() -> AnyResult<RelayConfig> {
    let raw = match std::env::var("COURIER_CONFIG") {
        Ok(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("read config file {path}"))?,
        Err(_) => DEMO_CONFIG.to_string(),
    };
    Ok(RelayConfig::from_json_str(&raw)?)
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config().await?;

    let db = Arc::new(InMemoryDatabase::new());
    let broker = Arc::new(InMemoryBroker::new(1024));
    let inbox = Arc::new(InMemoryInboxStore::new());
    let idempotency = Arc::new(InMemoryIdempotencyStore::new());
    let counters = Arc::new(DispatchCounters::new());

    let commands = InMemoryCommandBus::new();
    commands.register::<OpenAccount, _>(Arc::new(OpenAccountHandler {
        db: db.clone(),
        seq: AtomicUsize::new(0),
    }))?;
    let cache = IdempotencyCache::builder()
        .store(idempotency.clone())
        .config(config.idempotency.clone())
        .build();
    let bus = IdempotentCommandBus::new(commands, Arc::new(cache));

    let dispatcher = Arc::new(
        Dispatcher::builder()
            .store(db.clone())
            .gateway(broker.clone())
            .metrics(counters.clone())
            .worker_id("demo-worker-1")
            .config(config.dispatcher.clone())
            .build(),
    );
    let projection = Arc::new(BalanceProjection::default());
    let consumer = Arc::new(
        IdempotentConsumer::builder()
            .inbox(inbox.clone())
            .handler(projection.clone())
            .build(),
    );
    let sweeper = Arc::new(
        RetentionSweeper::builder()
            .inbox(inbox.clone())
            .idempotency(idempotency.clone())
            .inbox_config(config.inbox.clone())
            .config(config.retention.clone())
            .build(),
    );

    let inbound = broker
        .subscribe()
        .map(|r| r.map(InboundMessage::from))
        .boxed();
    let consumer_handle = consumer.clone().spawn(inbound);
    let dispatcher_handle = dispatcher.clone().start();
    let sweeper_handle = sweeper.start();

    let ctx = AppContext {
        biz: BusinessContext::builder()
            .correlation_id("demo-cor-1".into())
            .actor_type("user".into())
            .actor_id("u-1".into())
            .build(),
        idempotency_key: None,
    };

    let first = bus
        .dispatch(
            &ctx.clone().with_idempotency_key("req-1"),
            OpenAccount {
                owner: "alice".into(),
                initial_balance: 100,
            },
        )
        .await?;
    info!(status = first.status, replayed = first.replayed, account_id = %first.body.account_id, "open account");

    // 客户端超时重试：同键同请求，返回原响应
    let retry = bus
        .dispatch(
            &ctx.clone().with_idempotency_key("req-1"),
            OpenAccount {
                owner: "alice".into(),
                initial_balance: 100,
            },
        )
        .await?;
    info!(status = retry.status, replayed = retry.replayed, account_id = %retry.body.account_id, "open account retried");

    // 同键不同请求：冲突
    match bus
        .dispatch(
            &ctx.clone().with_idempotency_key("req-1"),
            OpenAccount {
                owner: "alice".into(),
                initial_balance: 999,
            },
        )
        .await
    {
        Err(err) if err.is_conflict() => warn!(error = %err, "conflicting request rejected"),
        other => warn!(?other, "expected an idempotency conflict"),
    }

    bus.dispatch(
        &ctx.clone().with_idempotency_key("req-2"),
        OpenAccount {
            owner: "bob".into(),
            initial_balance: 50,
        },
    )
    .await?;

    for _ in 0..50 {
        if db.count_pending().await? == 0 && projection.applied.load(Ordering::SeqCst) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // 模拟 broker 重投：消费者按 message_id 去重
    if let Some(message) = broker.sent().first().cloned() {
        let outcome = consumer.consume(&InboundMessage::from(message)).await?;
        info!(duplicate = outcome.is_duplicate(), "redelivered message handled");
    }

    dispatcher_handle.shutdown();
    consumer_handle.shutdown();
    sweeper_handle.shutdown();
    dispatcher_handle.join().await;
    consumer_handle.join().await;
    sweeper_handle.join().await;

    let metrics = counters.snapshot();
    info!(
        ?metrics,
        alert = counters.alert_active(),
        projected_total = projection.total.load(Ordering::SeqCst),
        "demo finished"
    );
    Ok(())
}
