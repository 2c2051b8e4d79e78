//! 幂等消费者（IdempotentConsumer）
//!
//! 在业务处理器之前以 Inbox 记录做去重闸门：
//! 1. 已处理（processed_at 已设置）的消息直接返回先前的成功结果，不调用处理器；
//! 2. 否则记录一次尝试并调用处理器；
//! 3. 成功后设置 processed_at；失败则记录 last_error 并向传输层返回错误，由其重投。
//!
//! 保证的是“效果恰好一次”而非“投递恰好一次”：处理器在 processed_at 检查点之前
//! 可能被重复执行，需自身幂等或完全依赖此闸门。
//!
use super::{InboundMessage, InboxStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{DomainError, DomainResult as Result};
use crate::runtime::TaskHandle;
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 业务处理器
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// 处理器名称（用于失败记录与审计）
    fn handler_name(&self) -> &str;
    /// 处理消息
    async fn process(&self, message: &InboundMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// 本次调用了处理器并成功
    Processed { attempts: u32 },
    /// 先前已成功处理，本次未调用处理器
    Duplicate { processed_at: DateTime<Utc> },
}

impl ConsumeOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}

/// 消息流消费统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub processed: usize,
    pub duplicates: usize,
    pub failed: usize,
}

#[derive(Builder)]
pub struct IdempotentConsumer {
    inbox: Arc<dyn InboxStore>,
    handler: Arc<dyn MessageHandler>,
    #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)]
    clock: Arc<dyn Clock>,
}

impl IdempotentConsumer {
    pub async fn on_message(&self, message_id: &str, payload: Value) -> Result<ConsumeOutcome> {
        self.consume(&InboundMessage::new(message_id, payload)).await
    }

    pub async fn consume(&self, message: &InboundMessage) -> Result<ConsumeOutcome> {
        let message_id = message.message_id.as_str();

        if let Some(existing) = self.inbox.get(message_id).await? {
            if let Some(processed_at) = existing.processed_at() {
                debug!(%message_id, "duplicate delivery ignored");
                return Ok(ConsumeOutcome::Duplicate { processed_at });
            }
        }

        let record = self
            .inbox
            .record_attempt(message_id, self.clock.now())
            .await?;
        // 查询与 upsert 之间可能有另一次投递已完成
        if let Some(processed_at) = record.processed_at() {
            debug!(%message_id, "duplicate delivery ignored");
            return Ok(ConsumeOutcome::Duplicate { processed_at });
        }

        match self.handler.process(message).await {
            Ok(()) => {
                let now = self.clock.now();
                if !self.inbox.mark_processed(message_id, now).await? {
                    // 并发投递抢先完成，处理器本身需幂等
                    warn!(%message_id, handler = %self.handler.handler_name(), "message was processed concurrently");
                    let processed_at = self
                        .inbox
                        .get(message_id)
                        .await?
                        .and_then(|m| m.processed_at())
                        .unwrap_or(now);
                    return Ok(ConsumeOutcome::Duplicate { processed_at });
                }
                debug!(%message_id, attempts = record.attempts(), "message processed");
                Ok(ConsumeOutcome::Processed {
                    attempts: record.attempts(),
                })
            }
            Err(err) => {
                let reason = format!("{err:#}");
                self.inbox.record_failure(message_id, &reason).await?;
                warn!(
                    %message_id,
                    handler = %self.handler.handler_name(),
                    attempts = record.attempts(),
                    error = %reason,
                    "message handler failed, left for redelivery"
                );
                Err(DomainError::EventHandler {
                    handler: self.handler.handler_name().to_string(),
                    reason,
                })
            }
        }
    }

    /// 持续消费消息流，直到流结束或 `token` 被取消
    pub async fn consume_stream(
        &self,
        mut stream: BoxStream<'static, Result<InboundMessage>>,
        token: CancellationToken,
    ) -> ConsumeStats {
        let mut stats = ConsumeStats::default();

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                maybe_message = stream.next() => {
                    match maybe_message {
                        Some(Ok(message)) => match self.consume(&message).await {
                            Ok(ConsumeOutcome::Processed { .. }) => stats.processed += 1,
                            Ok(ConsumeOutcome::Duplicate { .. }) => stats.duplicates += 1,
                            Err(_) => stats.failed += 1,
                        },
                        Some(Err(err)) => {
                            warn!(error = %err, "inbound stream error");
                        }
                        None => break,
                    }
                }
            }
        }

        info!(?stats, "consumer stopped");
        stats
    }

    /// 在后台消费消息流，返回可用于关闭/等待的句柄
    pub fn spawn(self: Arc<Self>, stream: BoxStream<'static, Result<InboundMessage>>) -> TaskHandle {
        let token = CancellationToken::new();
        let task = {
            let token = token.clone();
            tokio::spawn(async move {
                self.consume_stream(stream, token).await;
            })
        };
        TaskHandle::new(token, vec![task])
    }
}
