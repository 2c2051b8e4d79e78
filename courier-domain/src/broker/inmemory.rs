//! 内存版 Broker（InMemoryBroker）
//!
//! 基于 `tokio::sync::broadcast` 的轻量实现，满足 `BrokerGateway` 协议：
//! - `send`：按脚本返回成功/暂时失败/永久失败/延迟，成功的消息被记录并广播；
//! - `subscribe`：返回 `'static` 生命周期的消息流，便于在 `tokio::spawn` 中消费；
//! - 典型用途：测试替身、示例与本地开发。
//!
//! 注意：无订阅者时广播会被忽略，但发送记录仍然保留。

use super::{BrokerError, BrokerGateway};
use crate::error::{DomainError, DomainResult as Result};
use crate::outbox::MessageHeaders;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// broker 成功接收的一条消息
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub message_id: String,
    pub topic: String,
    pub partition_key: String,
    pub payload: Value,
    pub headers: MessageHeaders,
}

/// 单次发送的预设结果
#[derive(Debug, Clone)]
pub enum BrokerScript {
    Succeed,
    FailTransient(String),
    FailPermanent(String),
    /// 等待给定时长后成功（用于触发发送超时）
    Delay(Duration),
}

pub struct InMemoryBroker {
    tx: broadcast::Sender<DeliveredMessage>,
    script: Mutex<VecDeque<BrokerScript>>,
    fallback: Mutex<BrokerScript>,
    sent: Mutex<Vec<DeliveredMessage>>,
    attempts: AtomicUsize,
}

impl InMemoryBroker {
    /// 创建一个始终成功的 broker，`capacity` 为广播缓冲区容量
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(BrokerScript::Succeed),
            sent: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        }
    }

    /// 依次消费的预设结果，耗尽后使用 fallback
    pub fn push_outcomes(&self, outcomes: impl IntoIterator<Item = BrokerScript>) {
        lock(&self.script).extend(outcomes);
    }

    pub fn set_fallback(&self, outcome: BrokerScript) {
        *lock(&self.fallback) = outcome;
    }

    /// 发送调用次数（含失败）
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 成功接收的消息
    pub fn sent(&self) -> Vec<DeliveredMessage> {
        lock(&self.sent).clone()
    }

    pub fn subscribe(&self) -> BoxStream<'static, Result<DeliveredMessage>> {
        let rx = self.tx.subscribe();
        let stream =
            BroadcastStream::new(rx).map(|r| r.map_err(|e| DomainError::broker(e.to_string())));
        Box::pin(stream)
    }

    fn next_outcome(&self) -> BrokerScript {
        match lock(&self.script).pop_front() {
            Some(outcome) => outcome,
            None => lock(&self.fallback).clone(),
        }
    }

    fn accept(
        &self,
        topic: &str,
        partition_key: &str,
        payload: &Value,
        headers: &MessageHeaders,
    ) -> String {
        let message = DeliveredMessage {
            message_id: ulid::Ulid::new().to_string(),
            topic: topic.to_string(),
            partition_key: partition_key.to_string(),
            payload: payload.clone(),
            headers: headers.clone(),
        };
        let message_id = message.message_id.clone();
        lock(&self.sent).push(message.clone());
        // 若当前无订阅者，broadcast 的 send 会返回错误，这里视为非致命并忽略
        let _ = self.tx.send(message);
        debug!(%topic, %partition_key, %message_id, "in-memory broker accepted message");
        message_id
    }
}

#[async_trait]
impl BrokerGateway for InMemoryBroker {
    async fn send(
        &self,
        topic: &str,
        partition_key: &str,
        payload: &Value,
        headers: &MessageHeaders,
    ) -> std::result::Result<String, BrokerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        match self.next_outcome() {
            BrokerScript::Succeed => Ok(self.accept(topic, partition_key, payload, headers)),
            BrokerScript::FailTransient(reason) => Err(BrokerError::transient(reason)),
            BrokerScript::FailPermanent(reason) => Err(BrokerError::permanent(reason)),
            BrokerScript::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.accept(topic, partition_key, payload, headers))
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_outcomes_then_fallback() {
        let broker = InMemoryBroker::new(16);
        broker.push_outcomes([
            BrokerScript::FailTransient("down".into()),
            BrokerScript::FailPermanent("bad payload".into()),
        ]);
        let headers = MessageHeaders::new();
        let payload = serde_json::json!({"n": 1});

        let first = broker.send("t", "k", &payload, &headers).await.unwrap_err();
        assert!(first.is_retriable());
        let second = broker.send("t", "k", &payload, &headers).await.unwrap_err();
        assert!(!second.is_retriable());
        let id = broker.send("t", "k", &payload, &headers).await.unwrap();

        assert_eq!(broker.attempts(), 3);
        let sent = broker.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_id, id);
        assert_eq!(sent[0].partition_key, "k");
    }

    #[tokio::test]
    async fn subscribers_receive_accepted_messages() {
        let broker = InMemoryBroker::new(16);
        let mut stream = broker.subscribe();
        let payload = serde_json::json!({"n": 2});
        broker
            .send("orders", "o-1", &payload, &MessageHeaders::new())
            .await
            .unwrap();

        let got = stream.next().await.unwrap().unwrap();
        assert_eq!(got.topic, "orders");
        assert_eq!(got.payload, payload);
    }
}
