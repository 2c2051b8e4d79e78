//! Broker 网关（BrokerGateway）
//!
//! 抽象外部消息传输，只约定发送接口与“可重试/不可重试”的错误分类，
//! 不绑定具体 broker 的线协议。
//!
#[cfg(feature = "memory")]
mod inmemory;

#[cfg(feature = "memory")]
pub use inmemory::{BrokerScript, DeliveredMessage, InMemoryBroker};

use crate::outbox::MessageHeaders;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// 发送失败分类，投递器据此决定重试或死信
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// 超时、连接中断等暂时性故障
    #[error("transient broker failure: {reason}")]
    Transient { reason: String },
    /// 负载无法编码、主题不存在等原则上不可能成功的故障
    #[error("permanent broker failure: {reason}")]
    Permanent { reason: String },
}

impl BrokerError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// 发送一条消息，成功时返回 broker 分配的消息 ID
    async fn send(
        &self,
        topic: &str,
        partition_key: &str,
        payload: &Value,
        headers: &MessageHeaders,
    ) -> Result<String, BrokerError>;
}
