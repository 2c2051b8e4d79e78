use crate::outbox::MessageHeaders;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 消费侧去重记录，以 broker 分配的 message_id 为自然键
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxMessage {
    message_id: String,
    first_seen_at: DateTime<Utc>,
    /// 仅设置一次，设置后该消息永久视为已处理
    processed_at: Option<DateTime<Utc>>,
    attempts: u32,
    last_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
}

impl InboxMessage {
    /// 首次见到某条消息（尚未计入尝试次数）
    pub fn first_seen(message_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            message_id: message_id.into(),
            first_seen_at: now,
            processed_at: None,
            attempts: 0,
            last_attempt_at: now,
            last_error: None,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn first_seen_at(&self) -> DateTime<Utc> {
        self.first_seen_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_attempt_at(&self) -> DateTime<Utc> {
        self.last_attempt_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    // ---- 状态迁移：仅供存储适配器在原子写入内部调用 ----

    pub fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_at = now;
    }

    /// 返回 `false` 表示此前已标记处理，本次不生效
    pub fn mark_processed(&mut self, now: DateTime<Utc>) -> bool {
        if self.processed_at.is_some() {
            return false;
        }
        self.processed_at = Some(now);
        self.last_error = None;
        true
    }

    pub fn record_failure(&mut self, error: String) {
        self.last_error = Some(error);
    }
}

/// 一条待消费的入站消息
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    pub payload: Value,
    pub headers: MessageHeaders,
}

impl InboundMessage {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
            headers: MessageHeaders::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

#[cfg(feature = "memory")]
impl From<crate::broker::DeliveredMessage> for InboundMessage {
    fn from(message: crate::broker::DeliveredMessage) -> Self {
        Self {
            message_id: message.message_id,
            payload: message.payload,
            headers: message.headers,
        }
    }
}
