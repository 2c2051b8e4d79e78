//! Outbox 行模型（OutboxEvent）
//!
//! 与业务状态变更在同一本地事务中写入，随后由投递器异步发布。
//! 状态流转：PENDING → CLAIMED → {DISPATCHED | PENDING(重试) | FAILED}。
//!
use crate::context::BusinessContext;
use bon::bon;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// 发送到 broker 时附带的消息头
pub type MessageHeaders = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Claimed,
    Dispatched,
    Failed,
}

impl OutboxStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Dispatched | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Claimed => "CLAIMED",
            Self::Dispatched => "DISPATCHED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// 时间有序的唯一标识（ULID）
    event_id: String,
    event_type: String,
    aggregate_type: String,
    /// 聚合 ID，同时作为分区/排序键
    aggregate_id: String,
    payload: Value,
    correlation_id: Option<String>,
    causation_id: Option<String>,
    created_at: DateTime<Utc>,
    status: OutboxStatus,
    claim_owner: Option<String>,
    claim_lease_expires_at: Option<DateTime<Utc>>,
    /// 重试退避结束时间；为空或已到达时 PENDING 行可被认领
    next_attempt_at: Option<DateTime<Utc>>,
    dispatched_at: Option<DateTime<Utc>>,
    broker_message_id: Option<String>,
    retry_count: u32,
    last_error: Option<String>,
}

#[bon]
impl OutboxEvent {
    /// 构造一条待投递（PENDING）的事件
    #[builder]
    pub fn new(
        event_id: Option<String>,
        event_type: String,
        aggregate_type: String,
        aggregate_id: String,
        payload: Value,
        correlation_id: Option<String>,
        causation_id: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.unwrap_or_else(|| ulid::Ulid::new().to_string()),
            event_type,
            aggregate_type,
            aggregate_id,
            payload,
            correlation_id,
            causation_id,
            created_at,
            status: OutboxStatus::Pending,
            claim_owner: None,
            claim_lease_expires_at: None,
            next_attempt_at: None,
            dispatched_at: None,
            broker_message_id: None,
            retry_count: 0,
            last_error: None,
        }
    }
}

impl OutboxEvent {
    /// 从业务上下文补齐 correlation/causation（已显式设置的值优先）
    pub fn with_context(mut self, context: &BusinessContext) -> Self {
        if self.correlation_id.is_none() {
            self.correlation_id = context.correlation_id().map(str::to_string);
        }
        if self.causation_id.is_none() {
            self.causation_id = context.causation_id().map(str::to_string);
        }
        self
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    pub fn claim_owner(&self) -> Option<&str> {
        self.claim_owner.as_deref()
    }

    pub fn claim_lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.claim_lease_expires_at
    }

    pub fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    pub fn dispatched_at(&self) -> Option<DateTime<Utc>> {
        self.dispatched_at
    }

    pub fn broker_message_id(&self) -> Option<&str> {
        self.broker_message_id.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// broker 发送时附带的消息头
    pub fn headers(&self) -> MessageHeaders {
        let mut headers = MessageHeaders::new();
        headers.insert("event-id".into(), self.event_id.clone());
        headers.insert("event-type".into(), self.event_type.clone());
        headers.insert("aggregate-type".into(), self.aggregate_type.clone());
        headers.insert("aggregate-id".into(), self.aggregate_id.clone());
        headers.insert("created-at".into(), self.created_at.to_rfc3339());
        if let Some(id) = &self.correlation_id {
            headers.insert("correlation-id".into(), id.clone());
        }
        if let Some(id) = &self.causation_id {
            headers.insert("causation-id".into(), id.clone());
        }
        headers
    }

    /// 在 `now` 时刻是否可被认领：
    /// - PENDING 且无退避或退避已结束；
    /// - CLAIMED 但租约已过期（持有者崩溃或超时）。
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OutboxStatus::Pending => self.next_attempt_at.is_none_or(|at| at <= now),
            OutboxStatus::Claimed => self.claim_lease_expires_at.is_none_or(|at| at <= now),
            OutboxStatus::Dispatched | OutboxStatus::Failed => false,
        }
    }

    /// 当前是否由 `owner` 持有有效认领
    pub fn is_claimed_by(&self, owner: &str) -> bool {
        self.status == OutboxStatus::Claimed && self.claim_owner.as_deref() == Some(owner)
    }

    // ---- 状态迁移：仅供存储适配器在条件写入内部调用 ----

    pub fn claim(&mut self, owner: &str, lease_expires_at: DateTime<Utc>) {
        self.status = OutboxStatus::Claimed;
        self.claim_owner = Some(owner.to_string());
        self.claim_lease_expires_at = Some(lease_expires_at);
        self.next_attempt_at = None;
    }

    pub fn renew_lease(&mut self, lease_expires_at: DateTime<Utc>) {
        self.claim_lease_expires_at = Some(lease_expires_at);
    }

    pub fn mark_dispatched(&mut self, broker_message_id: String, at: DateTime<Utc>) {
        self.status = OutboxStatus::Dispatched;
        self.dispatched_at = Some(at);
        self.broker_message_id = Some(broker_message_id);
        self.last_error = None;
        self.release_lease();
    }

    pub fn schedule_retry(&mut self, retry_count: u32, next_attempt_at: DateTime<Utc>, error: String) {
        self.status = OutboxStatus::Pending;
        self.retry_count = retry_count;
        self.next_attempt_at = Some(next_attempt_at);
        self.last_error = Some(error);
        self.release_lease();
    }

    pub fn mark_failed(&mut self, retry_count: u32, error: String) {
        self.status = OutboxStatus::Failed;
        self.retry_count = retry_count;
        self.last_error = Some(error);
        self.release_lease();
    }

    /// 放弃认领：回到 PENDING，重试计数不变
    pub fn release(&mut self) {
        self.status = OutboxStatus::Pending;
        self.release_lease();
    }

    /// 死信重投：回到 PENDING 并重置重试计数
    pub fn redrive(&mut self) {
        self.status = OutboxStatus::Pending;
        self.retry_count = 0;
        self.next_attempt_at = None;
        self.last_error = None;
        self.release_lease();
    }

    fn release_lease(&mut self) {
        self.claim_owner = None;
        self.claim_lease_expires_at = None;
    }
}
