//! Inbox 存储端口
//!
//! `record_attempt`/`mark_processed` 必须各自是单条原子写入。
//!
use super::InboxMessage;
use crate::error::DomainResult as Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn get(&self, message_id: &str) -> Result<Option<InboxMessage>>;

    /// 原子 upsert：首次见到时创建，未处理时 attempts+1 并刷新 last_attempt_at；
    /// 已处理的记录原样返回。返回写入后的记录。
    async fn record_attempt(&self, message_id: &str, now: DateTime<Utc>) -> Result<InboxMessage>;

    /// 设置 processed_at 并清空 last_error；记录不存在时先创建。已处理时返回 `false`
    async fn mark_processed(&self, message_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// 记录处理失败原因，processed_at 保持为空
    async fn record_failure(&self, message_id: &str, error: &str) -> Result<bool>;

    /// 删除 first_seen_at 早于 `cutoff` 的记录，返回删除条数
    async fn purge_seen_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}
