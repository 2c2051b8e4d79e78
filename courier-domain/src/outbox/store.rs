//! Outbox 存储端口
//!
//! - `EventStore`：在调用方事务内追加 outbox 行，事务提交则存在、回滚则从未存在；
//! - `OutboxStore`：投递器使用的认领与状态迁移操作。
//!
//! 所有状态迁移都必须是单条原子条件写入（行级 CAS），返回值表示调用方是否“赢得”该行，
//! 不允许先读后写两步实现。
//!
use super::OutboxEvent;
use crate::error::DomainResult as Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 事务内追加 outbox 行；不提供删除操作
#[async_trait]
pub trait EventStore<Tx: Send>: Send + Sync {
    async fn append(&self, tx: &mut Tx, event: OutboxEvent) -> Result<()>;
}

/// 投递器侧的 outbox 操作
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// 拉取 `now` 时刻可认领的行，按 created_at 升序，最多 `limit` 条（不做认领）
    async fn fetch_claimable(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>>;

    /// 原子认领：仅当行在 `now` 时刻仍可认领时写入 CLAIMED/owner/lease。
    /// 返回认领后的行；`None` 表示竞争失败或行已不可认领。
    async fn try_claim(
        &self,
        event_id: &str,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxEvent>>;

    /// 续租：仅当 `owner` 仍持有认领时把租约延长到 `lease_expires_at`
    async fn renew_claim(
        &self,
        event_id: &str,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// 标记投递成功（要求 `owner` 仍持有认领）
    async fn mark_dispatched(
        &self,
        event_id: &str,
        owner: &str,
        broker_message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// 退回 PENDING 并设置退避（要求 `owner` 仍持有认领）
    async fn schedule_retry(
        &self,
        event_id: &str,
        owner: &str,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool>;

    /// 进入死信（要求 `owner` 仍持有认领）
    async fn mark_failed(
        &self,
        event_id: &str,
        owner: &str,
        retry_count: u32,
        error: &str,
    ) -> Result<bool>;

    /// 放弃单行认领，重试计数不变
    async fn release_claim(&self, event_id: &str, owner: &str) -> Result<bool>;

    /// 放弃 `owner` 持有的全部认领（优雅关闭时调用）
    async fn release_claims(&self, owner: &str) -> Result<usize>;

    async fn get(&self, event_id: &str) -> Result<Option<OutboxEvent>>;

    /// 未到终态的行数（PENDING + CLAIMED），用于积压指标
    async fn count_pending(&self) -> Result<u64>;

    /// 死信列表，按 created_at 升序
    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// 运维重投：仅 FAILED 行可回到 PENDING
    async fn redrive(&self, event_id: &str) -> Result<bool>;
}
