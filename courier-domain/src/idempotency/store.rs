//! 幂等存储端口
//!
//! 预留必须是单条原子条件插入，用以裁决携带同一键的并发请求。
//!
use super::{IdempotencyRecord, StoredResponse};
use crate::error::DomainResult as Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum ReserveResult {
    /// 插入成功，调用方获得执行权
    Reserved,
    /// 键已存在且未过期
    Existing(IdempotencyRecord),
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// 键不存在或已过期时插入 `record`，否则返回现有记录
    async fn try_reserve(&self, record: IdempotencyRecord, now: DateTime<Utc>)
    -> Result<ReserveResult>;

    /// 读取未过期的记录
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<IdempotencyRecord>>;

    /// 为 (key, request_hash) 的预留写入响应
    async fn complete(
        &self,
        key: &str,
        request_hash: &str,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// 删除尚未完成的预留（处理失败时允许客户端重试）
    async fn release(&self, key: &str, request_hash: &str) -> Result<bool>;

    /// 删除已过期记录，返回删除条数
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}
