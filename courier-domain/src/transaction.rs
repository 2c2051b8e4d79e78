//! 事务边界（TransactionManager）
//!
//! Event Store 追加 outbox 行时必须与业务状态变更共享同一事务句柄。
//!
use crate::error::DomainError;
use async_trait::async_trait;
use futures_core::future::BoxFuture;
use tracing::warn;

#[async_trait]
pub trait TransactionManager: Send + Sync {
    type Tx: Send;

    async fn begin(&self) -> Result<Self::Tx, DomainError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), DomainError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), DomainError>;
}

/// 在事务中执行 `f`：返回 `Ok` 时提交，返回 `Err` 时回滚。
///
/// 回滚失败只记录日志，调用方拿到的始终是 `f` 的原始错误。
pub async fn in_transaction<M, T, E, F>(manager: &M, f: F) -> Result<T, E>
where
    M: TransactionManager + ?Sized,
    E: From<DomainError> + std::fmt::Display,
    F: for<'a> FnOnce(&'a mut M::Tx) -> BoxFuture<'a, Result<T, E>>,
{
    let mut tx = manager.begin().await?;

    match f(&mut tx).await {
        Ok(value) => {
            manager.commit(tx).await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = manager.rollback(tx).await {
                warn!(error = %err, rollback_error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}
