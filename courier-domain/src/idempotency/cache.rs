//! 幂等键缓存（IdempotencyCache）
//!
//! 在命令到达处理器之前拦截：
//! - 新键：原子预留后放行，处理完成写入响应；
//! - 同键同请求：重放已存响应，不调用处理器；
//! - 同键不同请求：冲突，不调用处理器。
//!
//! 在 TTL 窗口内，每个键至多产生一次对外可见的副作用。
//!
use super::{IdempotencyRecord, IdempotencyStore, ReserveResult, StoredResponse};
use crate::clock::{Clock, SystemClock};
use crate::config::IdempotencyConfig;
use crate::error::{DomainError, DomainResult as Result};
use bon::Builder;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// 获得执行权，处理完成后需调用 `complete` 或 `release`
    Acquired,
    /// 先前请求已完成，原样返回其响应
    Replay(StoredResponse),
    /// 先前请求仍在处理中
    InProgress,
}

/// `execute` 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub response: StoredResponse,
    /// 是否为重放（处理器未被调用）
    pub replayed: bool,
}

#[derive(Builder)]
pub struct IdempotencyCache {
    store: Arc<dyn IdempotencyStore>,
    #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)]
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl IdempotencyCache {
    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    pub async fn check_and_reserve(
        &self,
        key: &str,
        request_hash: &str,
        ttl: Duration,
    ) -> Result<Reservation> {
        let now = self.clock.now();
        let reservation = IdempotencyRecord::reservation(key, request_hash, now, ttl);

        match self.store.try_reserve(reservation, now).await? {
            ReserveResult::Reserved => {
                debug!(%key, "idempotency key reserved");
                Ok(Reservation::Acquired)
            }
            ReserveResult::Existing(record) if record.request_hash() != request_hash => {
                warn!(%key, "idempotency key reused with a different request");
                Err(DomainError::IdempotencyConflict {
                    key: key.to_string(),
                })
            }
            ReserveResult::Existing(record) => match record.response() {
                Some(response) => {
                    debug!(%key, status = response.status, "replaying stored response");
                    Ok(Reservation::Replay(response))
                }
                None => Ok(Reservation::InProgress),
            },
        }
    }

    pub async fn complete(
        &self,
        key: &str,
        request_hash: &str,
        response: &StoredResponse,
    ) -> Result<()> {
        let stored = self
            .store
            .complete(key, request_hash, response, self.clock.now())
            .await?;
        if !stored {
            return Err(DomainError::invalid_state(format!(
                "no open reservation for idempotency key {key}"
            )));
        }
        Ok(())
    }

    pub async fn release(&self, key: &str, request_hash: &str) -> Result<()> {
        if !self.store.release(key, request_hash).await? {
            debug!(%key, "no open reservation to release");
        }
        Ok(())
    }

    /// 以幂等方式执行 `handler`：
    /// - 获得执行权时调用处理器并缓存成功响应；处理器失败则释放预留并返回其错误；
    /// - 同键处理中时按 `wait_poll_interval` 轮询，直至拿到响应或超过 `wait_timeout`。
    pub async fn execute<F, Fut, E>(
        &self,
        key: &str,
        request_hash: &str,
        handler: F,
    ) -> std::result::Result<Execution, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<StoredResponse, E>>,
        E: From<DomainError>,
    {
        let deadline = Instant::now() + self.config.wait_timeout;
        let mut handler = Some(handler);

        loop {
            match self
                .check_and_reserve(key, request_hash, self.config.ttl)
                .await?
            {
                Reservation::Acquired => {
                    let Some(handler) = handler.take() else {
                        return Err(DomainError::invalid_state(format!(
                            "idempotency key {key} reserved twice by one caller"
                        ))
                        .into());
                    };
                    return self.run_reserved(key, request_hash, handler).await;
                }
                Reservation::Replay(response) => {
                    return Ok(Execution {
                        response,
                        replayed: true,
                    });
                }
                Reservation::InProgress => {
                    if let Some(response) = self.wait_for_response(key, request_hash, deadline).await? {
                        return Ok(Execution {
                            response,
                            replayed: true,
                        });
                    }
                    // 预留已释放或过期：重新竞争执行权
                }
            }
        }
    }

    /// 只读轮询处理中的记录，直到其写入响应（`Some`）或被释放/过期（`None`）
    async fn wait_for_response(
        &self,
        key: &str,
        request_hash: &str,
        deadline: Instant,
    ) -> Result<Option<StoredResponse>> {
        loop {
            if Instant::now() >= deadline {
                return Err(DomainError::IdempotencyInProgress {
                    key: key.to_string(),
                });
            }
            time::sleep(self.config.wait_poll_interval).await;

            match self.store.get(key, self.clock.now()).await? {
                Some(record) if record.request_hash() != request_hash => {
                    return Err(DomainError::IdempotencyConflict {
                        key: key.to_string(),
                    });
                }
                Some(record) => {
                    if let Some(response) = record.response() {
                        return Ok(Some(response));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    async fn run_reserved<F, Fut, E>(
        &self,
        key: &str,
        request_hash: &str,
        handler: F,
    ) -> std::result::Result<Execution, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<StoredResponse, E>>,
        E: From<DomainError>,
    {
        match handler().await {
            Ok(response) => {
                if let Err(err) = self.complete(key, request_hash, &response).await {
                    // 副作用已发生：仍返回响应，预留在 TTL 到期前保持“处理中”
                    error!(%key, error = %err, "failed to store idempotent response");
                }
                Ok(Execution {
                    response,
                    replayed: false,
                })
            }
            Err(err) => {
                if let Err(release_err) = self.release(key, request_hash).await {
                    warn!(%key, error = %release_err, "failed to release idempotency reservation");
                }
                Err(err)
            }
        }
    }

    /// 删除已过期记录
    pub async fn purge_expired(&self) -> Result<usize> {
        self.store.purge_expired(self.clock.now()).await
    }
}
