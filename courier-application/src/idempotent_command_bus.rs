//! 幂等命令总线（IdempotentCommandBus）
//!
//! 包装任意 `CommandBus`，在命令到达处理器之前按 `AppContext::idempotency_key` 拦截：
//! - 无幂等键：直接分发；
//! - 新键：调用处理器，成功结果连同 `C::SUCCESS_STATUS` 缓存；
//! - 同键同请求：原样重放缓存的响应，处理器不会被调用；
//! - 同键不同请求：返回冲突错误（见 [`AppError::is_conflict`]）。
//!
//! 请求指纹为 `sha256(NAME || 0x00 || json(cmd))` 的十六进制串。
//! 处理器失败不会被缓存，同一键可在修正后重试。
//!
use crate::{command::Command, command_bus::CommandBus, context::AppContext, error::AppError};
use courier_domain::idempotency::{IdempotencyCache, StoredResponse};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// 对外响应：状态码 + 结果体，以及是否来自缓存重放
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse<T> {
    pub status: u16,
    pub body: T,
    pub replayed: bool,
}

pub struct IdempotentCommandBus<B> {
    inner: B,
    cache: Arc<IdempotencyCache>,
}

impl<B: CommandBus> IdempotentCommandBus<B> {
    pub fn new(inner: B, cache: Arc<IdempotencyCache>) -> Self {
        Self { inner, cache }
    }

    pub async fn dispatch<C: Command>(
        &self,
        ctx: &AppContext,
        cmd: C,
    ) -> Result<CommandResponse<C::Output>, AppError> {
        let Some(key) = ctx.idempotency_key() else {
            let body = self.inner.dispatch(ctx, cmd).await?;
            return Ok(CommandResponse {
                status: C::SUCCESS_STATUS,
                body,
                replayed: false,
            });
        };

        let hash = request_hash(&cmd)?;
        let execution = self
            .cache
            .execute(key, &hash, || async move {
                let output = self.inner.dispatch(ctx, cmd).await?;
                let body = serde_json::to_value(&output)?;
                Ok::<_, AppError>(StoredResponse::new(C::SUCCESS_STATUS, body))
            })
            .await?;

        if execution.replayed {
            info!(command = C::NAME, %key, "replayed stored command response");
        } else {
            debug!(command = C::NAME, %key, "command executed under idempotency key");
        }

        Ok(CommandResponse {
            status: execution.response.status,
            body: serde_json::from_value(execution.response.body)?,
            replayed: execution.replayed,
        })
    }
}

/// 命令的请求指纹：相同命令名与相同序列化结果得到相同指纹
pub fn request_hash<C: Command>(cmd: &C) -> Result<String, AppError> {
    let payload = serde_json::to_vec(cmd)?;
    let mut hasher = Sha256::new();
    hasher.update(C::NAME.as_bytes());
    hasher.update([0u8]);
    hasher.update(&payload);
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Open {
        owner: String,
    }

    impl Command for Open {
        const NAME: &'static str = "account.open";
        type Output = ();
    }

    #[derive(Serialize)]
    struct Close {
        owner: String,
    }

    impl Command for Close {
        const NAME: &'static str = "account.close";
        type Output = ();
    }

    #[test]
    fn hash_depends_on_name_and_payload() {
        let a = request_hash(&Open { owner: "ann".into() }).unwrap();
        let b = request_hash(&Open { owner: "ann".into() }).unwrap();
        let c = request_hash(&Open { owner: "bob".into() }).unwrap();
        let d = request_hash(&Close { owner: "ann".into() }).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }
}
