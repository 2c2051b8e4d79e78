//! 领域层统一错误定义
//!
//! 聚焦序列化、投递/消费、存储、幂等与配置校验等最小必要集合，
//! 便于在各实现层统一转换为 `DomainError`。
//!
use thiserror::Error;

/// 统一错误类型（基础库最小必要集）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DomainError {
    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("parse error: {reason}")]
    Parse { reason: String },

    // --- 投递/消费 ---
    #[error("broker error: {reason}")]
    Broker { reason: String },
    #[error("event handler error: handler={handler}, reason={reason}")]
    EventHandler { handler: String, reason: String },

    // --- 存储/事务 ---
    #[error("transaction error: {reason}")]
    Transaction { reason: String },
    #[error("database error: {reason}")]
    Database { reason: String },

    // --- 幂等 ---
    #[error("idempotency conflict: key={key} was used with a different request")]
    IdempotencyConflict { key: String },
    #[error("idempotency in progress: key={key}")]
    IdempotencyInProgress { key: String },

    // --- 状态与配置 ---
    #[error("invalid state: {reason}")]
    InvalidState { reason: String },
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },
    #[error("not found: {reason}")]
    NotFound { reason: String },
}

impl DomainError {
    pub fn broker(reason: impl Into<String>) -> Self {
        Self::Broker {
            reason: reason.into(),
        }
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// 是否为幂等键冲突（同一键、不同请求体）
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::IdempotencyConflict { .. })
    }
}

/// 统一 Result 类型别名
pub type DomainResult<T> = Result<T, DomainError>;

// ---- Cross-crate conversions for infrastructure convenience ----
// 允许在基础设施层直接使用 `?` 将 sqlx/ulid 等错误转换为 DomainError

#[cfg(feature = "infra-sqlx")]
impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DomainError::NotFound {
                reason: "row not found".to_string(),
            },
            other => DomainError::Database {
                reason: other.to_string(),
            },
        }
    }
}

impl From<ulid::DecodeError> for DomainError {
    fn from(err: ulid::DecodeError) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<chrono::ParseError> for DomainError {
    fn from(err: chrono::ParseError) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}
