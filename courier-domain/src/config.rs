//! 运行配置（RelayConfig）
//!
//! 所有间隔、批量、重试与 TTL 参数均由外部提供（配置文件/环境），
//! 逻辑中不内置默认值。时长字段在序列化形态中以毫秒表示（`*_ms`）。
//!
use crate::error::{DomainError, DomainResult};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 顶层配置
#[derive(Clone, Debug, Builder, Serialize, Deserialize)]
pub struct RelayConfig {
    pub dispatcher: DispatcherConfig,
    pub inbox: InboxConfig,
    pub idempotency: IdempotencyConfig,
    pub retention: RetentionConfig,
}

impl RelayConfig {
    pub fn from_json_str(raw: &str) -> DomainResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DomainResult<()> {
        self.dispatcher.validate()?;
        self.inbox.validate()?;
        self.idempotency.validate()?;
        self.retention.validate()
    }
}

/// Outbox 投递器配置
#[derive(Clone, Debug, Builder, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// 轮询间隔
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// 单次轮询最多认领的行数
    pub batch_size: usize,
    /// 最大尝试次数（达到后进入死信）
    pub max_retries: u32,
    /// 退避基数：delay = min(base * 2^retry_count, cap)
    #[serde(rename = "backoff_base_ms", with = "millis")]
    pub backoff_base: Duration,
    /// 退避上限
    #[serde(rename = "backoff_cap_ms", with = "millis")]
    pub backoff_cap: Duration,
    /// 认领租约时长，过期后可被任意 worker 重新认领
    #[serde(rename = "claim_lease_duration_ms", with = "millis")]
    pub claim_lease_duration: Duration,
    /// 单次 broker 发送的超时时间
    #[serde(rename = "send_timeout_ms", with = "millis")]
    pub send_timeout: Duration,
    /// 同一轮内并发处理的聚合分组数
    pub worker_concurrency: usize,
}

impl DispatcherConfig {
    pub fn validate(&self) -> DomainResult<()> {
        non_zero("dispatcher.poll_interval", self.poll_interval)?;
        non_zero("dispatcher.backoff_base", self.backoff_base)?;
        non_zero("dispatcher.send_timeout", self.send_timeout)?;
        if self.batch_size == 0 {
            return Err(DomainError::invalid_config("dispatcher.batch_size must be > 0"));
        }
        if self.max_retries == 0 {
            return Err(DomainError::invalid_config("dispatcher.max_retries must be > 0"));
        }
        if self.worker_concurrency == 0 {
            return Err(DomainError::invalid_config(
                "dispatcher.worker_concurrency must be > 0",
            ));
        }
        if self.backoff_cap < self.backoff_base {
            return Err(DomainError::invalid_config(
                "dispatcher.backoff_cap must be >= dispatcher.backoff_base",
            ));
        }
        if self.claim_lease_duration <= self.send_timeout {
            return Err(DomainError::invalid_config(
                "dispatcher.claim_lease_duration must be greater than dispatcher.send_timeout",
            ));
        }
        Ok(())
    }

    /// 第 `retry_count` 次重试前的退避时长
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_cap, |d| d.min(self.backoff_cap))
    }
}

#[derive(Clone, Debug, Builder, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Inbox 记录保留窗口（按 first_seen_at 计算）
    #[serde(rename = "retention_ttl_ms", with = "millis")]
    pub retention_ttl: Duration,
}

impl InboxConfig {
    pub fn validate(&self) -> DomainResult<()> {
        non_zero("inbox.retention_ttl", self.retention_ttl)
    }
}

#[derive(Clone, Debug, Builder, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// 幂等记录存活时长
    #[serde(rename = "ttl_ms", with = "millis")]
    pub ttl: Duration,
    /// 并发请求等待首个请求完成的最长时间
    #[serde(rename = "wait_timeout_ms", with = "millis")]
    pub wait_timeout: Duration,
    /// 等待期间的轮询间隔
    #[serde(rename = "wait_poll_interval_ms", with = "millis")]
    pub wait_poll_interval: Duration,
}

impl IdempotencyConfig {
    pub fn validate(&self) -> DomainResult<()> {
        non_zero("idempotency.ttl", self.ttl)?;
        non_zero("idempotency.wait_poll_interval", self.wait_poll_interval)?;
        if self.wait_timeout < self.wait_poll_interval {
            return Err(DomainError::invalid_config(
                "idempotency.wait_timeout must be >= idempotency.wait_poll_interval",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Builder, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// 清理任务运行间隔
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
}

impl RetentionConfig {
    pub fn validate(&self) -> DomainResult<()> {
        non_zero("retention.sweep_interval", self.sweep_interval)
    }
}

fn non_zero(name: &str, value: Duration) -> DomainResult<()> {
    if value.is_zero() {
        return Err(DomainError::invalid_config(format!("{name} must be > 0")));
    }
    Ok(())
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
