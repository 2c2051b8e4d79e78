//! 保留期清理（RetentionSweeper）
//!
//! 周期删除超过保留窗口的 Inbox 记录与已过期的幂等记录。
//! Outbox 行不在此清理，由离线归档处理。
//!
//! 注意：Inbox 去重窗口即保留窗口，broker 的重投时限必须短于 `inbox.retention_ttl`。
//!
use crate::clock::{Clock, SystemClock, to_chrono};
use crate::config::{InboxConfig, RetentionConfig};
use crate::error::DomainResult as Result;
use crate::idempotency::IdempotencyStore;
use crate::inbox::InboxStore;
use crate::runtime::{TaskHandle, run_periodic};
use bon::Builder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Builder)]
pub struct RetentionSweeper {
    inbox: Arc<dyn InboxStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)]
    clock: Arc<dyn Clock>,
    inbox_config: InboxConfig,
    config: RetentionConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inbox_purged: usize,
    pub idempotency_purged: usize,
}

impl RetentionSweeper {
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let cutoff = now - to_chrono(self.inbox_config.retention_ttl);

        let report = SweepReport {
            inbox_purged: self.inbox.purge_seen_before(cutoff).await?,
            idempotency_purged: self.idempotency.purge_expired(now).await?,
        };
        if report.inbox_purged > 0 || report.idempotency_purged > 0 {
            info!(
                inbox_purged = report.inbox_purged,
                idempotency_purged = report.idempotency_purged,
                "retention sweep finished"
            );
        }
        Ok(report)
    }

    pub fn start(self: Arc<Self>) -> TaskHandle {
        let token = CancellationToken::new();
        let interval = self.config.sweep_interval;
        let task = tokio::spawn(run_periodic(token.clone(), interval, move || {
            let this = self.clone();
            async move {
                if let Err(err) = this.sweep_once().await {
                    warn!(error = %err, "retention sweep failed");
                }
            }
        }));
        TaskHandle::new(token, vec![task])
    }
}
