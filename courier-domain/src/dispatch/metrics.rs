//! 投递指标
//!
//! 计数器：积压深度、投递数、重试数、死信数、认领竞争失败数。
//! 死信数大于 0 即视为需要告警。
//!
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

pub trait DispatchMetrics: Send + Sync {
    fn record_dispatched(&self);
    fn record_retry(&self);
    fn record_dead_letter(&self);
    fn record_claim_lost(&self);
    fn set_pending_depth(&self, depth: u64);
}

/// 进程内原子计数器实现
#[derive(Debug, Default)]
pub struct DispatchCounters {
    dispatched: AtomicU64,
    retries: AtomicU64,
    dead_letters: AtomicU64,
    claims_lost: AtomicU64,
    pending_depth: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub dispatched: u64,
    pub retries: u64,
    pub dead_letters: u64,
    pub claims_lost: u64,
    pub pending_depth: u64,
}

impl DispatchCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            claims_lost: self.claims_lost.load(Ordering::Relaxed),
            pending_depth: self.pending_depth.load(Ordering::Relaxed),
        }
    }

    pub fn alert_active(&self) -> bool {
        self.dead_letters.load(Ordering::Relaxed) > 0
    }
}

impl DispatchMetrics for DispatchCounters {
    fn record_dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dead_letter(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    fn record_claim_lost(&self) {
        self.claims_lost.fetch_add(1, Ordering::Relaxed);
    }

    fn set_pending_depth(&self, depth: u64) {
        self.pending_depth.store(depth, Ordering::Relaxed);
    }
}
