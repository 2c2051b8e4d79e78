//! 投递子系统（dispatch）
//!
//! - `Dispatcher`：周期认领并发送 outbox 行，处理重试、死信与崩溃恢复；
//! - `DispatchMetrics`：积压、投递、重试、死信计数与告警判断。
//!
//! 排序保证：同一轮内同一聚合的事件按 created_at 顺序发送；跨聚合、跨轮次
//! （下一轮可能由其他 worker 认领）均不保证顺序，消费方不应假设更强的顺序。
//!
mod dispatcher;
mod metrics;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use metrics::{DispatchCounters, DispatchMetrics, MetricsSnapshot};
