//! Outbox 投递器（Dispatcher）
//!
//! 周期性地“拉取 → 认领 → 发送 → 标记”：
//! - 认领是单条原子条件写入，多个副本并发运行无需选主；
//! - 同一轮内按 aggregate_id 分组，组内串行、组间并发，保证同一聚合的发送顺序；
//! - 每次发送前续租，存活的 worker 不会在排队或发送期间失去认领；
//! - 暂时失败按指数退避退回 PENDING，重试耗尽或永久失败进入死信（FAILED）；
//! - 关闭时停止认领新批次，放弃本 worker 仍持有的认领。
//!
use super::metrics::{DispatchCounters, DispatchMetrics};
use crate::broker::{BrokerError, BrokerGateway};
use crate::clock::{Clock, SystemClock, to_chrono};
use crate::config::DispatcherConfig;
use crate::error::DomainResult as Result;
use crate::outbox::{OutboxEvent, OutboxStore};
use crate::runtime::{TaskHandle, run_periodic};
use bon::Builder;
use futures_util::{StreamExt, stream};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Builder)]
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    gateway: Arc<dyn BrokerGateway>,
    #[builder(default = Arc::new(DispatchCounters::new()) as Arc<dyn DispatchMetrics>)]
    metrics: Arc<dyn DispatchMetrics>,
    #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)]
    clock: Arc<dyn Clock>,
    /// 认领持有者标识，多副本间必须唯一
    #[builder(into, default = ulid::Ulid::new().to_string())]
    worker_id: String,
    config: DispatcherConfig,
}

/// 单轮投递结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub dispatched: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    /// 认领竞争失败（被其他 worker 抢先）
    pub lost_races: usize,
    /// 发送后发现认领已被他人接管，结果未落库
    pub lease_lost: usize,
    /// 本轮未处理、已放弃认领的行
    pub released: usize,
}

impl DispatchReport {
    fn merge(&mut self, other: DispatchReport) {
        self.claimed += other.claimed;
        self.dispatched += other.dispatched;
        self.retried += other.retried;
        self.dead_lettered += other.dead_lettered;
        self.lost_races += other.lost_races;
        self.lease_lost += other.lease_lost;
        self.released += other.released;
    }
}

enum Renewal {
    Held,
    Lost,
}

enum SendOutcome {
    Dispatched,
    Retried,
    DeadLettered,
    LeaseLost,
}

impl Dispatcher {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// 启动周期投递任务，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> TaskHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.run(token.clone()));
        TaskHandle::new(token, vec![task])
    }

    /// 运行投递循环直到 `token` 被取消，退出前放弃仍持有的认领
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(worker_id = %self.worker_id, "outbox dispatcher started");

        {
            let this = self.clone();
            let cycle_token = token.clone();
            run_periodic(token.clone(), self.config.poll_interval, move || {
                let this = this.clone();
                let token = cycle_token.clone();
                async move {
                    if let Err(err) = this.poll(&token).await {
                        error!(worker_id = %this.worker_id, error = %err, "outbox poll failed");
                    }
                }
            })
            .await;
        }

        match self.store.release_claims(&self.worker_id).await {
            Ok(released) => {
                info!(worker_id = %self.worker_id, released, "outbox dispatcher stopped")
            }
            Err(err) => {
                warn!(worker_id = %self.worker_id, error = %err, "failed to release claims on shutdown")
            }
        }
    }

    /// 执行一轮投递
    pub async fn poll_once(&self) -> Result<DispatchReport> {
        self.poll(&CancellationToken::new()).await
    }

    async fn poll(&self, token: &CancellationToken) -> Result<DispatchReport> {
        let now = self.clock.now();
        let lease_expires_at = now + to_chrono(self.config.claim_lease_duration);
        let candidates = self
            .store
            .fetch_claimable(self.config.batch_size, now)
            .await?;

        let mut report = DispatchReport::default();
        let mut claimed = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if token.is_cancelled() {
                break;
            }
            match self
                .store
                .try_claim(candidate.event_id(), &self.worker_id, lease_expires_at, now)
                .await
            {
                Ok(Some(event)) => claimed.push(event),
                Ok(None) => {
                    report.lost_races += 1;
                    self.metrics.record_claim_lost();
                    debug!(event_id = %candidate.event_id(), worker_id = %self.worker_id, "claim race lost, skipping");
                }
                Err(err) => {
                    // 已认领的行照常处理，其余留给下一轮
                    error!(event_id = %candidate.event_id(), error = %err, "outbox claim failed, stopping claim loop");
                    break;
                }
            }
        }
        report.claimed = claimed.len();

        let groups = partition_by_aggregate(claimed);
        let group_reports: Vec<DispatchReport> = stream::iter(groups)
            .map(|group| self.dispatch_group(group, token))
            .buffer_unordered(self.config.worker_concurrency)
            .collect()
            .await;
        for group_report in group_reports {
            report.merge(group_report);
        }

        match self.store.count_pending().await {
            Ok(depth) => self.metrics.set_pending_depth(depth),
            Err(err) => warn!(error = %err, "failed to read outbox pending depth"),
        }

        if report.claimed > 0 {
            debug!(worker_id = %self.worker_id, ?report, "outbox poll finished");
        }
        Ok(report)
    }

    /// 组内串行发送；任一事件未成功投递时，放弃本组其余认领，避免后序事件越过前序事件。
    /// 每次发送前为本组剩余事件续租，组内排队时间不会让租约过期。
    async fn dispatch_group(
        &self,
        mut events: VecDeque<OutboxEvent>,
        token: &CancellationToken,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();

        while let Some(event) = events.pop_front() {
            if token.is_cancelled() {
                events.push_front(event);
                break;
            }

            match self.renew_leases(&event, &mut events).await {
                Ok(Renewal::Held) => {}
                Ok(Renewal::Lost) => {
                    warn!(event_id = %event.event_id(), worker_id = %self.worker_id, "outbox claim lost before send, skipping");
                    report.lease_lost += 1;
                    break;
                }
                Err(err) => {
                    error!(event_id = %event.event_id(), error = %err, "failed to renew outbox claim");
                    events.push_front(event);
                    break;
                }
            }

            match self.send(&event).await {
                Ok(SendOutcome::Dispatched) => {
                    report.dispatched += 1;
                    continue;
                }
                Ok(SendOutcome::Retried) => report.retried += 1,
                Ok(SendOutcome::DeadLettered) => report.dead_lettered += 1,
                Ok(SendOutcome::LeaseLost) => report.lease_lost += 1,
                Err(err) => {
                    // 结果未能落库：认领保留至租约过期后由任意 worker 重新认领
                    error!(event_id = %event.event_id(), error = %err, "failed to record outbox outcome");
                }
            }
            break;
        }

        for event in events.drain(..) {
            match self.store.release_claim(event.event_id(), &self.worker_id).await {
                Ok(true) => report.released += 1,
                Ok(false) => {}
                Err(err) => {
                    warn!(event_id = %event.event_id(), error = %err, "failed to release outbox claim")
                }
            }
        }

        report
    }

    /// 把当前事件与 `rest` 的租约延长到 `now + claim_lease_duration`。
    /// `rest` 中首个续租失败的行已归他人，它及其后的行不再在本轮发送。
    async fn renew_leases(
        &self,
        event: &OutboxEvent,
        rest: &mut VecDeque<OutboxEvent>,
    ) -> Result<Renewal> {
        let lease_expires_at = self.clock.now() + to_chrono(self.config.claim_lease_duration);
        if !self
            .store
            .renew_claim(event.event_id(), &self.worker_id, lease_expires_at)
            .await?
        {
            return Ok(Renewal::Lost);
        }

        let mut lost_at = None;
        for (i, next) in rest.iter().enumerate() {
            if !self
                .store
                .renew_claim(next.event_id(), &self.worker_id, lease_expires_at)
                .await?
            {
                lost_at = Some(i);
                break;
            }
        }
        if let Some(i) = lost_at {
            for held in rest.split_off(i) {
                // 归他人的行释放会返回 false，其后仍属本 worker 的行回到 PENDING
                if let Err(err) = self.store.release_claim(held.event_id(), &self.worker_id).await {
                    warn!(event_id = %held.event_id(), error = %err, "failed to release outbox claim");
                }
            }
        }
        Ok(Renewal::Held)
    }

    async fn send(&self, event: &OutboxEvent) -> Result<SendOutcome> {
        let headers = event.headers();
        let send = self.gateway.send(
            event.aggregate_type(),
            event.aggregate_id(),
            event.payload(),
            &headers,
        );
        let result = match time::timeout(self.config.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::transient(format!(
                "send timed out after {}ms",
                self.config.send_timeout.as_millis()
            ))),
        };
        let now = self.clock.now();

        match result {
            Ok(message_id) => {
                let recorded = self
                    .store
                    .mark_dispatched(event.event_id(), &self.worker_id, &message_id, now)
                    .await?;
                if !recorded {
                    warn!(
                        event_id = %event.event_id(),
                        broker_message_id = %message_id,
                        "claim lost before marking dispatched, downstream may see a duplicate"
                    );
                    return Ok(SendOutcome::LeaseLost);
                }
                self.metrics.record_dispatched();
                debug!(
                    event_id = %event.event_id(),
                    aggregate_id = %event.aggregate_id(),
                    broker_message_id = %message_id,
                    "outbox event dispatched"
                );
                Ok(SendOutcome::Dispatched)
            }
            Err(err) if err.is_retriable() => {
                let retry_count = event.retry_count().saturating_add(1);
                if retry_count >= self.config.max_retries {
                    return self.dead_letter(event, retry_count, &err).await;
                }

                let delay = self.config.backoff_for(retry_count);
                let next_attempt_at = now + to_chrono(delay);
                let recorded = self
                    .store
                    .schedule_retry(
                        event.event_id(),
                        &self.worker_id,
                        retry_count,
                        next_attempt_at,
                        &err.to_string(),
                    )
                    .await?;
                if !recorded {
                    return Ok(SendOutcome::LeaseLost);
                }
                self.metrics.record_retry();
                warn!(
                    event_id = %event.event_id(),
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "outbox send failed, retry scheduled"
                );
                Ok(SendOutcome::Retried)
            }
            Err(err) => self.dead_letter(event, event.retry_count(), &err).await,
        }
    }

    async fn dead_letter(
        &self,
        event: &OutboxEvent,
        retry_count: u32,
        err: &BrokerError,
    ) -> Result<SendOutcome> {
        let recorded = self
            .store
            .mark_failed(event.event_id(), &self.worker_id, retry_count, &err.to_string())
            .await?;
        if !recorded {
            return Ok(SendOutcome::LeaseLost);
        }
        self.metrics.record_dead_letter();
        error!(
            event_id = %event.event_id(),
            event_type = %event.event_type(),
            aggregate_id = %event.aggregate_id(),
            retry_count,
            error = %err,
            "outbox event dead-lettered, operator intervention required"
        );
        Ok(SendOutcome::DeadLettered)
    }

    /// 死信列表
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        self.store.list_failed(limit).await
    }

    /// 将死信行重新放回 PENDING；非 FAILED 行返回 `false`
    pub async fn redrive(&self, event_id: &str) -> Result<bool> {
        let redriven = self.store.redrive(event_id).await?;
        if redriven {
            info!(%event_id, "dead-lettered outbox event redriven");
        }
        Ok(redriven)
    }
}

/// 按 aggregate_id 分组，组的顺序与组内顺序均保持输入顺序（created_at 升序）
fn partition_by_aggregate(events: Vec<OutboxEvent>) -> Vec<VecDeque<OutboxEvent>> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<VecDeque<OutboxEvent>> = Vec::new();

    for event in events {
        match index.get(event.aggregate_id()) {
            Some(&i) => groups[i].push_back(event),
            None => {
                index.insert(event.aggregate_id().to_string(), groups.len());
                groups.push(VecDeque::from([event]));
            }
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ev(id: &str, aggregate_id: &str) -> OutboxEvent {
        OutboxEvent::builder()
            .event_id(id.to_string())
            .event_type("t".into())
            .aggregate_type("a".into())
            .aggregate_id(aggregate_id.to_string())
            .payload(serde_json::json!({}))
            .created_at(Utc::now())
            .build()
    }

    #[test]
    fn partition_keeps_order_within_aggregate() {
        let groups = partition_by_aggregate(vec![
            ev("1", "A"),
            ev("2", "B"),
            ev("3", "A"),
            ev("4", "C"),
            ev("5", "B"),
        ]);
        let ids: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|e| e.event_id()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["1", "3"], vec!["2", "5"], vec!["4"]]);
    }
}
