//! 内存版事务存储（InMemoryDatabase）
//!
//! 同时扮演事务管理器、Event Store 与 Outbox Store：
//! - 事务内的文档写入与 outbox 追加先暂存在 `InMemoryTransaction` 中；
//! - `commit` 在同一把锁内一次性应用全部写入，`rollback` 直接丢弃；
//! - 认领与状态迁移在锁内“检查 + 写入”，等价于行级条件更新。
//!
use crate::error::{DomainError, DomainResult as Result};
use crate::outbox::{EventStore, OutboxEvent, OutboxStatus, OutboxStore};
use crate::transaction::TransactionManager;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    outbox: BTreeMap<String, OutboxEvent>,
    documents: HashMap<(String, String), Value>,
}

#[derive(Default)]
pub struct InMemoryDatabase {
    state: Mutex<State>,
    tx_seq: AtomicU64,
}

/// 事务句柄：提交前的写入只对本句柄可见
#[derive(Debug)]
pub struct InMemoryTransaction {
    id: u64,
    outbox: Vec<OutboxEvent>,
    documents: Vec<(String, String, Value)>,
}

impl InMemoryTransaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 暂存一次文档写入（业务状态变更）
    pub fn put_document(
        &mut self,
        collection: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) {
        self.documents.push((collection.into(), key.into(), value));
    }
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self, collection: &str, key: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state
            .documents
            .get(&(collection.to_string(), key.to_string()))
            .cloned()
    }

    /// 全部 outbox 行快照，按 created_at 升序
    pub async fn events(&self) -> Vec<OutboxEvent> {
        let state = self.state.lock().await;
        let mut events: Vec<OutboxEvent> = state.outbox.values().cloned().collect();
        sort_by_age(&mut events);
        events
    }
}

fn sort_by_age(events: &mut [OutboxEvent]) {
    events.sort_by(|a, b| {
        a.created_at()
            .cmp(&b.created_at())
            .then_with(|| a.event_id().cmp(b.event_id()))
    });
}

#[async_trait]
impl TransactionManager for InMemoryDatabase {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx> {
        Ok(InMemoryTransaction {
            id: self.tx_seq.fetch_add(1, Ordering::Relaxed) + 1,
            outbox: Vec::new(),
            documents: Vec::new(),
        })
    }

    async fn commit(&self, tx: Self::Tx) -> Result<()> {
        let mut state = self.state.lock().await;

        // 先校验再写入：任何冲突都不留下部分提交
        let mut staged = HashSet::with_capacity(tx.outbox.len());
        for event in &tx.outbox {
            if state.outbox.contains_key(event.event_id()) || !staged.insert(event.event_id()) {
                return Err(DomainError::Transaction {
                    reason: format!(
                        "tx {}: duplicate outbox event id {}",
                        tx.id,
                        event.event_id()
                    ),
                });
            }
        }

        for (collection, key, value) in tx.documents {
            state.documents.insert((collection, key), value);
        }
        for event in tx.outbox {
            state.outbox.insert(event.event_id().to_string(), event);
        }
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<()> {
        drop(tx);
        Ok(())
    }
}

#[async_trait]
impl EventStore<InMemoryTransaction> for InMemoryDatabase {
    async fn append(&self, tx: &mut InMemoryTransaction, event: OutboxEvent) -> Result<()> {
        if event.status() != OutboxStatus::Pending {
            return Err(DomainError::invalid_state(format!(
                "outbox event {} must be appended as PENDING, got {}",
                event.event_id(),
                event.status()
            )));
        }
        tx.outbox.push(event);
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryDatabase {
    async fn fetch_claimable(&self, limit: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<OutboxEvent> = state
            .outbox
            .values()
            .filter(|e| e.is_claimable(now))
            .cloned()
            .collect();
        sort_by_age(&mut events);
        events.truncate(limit);
        Ok(events)
    }

    async fn try_claim(
        &self,
        event_id: &str,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxEvent>> {
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(event_id) {
            Some(event) if event.is_claimable(now) => {
                event.claim(owner, lease_expires_at);
                Ok(Some(event.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn renew_claim(
        &self,
        event_id: &str,
        owner: &str,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(event_id) {
            Some(event) if event.is_claimed_by(owner) => {
                event.renew_lease(lease_expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_dispatched(
        &self,
        event_id: &str,
        owner: &str,
        broker_message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(event_id) {
            Some(event) if event.is_claimed_by(owner) => {
                event.mark_dispatched(broker_message_id.to_string(), at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn schedule_retry(
        &self,
        event_id: &str,
        owner: &str,
        retry_count: u32,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(event_id) {
            Some(event) if event.is_claimed_by(owner) => {
                event.schedule_retry(retry_count, next_attempt_at, error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(
        &self,
        event_id: &str,
        owner: &str,
        retry_count: u32,
        error: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(event_id) {
            Some(event) if event.is_claimed_by(owner) => {
                event.mark_failed(retry_count, error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(&self, event_id: &str, owner: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(event_id) {
            Some(event) if event.is_claimed_by(owner) => {
                event.release();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claims(&self, owner: &str) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for event in state.outbox.values_mut() {
            if event.is_claimed_by(owner) {
                event.release();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn get(&self, event_id: &str) -> Result<Option<OutboxEvent>> {
        let state = self.state.lock().await;
        Ok(state.outbox.get(event_id).cloned())
    }

    async fn count_pending(&self) -> Result<u64> {
        let state = self.state.lock().await;
        let pending = state
            .outbox
            .values()
            .filter(|e| !e.status().is_terminal())
            .count();
        Ok(pending as u64)
    }

    async fn list_failed(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let state = self.state.lock().await;
        let mut failed: Vec<OutboxEvent> = state
            .outbox
            .values()
            .filter(|e| e.status() == OutboxStatus::Failed)
            .cloned()
            .collect();
        sort_by_age(&mut failed);
        failed.truncate(limit);
        Ok(failed)
    }

    async fn redrive(&self, event_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.outbox.get_mut(event_id) {
            Some(event) if event.status() == OutboxStatus::Failed => {
                event.redrive();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ev(aggregate_id: &str, created_at: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent::builder()
            .event_type("t".into())
            .aggregate_type("a".into())
            .aggregate_id(aggregate_id.to_string())
            .payload(serde_json::json!({}))
            .created_at(created_at)
            .build()
    }

    #[tokio::test]
    async fn commit_applies_documents_and_events_together() {
        let db = InMemoryDatabase::new();
        let mut tx = db.begin().await.unwrap();
        tx.put_document("accounts", "acc-1", serde_json::json!({"balance": 5}));
        db.append(&mut tx, ev("acc-1", Utc::now())).await.unwrap();

        assert!(db.events().await.is_empty());
        assert!(db.document("accounts", "acc-1").await.is_none());

        db.commit(tx).await.unwrap();
        assert_eq!(db.events().await.len(), 1);
        assert_eq!(
            db.document("accounts", "acc-1").await,
            Some(serde_json::json!({"balance": 5}))
        );
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_lease_expires() {
        let db = InMemoryDatabase::new();
        let now = Utc::now();
        let event = ev("acc-1", now);
        let id = event.event_id().to_string();
        let mut tx = db.begin().await.unwrap();
        db.append(&mut tx, event).await.unwrap();
        db.commit(tx).await.unwrap();

        let lease = now + Duration::seconds(30);
        assert!(db.try_claim(&id, "w-1", lease, now).await.unwrap().is_some());
        assert!(db.try_claim(&id, "w-2", lease, now).await.unwrap().is_none());
        assert!(!db.mark_dispatched(&id, "w-2", "m", now).await.unwrap());

        let later = now + Duration::seconds(31);
        let reclaimed = db
            .try_claim(&id, "w-2", later + Duration::seconds(30), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.claim_owner(), Some("w-2"));
        assert!(!db.mark_dispatched(&id, "w-1", "m", later).await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_event_id_aborts_whole_commit() {
        let db = InMemoryDatabase::new();
        let first = ev("acc-1", Utc::now());
        let dup = first.clone();

        let mut tx = db.begin().await.unwrap();
        db.append(&mut tx, first).await.unwrap();
        db.commit(tx).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        tx.put_document("accounts", "acc-2", serde_json::json!({}));
        db.append(&mut tx, dup).await.unwrap();
        assert!(db.commit(tx).await.is_err());
        assert!(db.document("accounts", "acc-2").await.is_none());
        assert_eq!(db.events().await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_event_id_within_one_transaction_is_rejected() {
        let db = InMemoryDatabase::new();
        let event = ev("acc-1", Utc::now());

        let mut tx = db.begin().await.unwrap();
        tx.put_document("accounts", "acc-1", serde_json::json!({}));
        db.append(&mut tx, event.clone()).await.unwrap();
        db.append(&mut tx, event).await.unwrap();

        let err = db.commit(tx).await.unwrap_err();
        assert!(matches!(err, DomainError::Transaction { .. }));
        assert!(db.events().await.is_empty());
        assert!(db.document("accounts", "acc-1").await.is_none());
    }

    #[tokio::test]
    async fn renew_extends_only_the_owners_lease() {
        let db = InMemoryDatabase::new();
        let now = Utc::now();
        let event = ev("acc-1", now);
        let id = event.event_id().to_string();
        let mut tx = db.begin().await.unwrap();
        db.append(&mut tx, event).await.unwrap();
        db.commit(tx).await.unwrap();

        db.try_claim(&id, "w-1", now + Duration::seconds(1), now)
            .await
            .unwrap()
            .unwrap();
        assert!(!db.renew_claim(&id, "w-2", now + Duration::seconds(60)).await.unwrap());
        assert!(db.renew_claim(&id, "w-1", now + Duration::seconds(60)).await.unwrap());

        let later = now + Duration::seconds(30);
        assert!(db.try_claim(&id, "w-2", later + Duration::seconds(30), later).await.unwrap().is_none());
        let row = db.get(&id).await.unwrap().unwrap();
        assert_eq!(row.claim_lease_expires_at(), Some(now + Duration::seconds(60)));
    }
}
