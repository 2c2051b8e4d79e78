use crate::error::DomainResult as Result;
use crate::idempotency::{IdempotencyRecord, IdempotencyStore, ReserveResult, StoredResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// 内存版幂等存储：预留通过 dashmap entry API 完成原子条件插入
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn try_reserve(
        &self,
        record: IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<ReserveResult> {
        match self.records.entry(record.key().to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(ReserveResult::Reserved)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().is_expired(now) {
                    slot.insert(record);
                    Ok(ReserveResult::Reserved)
                } else {
                    Ok(ReserveResult::Existing(slot.get().clone()))
                }
            }
        }
    }

    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .records
            .get(key)
            .filter(|r| !r.is_expired(now))
            .map(|r| r.value().clone()))
    }

    async fn complete(
        &self,
        key: &str,
        request_hash: &str,
        response: &StoredResponse,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self.records.get_mut(key) {
            Some(mut record) if record.request_hash() == request_hash => {
                Ok(record.complete(response, now))
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, request_hash: &str) -> Result<bool> {
        let removed = self.records.remove_if(key, |_, record| {
            record.request_hash() == request_hash && !record.is_completed()
        });
        Ok(removed.is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        self.records.retain(|_, record| {
            let keep = !record.is_expired(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        Ok(purged)
    }
}
