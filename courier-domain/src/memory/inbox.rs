use crate::error::DomainResult as Result;
use crate::inbox::{InboxMessage, InboxStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// 内存版 Inbox：每个 message_id 的读写都在 dashmap 分片锁内完成
#[derive(Default)]
pub struct InMemoryInboxStore {
    messages: DashMap<String, InboxMessage>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn get(&self, message_id: &str) -> Result<Option<InboxMessage>> {
        Ok(self.messages.get(message_id).map(|m| m.value().clone()))
    }

    async fn record_attempt(&self, message_id: &str, now: DateTime<Utc>) -> Result<InboxMessage> {
        let mut entry = self
            .messages
            .entry(message_id.to_string())
            .or_insert_with(|| InboxMessage::first_seen(message_id, now));
        if !entry.is_processed() {
            entry.record_attempt(now);
        }
        Ok(entry.clone())
    }

    async fn mark_processed(&self, message_id: &str, now: DateTime<Utc>) -> Result<bool> {
        // 处理期间记录可能已被保留期清理删除，此时重建并标记
        let mut message = self
            .messages
            .entry(message_id.to_string())
            .or_insert_with(|| InboxMessage::first_seen(message_id, now));
        Ok(message.mark_processed(now))
    }

    async fn record_failure(&self, message_id: &str, error: &str) -> Result<bool> {
        match self.messages.get_mut(message_id) {
            Some(mut message) if !message.is_processed() => {
                message.record_failure(error.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_seen_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut purged = 0;
        self.messages.retain(|_, message| {
            let keep = message.first_seen_at() >= cutoff;
            if !keep {
                purged += 1;
            }
            keep
        });
        Ok(purged)
    }
}
