use crate::clock::to_chrono;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// 缓存的响应（原样重放）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub body: Value,
}

impl StoredResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }
}

/// 幂等记录；尚未写入响应时即为“预留”（处理中）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    key: String,
    request_hash: String,
    response_status: Option<u16>,
    response_body: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn reservation(
        key: impl Into<String>,
        request_hash: impl Into<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            request_hash: request_hash.into(),
            response_status: None,
            response_body: None,
            created_at: now,
            updated_at: now,
            expires_at: now + to_chrono(ttl),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn request_hash(&self) -> &str {
        &self.request_hash
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_completed(&self) -> bool {
        self.response_status.is_some()
    }

    pub fn response(&self) -> Option<StoredResponse> {
        let status = self.response_status?;
        Some(StoredResponse {
            status,
            body: self.response_body.clone().unwrap_or(Value::Null),
        })
    }

    /// 写入响应；已完成的记录不可覆盖，返回 `false`
    pub fn complete(&mut self, response: &StoredResponse, now: DateTime<Utc>) -> bool {
        if self.is_completed() {
            return false;
        }
        self.response_status = Some(response.status);
        self.response_body = Some(response.body.clone());
        self.updated_at = now;
        true
    }
}
