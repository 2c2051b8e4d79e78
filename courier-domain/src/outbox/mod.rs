//! 发布侧 Outbox
//!
//! 定义 outbox 行模型与存储端口；投递逻辑见 `dispatch`。
//!
mod event;
mod store;

pub use event::{MessageHeaders, OutboxEvent, OutboxStatus};
pub use store::{EventStore, OutboxStore};
