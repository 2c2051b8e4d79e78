//! 消费侧 Inbox
//!
//! 以 message_id 去重，使至少一次的投递只产生一次业务效果。
//!
mod consumer;
mod message;
mod store;

pub use consumer::{ConsumeOutcome, ConsumeStats, IdempotentConsumer, MessageHandler};
pub use message::{InboundMessage, InboxMessage};
pub use store::InboxStore;
