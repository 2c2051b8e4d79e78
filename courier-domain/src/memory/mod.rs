//! 内存适配器
//!
//! 各端口的内存实现，可直接用作测试替身、示例与本地开发的存储。
//!
mod database;
mod idempotency;
mod inbox;

pub use database::{InMemoryDatabase, InMemoryTransaction};
pub use idempotency::InMemoryIdempotencyStore;
pub use inbox::InMemoryInboxStore;
