//! HTTP 命令幂等（idempotency）
//!
//! 以客户端提供的幂等键为范围提供“至多一次”保证，与传输层重试无关。
//!
mod cache;
mod record;
mod store;

pub use cache::{Execution, IdempotencyCache, Reservation};
pub use record::{IdempotencyRecord, StoredResponse};
pub use store::{IdempotencyStore, ReserveResult};
