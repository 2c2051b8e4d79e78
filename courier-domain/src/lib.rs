//! 事务性 Outbox / Inbox 领域层（courier-domain）
//!
//! 在服务与消息中间件之间提供至少一次（at-least-once）的可靠投递：
//! - `outbox`：与业务状态同事务写入的事件存储，以及投递器所需的认领/状态迁移接口
//! - `dispatch`：轮询投递器，带租约认领、按聚合保序、指数退避重试与死信
//! - `inbox`：消费者侧按 message_id 去重的幂等处理
//! - `idempotency`：HTTP 请求级幂等缓存（预留、回放、冲突检测）
//! - `broker`：消息中间件端口，区分可重试与不可重试错误
//! - `retention`：Inbox 与幂等记录的保留期清理
//!
//! 存储与传输只以 trait 形式出现，`memory` 特性提供全部端口的内存实现。
//!
//! 典型用法：
//! 1. 在 `in_transaction` 中写入业务状态并 `EventStore::append` 事件；
//! 2. 用 `Dispatcher::builder()` 组装投递器并 `start()`；
//! 3. 消费者侧用 `IdempotentConsumer` 包装业务处理器；
//! 4. 退出时对各 `TaskHandle` 调用 `shutdown()` 并 `join()`。
//!
pub mod broker;
pub mod clock;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod idempotency;
pub mod inbox;
#[cfg(feature = "memory")]
pub mod memory;
pub mod outbox;
pub mod retention;
pub mod runtime;
pub mod transaction;
