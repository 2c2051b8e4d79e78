//! 应用层（courier-application）
//!
//! 命令总线与处理器协议，以及在其外层按幂等键拦截重复请求的 `IdempotentCommandBus`。
//!
pub mod command;
pub mod command_bus;
pub mod command_handler;
pub mod context;
pub mod error;
pub mod idempotent_command_bus;
pub mod inmemory_command_bus;

pub use idempotent_command_bus::{CommandResponse, IdempotentCommandBus};
pub use inmemory_command_bus::InMemoryCommandBus;
