use serde::Serialize;
use serde::de::DeserializeOwned;

/// 应用层命令（Command）
///
/// 表达“意图”的写操作请求，通常会修改领域状态并在同一事务内写入 outbox。
/// - 建议保持语义化的“动宾结构”命名，如 `OpenAccount`、`CloseOrder`。
/// - 命令需可序列化：幂等键的请求指纹由 `NAME` 与序列化后的命令共同计算。
///
/// 关联常量：
/// - `NAME`：命令的稳定名称，用于日志、追踪、路由与请求指纹。避免依赖 `type_name::<T>()`。
/// - `SUCCESS_STATUS`：成功时对外返回的状态码，随响应一起缓存与重放。
pub trait Command: Serialize + Send + Sync + 'static {
    /// 命令的稳定名称（建议常量字符串，不随重构变化）
    const NAME: &'static str;

    const SUCCESS_STATUS: u16 = 200;

    /// 成功结果；需可序列化以便缓存后原样重放
    type Output: Serialize + DeserializeOwned + Send + 'static;
}
