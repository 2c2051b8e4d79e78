//! 业务上下文（BusinessContext）
//!
//! 随命令一路传递的追踪信息，写入 outbox 行后会出现在 broker 消息头中。
//!
use bon::Builder;
use serde::{Deserialize, Serialize};

#[derive(Builder, Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessContext {
    /// 关联ID：同一业务流程中的所有消息共享
    correlation_id: Option<String>,
    /// 因果ID：直接触发本次操作的消息或请求
    causation_id: Option<String>,
    /// 触发操作的主体类型（如用户、系统等）
    actor_type: Option<String>,
    actor_id: Option<String>,
}

impl BusinessContext {
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn actor_type(&self) -> Option<&str> {
        self.actor_type.as_deref()
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref()
    }

    /// 以当前上下文为因，派生下游上下文：沿用 correlation，causation 指向 `cause_id`
    pub fn caused_by(&self, cause_id: impl Into<String>) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            causation_id: Some(cause_id.into()),
            actor_type: self.actor_type.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}
