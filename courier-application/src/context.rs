use courier_domain::context::BusinessContext;

/// 应用层上下文（Application Context）
///
/// 承载一次命令调用所需的横切信息，例如：
/// - 业务语境（`BusinessContext`）：关联追踪 `correlation_id`、因果链 `causation_id`、
///   执行者类型/ID 等，会随 outbox 行进入消息头；
/// - 幂等键（`idempotency_key`）：通常来自 HTTP `Idempotency-Key` 请求头。
///
/// 典型用法：
/// ```rust
/// use courier_application::context::AppContext;
/// use courier_domain::context::BusinessContext;
///
/// let ctx = AppContext {
///     biz: BusinessContext::builder()
///         .maybe_correlation_id(Some("cor-123".into()))
///         .maybe_causation_id(Some("cau-abc".into()))
///         .maybe_actor_type(Some("user".into()))
///         .maybe_actor_id(Some("u-1".into()))
///         .build(),
///     idempotency_key: Some("idem-xyz".into()),
/// };
/// assert_eq!(ctx.idempotency_key(), Some("idem-xyz"));
/// ```
#[derive(Clone, Debug, Default)]
pub struct AppContext {
    /// 业务语境（链路追踪、审计主体、操作因果）
    pub biz: BusinessContext,
    /// 幂等键（可选）：为空则命令不参与幂等缓存
    pub idempotency_key: Option<String>,
}

impl AppContext {
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }
}
