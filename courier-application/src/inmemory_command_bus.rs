use crate::{
    command::Command, command_bus::CommandBus, command_handler::CommandHandler,
    context::AppContext, error::AppError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::any::{Any, TypeId, type_name, type_name_of_val};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

type BoxAnySend = Box<dyn Any + Send>;

type CmdHandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxAnySend, AppError>> + Send + 'a>>;

type CmdHandlerFn =
    Arc<dyn for<'a> Fn(BoxAnySend, &'a AppContext) -> CmdHandlerFuture<'a> + Send + Sync>;

/// 基于内存的 CommandBus 实现
/// - 通过 TypeId 注册不同 Command 对应的 Handler
/// - 运行时以类型擦除（Any）方式进行调度，并在调用端还原 `C::Output`
pub struct InMemoryCommandBus {
    handlers: DashMap<TypeId, (&'static str, CmdHandlerFn)>,
}

impl Default for InMemoryCommandBus {
    fn default() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }
}

impl InMemoryCommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册命令处理器；同一命令只允许一个处理器
    pub fn register<C, H>(&self, handler: Arc<H>) -> Result<(), AppError>
    where
        C: Command,
        H: CommandHandler<C> + 'static,
    {
        let f: CmdHandlerFn = Arc::new(move |boxed_cmd, ctx| {
            let handler = handler.clone();

            Box::pin(async move {
                match boxed_cmd.downcast::<C>() {
                    Ok(cmd) => {
                        let output = handler.handle(ctx, *cmd).await?;
                        Ok(Box::new(output) as BoxAnySend)
                    }
                    Err(e) => Err(AppError::TypeMismatch {
                        expected: C::NAME,
                        found: type_name_of_val(&e),
                    }),
                }
            })
        });

        match self.handlers.entry(TypeId::of::<C>()) {
            Entry::Occupied(_) => Err(AppError::AlreadyRegisteredCommand { command: C::NAME }),
            Entry::Vacant(slot) => {
                slot.insert((C::NAME, f));
                Ok(())
            }
        }
    }

    /// 已注册的命令名列表（只读视图）
    pub fn registered_commands(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|e| e.value().0).collect()
    }
}

#[async_trait]
impl CommandBus for InMemoryCommandBus {
    async fn dispatch<C: Command>(&self, ctx: &AppContext, cmd: C) -> Result<C::Output, AppError> {
        let Some((_name, f)) = self.handlers.get(&TypeId::of::<C>()).map(|h| h.value().clone()) else {
            return Err(AppError::HandlerNotFound(C::NAME));
        };

        debug!(command = C::NAME, "dispatching command");
        let out = (f)(Box::new(cmd), ctx).await?;

        match out.downcast::<C::Output>() {
            Ok(output) => Ok(*output),
            Err(e) => Err(AppError::TypeMismatch {
                expected: type_name::<C::Output>(),
                found: type_name_of_val(&e),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinSet;

    #[derive(Debug, Serialize)]
    struct Deposit {
        amount: u64,
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Balance(u64);

    impl Command for Deposit {
        const NAME: &'static str = "account.deposit";
        type Output = Balance;
    }

    struct DepositHandler {
        balance: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler<Deposit> for DepositHandler {
        async fn handle(&self, _ctx: &AppContext, cmd: Deposit) -> Result<Balance, AppError> {
            let before = self.balance.fetch_add(cmd.amount as usize, Ordering::SeqCst);
            Ok(Balance((before as u64) + cmd.amount))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_and_dispatch_returns_output() {
        let bus = InMemoryCommandBus::new();
        bus.register::<Deposit, _>(Arc::new(DepositHandler {
            balance: AtomicUsize::new(0),
        }))
        .unwrap();

        let ctx = AppContext::default();
        let out = bus.dispatch(&ctx, Deposit { amount: 5 }).await.unwrap();
        assert_eq!(out, Balance(5));
        assert_eq!(bus.registered_commands(), vec!["account.deposit"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn not_found_error_when_unregistered() {
        let bus = InMemoryCommandBus::new();
        let err = bus
            .dispatch(&AppContext::default(), Deposit { amount: 1 })
            .await
            .unwrap_err();
        match err {
            AppError::HandlerNotFound(name) => assert_eq!(name, "account.deposit"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_registration_is_rejected() {
        let bus = InMemoryCommandBus::new();
        let handler = Arc::new(DepositHandler {
            balance: AtomicUsize::new(0),
        });
        bus.register::<Deposit, _>(handler.clone()).unwrap();
        let err = bus.register::<Deposit, _>(handler).unwrap_err();
        assert!(matches!(
            err,
            AppError::AlreadyRegisteredCommand {
                command: "account.deposit"
            }
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_dispatch_is_safe() {
        let bus = Arc::new(InMemoryCommandBus::new());
        bus.register::<Deposit, _>(Arc::new(DepositHandler {
            balance: AtomicUsize::new(0),
        }))
        .unwrap();

        let mut set = JoinSet::new();
        for _ in 0..100 {
            let bus = bus.clone();
            set.spawn(async move {
                bus.dispatch(&AppContext::default(), Deposit { amount: 1 })
                    .await
                    .unwrap()
            });
        }
        let mut results = Vec::new();
        while let Some(res) = set.join_next().await {
            results.push(res.unwrap().0);
        }
        results.sort_unstable();
        assert_eq!(results.len(), 100);
        assert_eq!(results[0], 1);
        assert_eq!(results[99], 100);
    }
}
