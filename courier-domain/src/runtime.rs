//! 周期任务运行时
//!
//! 投递器与清理器都是“固定间隔 + 可取消”的长驻任务，统一由此处驱动，
//! 并通过 `TaskHandle` 进行确定性的关闭与等待。
//!
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 以固定间隔执行 `f`，直到 `token` 被取消。
///
/// 取消只在两次执行之间生效：正在执行的 `f` 会跑完。
pub async fn run_periodic<F, Fut>(token: CancellationToken, interval: Duration, mut f: F)
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => f().await,
        }
    }
}

/// 任务运行句柄：用于优雅关闭与等待任务结束
pub struct TaskHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn new(token: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { token, tasks }
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            let _ = t.await;
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn periodic_runs_until_cancelled() {
        let token = CancellationToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let task = {
            let ticks = ticks.clone();
            tokio::spawn(run_periodic(
                token.clone(),
                Duration::from_millis(10),
                move || {
                    let ticks = ticks.clone();
                    async move {
                        ticks.fetch_add(1, Ordering::SeqCst);
                    }
                },
            ))
        };

        let handle = TaskHandle::new(token, vec![task]);
        tokio::time::sleep(Duration::from_millis(60)).await;
        handle.shutdown();
        handle.join().await;

        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected several ticks, got {seen}");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
