//! TokioExecutor - tokio runtime 上の Executor
//!
//! # 学習ポイント
//! - 同期クロージャは `spawn_blocking` で blocking pool に逃がす
//! - 制御スレッドは unbounded channel を 1 つの task が順に読むことで直列化

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::run_guarded;
use crate::ports::{Executor, Job};

pub struct TokioExecutor {
    handle: Handle,
    control: mpsc::UnboundedSender<Job>,
}

impl TokioExecutor {
    /// Must be called with a runtime reachable through `handle`; spawns the
    /// control task immediately.
    pub fn new(handle: Handle) -> Self {
        let (control, mut rx) = mpsc::unbounded_channel::<Job>();

        handle.spawn(async move {
            while let Some(job) = rx.recv().await {
                run_guarded(job, "tokio control task");
            }
        });

        Self { handle, control }
    }

    /// Executor on the runtime of the calling context.
    ///
    /// Panics outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Executor for TokioExecutor {
    fn dispatch(&self, job: Job) {
        // JoinHandle は捨てる（完了は Task 側の状態で観測する）
        let _ = self
            .handle
            .spawn_blocking(move || run_guarded(job, "tokio blocking pool"));
    }

    fn run_on_control_thread(&self, job: Job) {
        if let Err(mpsc::error::SendError(job)) = self.control.send(job) {
            tracing::error!("tokio control task is gone; running job on the blocking pool");
            self.dispatch(job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatch_and_control_both_run() {
        let executor = TokioExecutor::current();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let tx2 = tx.clone();
        executor.dispatch(Box::new(move || tx.send("dispatched").unwrap()));
        executor.run_on_control_thread(Box::new(move || tx2.send("control").unwrap()));

        let mut got = Vec::new();
        for _ in 0..2 {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            got.push(msg);
        }
        got.sort();

        assert_eq!(got, vec!["control", "dispatched"]);
    }

    #[tokio::test]
    async fn control_jobs_keep_submission_order() {
        let executor = TokioExecutor::current();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for n in 0..20 {
            let tx = tx.clone();
            executor.run_on_control_thread(Box::new(move || tx.send(n).unwrap()));
        }

        let mut got = Vec::new();
        for _ in 0..20 {
            got.push(rx.recv().await.unwrap());
        }
        assert_eq!(got, (0..20).collect::<Vec<_>>());
    }
}
