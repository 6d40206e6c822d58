//! Executor port - 非同期実行の抽象化
//!
//! コアが外部（リアクター・スレッドプールなど）に求めるのは次の 2 つだけです。
//! - `dispatch`: どこかのスレッドで非同期に実行する
//! - `run_on_control_thread`: 単一の制御スレッド上で直列に実行する
//!
//! # 実装
//! - `impls::ThreadedExecutor`: Dispatcher + 専用制御スレッド
//! - `impls::TokioExecutor`: tokio runtime
//! - `impls::ManualExecutor`: 呼び出し側が回す（テスト・自前のイベントループ用）

use std::sync::Arc;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync {
    /// Schedule `job` to run asynchronously, on any thread.
    fn dispatch(&self, job: Job);

    /// Schedule `job` on the single serialized control thread.
    fn run_on_control_thread(&self, job: Job);
}

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn dispatch(&self, job: Job) {
        (**self).dispatch(job)
    }

    fn run_on_control_thread(&self, job: Job) {
        (**self).run_on_control_thread(job)
    }
}

/// Shared executor handle, as stored by tasks and processors.
pub type SharedExecutor = Arc<dyn Executor>;
