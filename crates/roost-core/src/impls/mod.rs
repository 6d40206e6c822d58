//! Impls - Executor の実装
//!
//! # 含まれる実装
//! - **ThreadedExecutor**: Dispatcher（スレッドプール）+ 専用制御スレッド
//! - **TokioExecutor**: tokio runtime の blocking pool + 制御用 task
//! - **ManualExecutor**: 呼び出し側が `run_pending()` で回す（テスト・自前ループ用）

pub mod manual;
pub mod threaded;
pub mod tokio_executor;

pub use self::manual::ManualExecutor;
pub use self::threaded::ThreadedExecutor;
pub use self::tokio_executor::TokioExecutor;

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::panic_message;
use crate::ports::Job;

/// Run a job, logging instead of unwinding if it panics.
pub(crate) fn run_guarded(job: Job, context: &'static str) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        tracing::warn!(
            context,
            panic = %panic_message(payload.as_ref()),
            "job panicked"
        );
    }
}
