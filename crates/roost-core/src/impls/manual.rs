//! ManualExecutor - 呼び出し側が回す Executor
//!
//! ジョブは溜めるだけで、`run_pending()` / `run_one()` を呼んだスレッドで実行されます。
//! 自前のイベントループに組み込む場合や、決定的なテストに使います。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use super::run_guarded;
use crate::ports::{Executor, Job};

#[derive(Clone, Default)]
pub struct ManualExecutor {
    jobs: Arc<Mutex<VecDeque<Job>>>,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Job>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run the oldest pending job. Returns false when nothing was pending.
    pub fn run_one(&self) -> bool {
        // 実行中にジョブが追加されてもよいように、ロックは取り出しの間だけ
        let job = self.lock().pop_front();
        match job {
            Some(job) => {
                run_guarded(job, "manual executor");
                true
            }
            None => false,
        }
    }

    /// Run jobs (including ones they enqueue) until none are left.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }
}

impl Executor for ManualExecutor {
    fn dispatch(&self, job: Job) {
        self.lock().push_back(job);
    }

    fn run_on_control_thread(&self, job: Job) {
        self.lock().push_back(job);
    }
}
