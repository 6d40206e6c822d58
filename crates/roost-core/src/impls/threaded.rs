//! ThreadedExecutor - Dispatcher と制御スレッドの組み合わせ
//!
//! - `dispatch` は Dispatcher（上限付きスレッドプール）へ
//! - `run_on_control_thread` は専用スレッド 1 本へ（投入順に直列実行）

use std::sync::Mutex;
use std::sync::mpsc;
use std::thread;

use super::run_guarded;
use crate::config::DispatcherConfig;
use crate::dispatcher::Dispatcher;
use crate::error::SchedulerError;
use crate::ports::{Executor, Job};

pub struct ThreadedExecutor {
    dispatcher: Dispatcher,
    control: Mutex<mpsc::Sender<Job>>,
}

impl ThreadedExecutor {
    pub fn new(config: DispatcherConfig) -> Result<Self, SchedulerError> {
        let dispatcher = Dispatcher::new(config)?;
        let (tx, rx) = mpsc::channel::<Job>();

        // 送信側がすべて drop されると recv が Err になり、スレッドは終了する
        thread::Builder::new()
            .name("roost-control".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    run_guarded(job, "control thread");
                }
            })
            .map_err(|e| SchedulerError::InvalidConfig(format!("spawn control thread: {e}")))?;

        Ok(Self {
            dispatcher,
            control: Mutex::new(tx),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Block until the pool has drained (see `Dispatcher::wait`).
    pub fn wait(&self) {
        self.dispatcher.wait();
    }
}

impl Executor for ThreadedExecutor {
    fn dispatch(&self, job: Job) {
        self.dispatcher.execute(job);
    }

    fn run_on_control_thread(&self, job: Job) {
        let tx = self
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(mpsc::SendError(job)) = tx.send(job) {
            // 制御スレッドが落ちている場合はプールで実行して取りこぼさない
            tracing::error!("control thread is gone; running job on the pool");
            self.dispatcher.execute(job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn control_thread_runs_jobs_in_submission_order() {
        let executor = ThreadedExecutor::new(DispatcherConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();

        for n in 0..50 {
            let tx = tx.clone();
            executor.run_on_control_thread(Box::new(move || {
                tx.send((n, thread::current().name().map(str::to_string)))
                    .unwrap();
            }));
        }

        let received: Vec<_> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();

        assert_eq!(
            received.iter().map(|(n, _)| *n).collect::<Vec<_>>(),
            (0..50).collect::<Vec<_>>()
        );
        assert!(
            received
                .iter()
                .all(|(_, name)| name.as_deref() == Some("roost-control"))
        );
    }

    #[test]
    fn dispatch_goes_through_the_pool() {
        let executor = ThreadedExecutor::new(DispatcherConfig::with_thread_limit(4)).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let ran = Arc::clone(&ran);
            executor.dispatch(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        executor.wait();

        assert_eq!(ran.load(Ordering::SeqCst), 20);
        assert!(executor.dispatcher().is_empty());
    }

    #[test]
    fn panicking_control_job_does_not_stop_the_thread() {
        let executor = ThreadedExecutor::new(DispatcherConfig::default()).unwrap();
        let (tx, rx) = mpsc::channel();

        executor.run_on_control_thread(Box::new(|| panic!("control job failed")));
        executor.run_on_control_thread(Box::new(move || tx.send(()).unwrap()));

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }
}
