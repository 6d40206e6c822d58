//! Dispatcher - 上限付きワーカースレッドプール
//!
//! # 実装詳細
//! - Mutex で backlog / ワーカー数 / エラー一覧を保護
//! - Condvar で `wait()` を起こす
//! - ワーカーは backlog が空になったら自分で終了する
//!
//! # 実行順序
//! backlog は **末尾から** 取り出します（後から投入したものが先に動く、スタック順）。
//! FIFO ではない点に注意してください。

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use crate::config::DispatcherConfig;
use crate::error::{BoxError, SchedulerError, WorkerError};
use crate::ports::{Executor, Job};

type Work = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;

struct DispatchState {
    backlog: Vec<Work>,
    workers: usize,
    spawned: usize,
    errors: Vec<WorkerError>,
}

struct DispatcherInner {
    config: DispatcherConfig,
    state: Mutex<DispatchState>,
    drained: Condvar,
}

impl DispatcherInner {
    // ワーカー内で panic を捕まえているので poison は実質起きないが、起きても状態は壊れない
    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded worker-thread pool.
///
/// Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(DispatcherInner {
                config,
                state: Mutex::new(DispatchState {
                    backlog: Vec::new(),
                    workers: 0,
                    spawned: 0,
                    errors: Vec::new(),
                }),
                drained: Condvar::new(),
            }),
        })
    }

    pub fn with_thread_limit(thread_limit: usize) -> Result<Self, SchedulerError> {
        Self::new(DispatcherConfig::with_thread_limit(thread_limit))
    }

    pub fn thread_limit(&self) -> usize {
        self.inner.config.thread_limit
    }

    /// Queue fallible work. An `Err` is recorded as `WorkerError::Failed`.
    pub fn submit<F, E>(&self, work: F)
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.enqueue(Box::new(move || work().map_err(Into::into)));
    }

    /// Queue infallible work.
    pub fn execute<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Box::new(move || {
            work();
            Ok(())
        }));
    }

    fn enqueue(&self, work: Work) {
        let mut state = self.inner.lock();
        state.backlog.push(work);

        if state.workers < self.inner.config.thread_limit && state.workers < state.backlog.len() {
            state.workers += 1;
            state.spawned += 1;
            let n = state.spawned;
            drop(state);
            self.spawn_worker(n);
        }
    }

    fn spawn_worker(&self, n: usize) {
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("roost-dispatch-{n}"))
            .spawn(move || worker_loop(inner));

        if let Err(e) = spawned {
            tracing::error!(error = %e, "failed to spawn dispatcher worker");
            let mut state = self.inner.lock();
            state.workers -= 1;
            // 他にワーカーがいなければ backlog は誰にも処理されない
            if state.workers == 0 && !state.backlog.is_empty() {
                state
                    .errors
                    .push(WorkerError::Failed(format!("worker spawn failed: {e}")));
            }
            self.inner.drained.notify_all();
        }
    }

    /// Block until the backlog is drained and every worker has exited.
    ///
    /// Must not be called from inside dispatched work.
    pub fn wait(&self) {
        let mut state = self.inner.lock();
        while !(state.backlog.is_empty() && state.workers == 0) {
            if state.workers == 0 {
                // spawn に失敗して backlog が取り残された
                break;
            }
            state = self
                .inner
                .drained
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn is_empty(&self) -> bool {
        let state = self.inner.lock();
        state.backlog.is_empty() && state.workers == 0
    }

    pub fn backlog_size(&self) -> usize {
        self.inner.lock().backlog.len()
    }

    /// Number of live worker threads.
    pub fn thread_count(&self) -> usize {
        self.inner.lock().workers
    }

    /// Cumulative error list; never cleared.
    pub fn errors(&self) -> Vec<WorkerError> {
        self.inner.lock().errors.clone()
    }

    pub fn has_errors(&self) -> bool {
        !self.inner.lock().errors.is_empty()
    }
}

fn worker_loop(inner: Arc<DispatcherInner>) {
    loop {
        let work = {
            let mut state = inner.lock();
            match state.backlog.pop() {
                Some(work) => work,
                None => {
                    state.workers -= 1;
                    inner.drained.notify_all();
                    return;
                }
            }
        };

        let failure = match catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(WorkerError::Failed(e.to_string())),
            Err(payload) => Some(WorkerError::from_panic(payload)),
        };

        if let Some(err) = failure {
            tracing::warn!(error = %err, "dispatched work failed");
            inner.lock().errors.push(err);
        }

        thread::yield_now();
    }
}

impl Executor for Dispatcher {
    fn dispatch(&self, job: Job) {
        self.execute(job);
    }

    /// The pool has no control thread of its own; a `ThreadedExecutor` pairs
    /// it with one. Standing alone it only guarantees asynchronous execution.
    fn run_on_control_thread(&self, job: Job) {
        self.execute(job);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Dispatcher")
            .field("thread_limit", &self.inner.config.thread_limit)
            .field("backlog", &state.backlog.len())
            .field("workers", &state.workers)
            .field("errors", &state.errors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn routine_dispatching() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default()).unwrap();
        assert_eq!(dispatcher.thread_limit(), 24);

        let checks = Arc::new(Mutex::new(Vec::new()));
        let count = 200;

        for n in 0..count {
            let inner = dispatcher.clone();
            let checks = Arc::clone(&checks);
            dispatcher.execute(move || {
                let x = Arc::new(AtomicUsize::new(0));
                for _ in 0..100 {
                    let x = Arc::clone(&x);
                    inner.execute(move || {
                        x.fetch_add(1, Ordering::SeqCst);
                    });
                }
                checks.lock().unwrap().push(n);
            });
        }

        dispatcher.wait();

        assert_eq!(dispatcher.backlog_size(), 0);
        assert_eq!(dispatcher.thread_count(), 0);
        assert!(dispatcher.is_empty());
        assert!(!dispatcher.has_errors());

        let mut seen = checks.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, (0..count).collect::<Vec<_>>());
    }

    #[test]
    fn errors_and_panics_are_recorded_without_killing_the_pool() {
        let dispatcher = Dispatcher::with_thread_limit(2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        dispatcher.submit(|| Err::<(), _>("bad input"));
        dispatcher.execute(|| panic!("worker exploded"));
        for _ in 0..10 {
            let done = Arc::clone(&done);
            dispatcher.execute(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        dispatcher.wait();

        assert_eq!(done.load(Ordering::SeqCst), 10);
        let mut errors = dispatcher.errors();
        errors.sort_by_key(|e| e.to_string());
        assert_eq!(
            errors,
            vec![
                WorkerError::Failed("bad input".to_string()),
                WorkerError::Panicked("worker exploded".to_string()),
            ]
        );

        // エラーは自動で消えない
        dispatcher.execute(|| {});
        dispatcher.wait();
        assert!(dispatcher.has_errors());
    }

    #[test]
    fn concurrent_workers_never_exceed_limit() {
        let limit = 3;
        let dispatcher = Dispatcher::with_thread_limit(limit).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..30 {
            let (active, peak, ran) = (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&ran));
            dispatcher.execute(move || {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(2));
                active.fetch_sub(1, Ordering::SeqCst);
                ran.fetch_add(1, Ordering::SeqCst);
            });
            assert!(dispatcher.thread_count() <= limit);
        }

        dispatcher.wait();

        assert_eq!(ran.load(Ordering::SeqCst), 30);
        assert!(peak.load(Ordering::SeqCst) <= limit);
    }

    #[test]
    fn single_worker_drains_most_recent_first() {
        let dispatcher = Dispatcher::with_thread_limit(1).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();

        // 最初のワークでワーカーを塞いでいる間に残りを積む
        dispatcher.execute(move || {
            started_tx.send(()).unwrap();
            let _ = gate_rx.recv();
        });
        started_rx.recv().unwrap();
        for n in 0..4 {
            let order = Arc::clone(&order);
            dispatcher.execute(move || order.lock().unwrap().push(n));
        }
        gate_tx.send(()).unwrap();

        dispatcher.wait();

        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1, 0]);
    }

    #[test]
    fn zero_thread_limit_is_rejected() {
        assert!(matches!(
            Dispatcher::with_thread_limit(0),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }
}
