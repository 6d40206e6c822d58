//! Task - 非同期に状態遷移する有限状態機械
//!
//! # 状態遷移
//! ```text
//! run() ─► initialized ─► (custom states...) ─► finished | failed
//! ```
//! - 各ステップは同期的に実行され、次の状態は `transition_to_state` で
//!   Executor に dispatch される（再帰しないのでスタックが伸びない）
//! - handler の Err / panic は捕捉され、`failed` へ一度だけ遷移する
//! - 終端状態のあとは何も実行されない
//!
//! # 所有関係
//! `Task` は `Arc` のハンドルなので clone は安価です。Queue と Processor の間で
//! 受け渡され、Processor とは ID だけで関連付けます（循環参照を作らない）。

mod kind;

pub use kind::{BasicTask, StateTable, TaskKind};

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::domain::{ProcessorId, State, TaskId};
use crate::error::{BoxError, SchedulerError, TaskExecutionError, panic_message};
use crate::ports::{Clock, IdGenerator, SharedExecutor, SystemClock, UlidGenerator};

/// Process-wide creation counter; breaks ties between equal ranks.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Queue sort key. Lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority {
    rank: i64,
    sequence: u64,
}

impl Priority {
    pub fn rank(&self) -> i64 {
        self.rank
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Called with every state a task enters.
pub type StepCallback = Arc<dyn Fn(&Task, &State) + Send + Sync>;

type CompletionHook = Box<dyn FnOnce(&Task) + Send>;

/// Snapshot published to `Task::subscribe` receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub state: State,
    /// The terminal step (hooks included) has run.
    pub completed: bool,
}

struct RunSlot {
    state: State,
    exception: Option<TaskExecutionError>,
    started_at: Option<DateTime<Utc>>,
    executor: Option<SharedExecutor>,
    callback: Option<StepCallback>,
    processor: Option<ProcessorId>,
    /// 終端ステップに入った（以降のステップは無視）
    completed: bool,
    /// 完了フックまで走り終えた
    settled: bool,
    on_complete: Vec<CompletionHook>,
}

struct TaskInner {
    id: TaskId,
    kind: Box<dyn TaskKind>,
    context: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    priority: Priority,
    clock: Arc<dyn Clock>,
    slot: Mutex<RunSlot>,
    settled: Condvar,
    progress: watch::Sender<Progress>,
}

/// One unit of work: a state machine driven through an executor.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

pub struct TaskBuilder {
    kind: Box<dyn TaskKind>,
    context: Option<serde_json::Value>,
    executor: Option<SharedExecutor>,
    rank: Option<i64>,
    clock: Arc<dyn Clock>,
}

impl TaskBuilder {
    /// Opaque user payload.
    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn executor(mut self, executor: SharedExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Overrides both the creation time and `TaskKind::priority`.
    pub fn priority(mut self, rank: i64) -> Self {
        self.rank = Some(rank);
        self
    }

    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn build(self) -> Task {
        let created_at = self.clock.now();
        let id = UlidGenerator::new(Arc::clone(&self.clock)).generate_task_id();
        let rank = self
            .rank
            .or_else(|| self.kind.priority())
            .unwrap_or_else(|| created_at.timestamp_micros());
        let priority = Priority {
            rank,
            sequence: SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed),
        };

        let initial = self.kind.initial_state();
        let (progress, _) = watch::channel(Progress {
            state: initial.clone(),
            completed: false,
        });

        let task = Task {
            inner: Arc::new(TaskInner {
                id,
                kind: self.kind,
                context: self.context,
                created_at,
                priority,
                clock: self.clock,
                slot: Mutex::new(RunSlot {
                    state: initial,
                    exception: None,
                    started_at: None,
                    executor: self.executor,
                    callback: None,
                    processor: None,
                    completed: false,
                    settled: false,
                    on_complete: Vec::new(),
                }),
                settled: Condvar::new(),
                progress,
            }),
        };

        task.guarded("after_initialized", || task.inner.kind.after_initialized(&task));
        task
    }
}

impl Task {
    pub fn builder(kind: impl TaskKind) -> TaskBuilder {
        TaskBuilder {
            kind: Box::new(kind),
            context: None,
            executor: None,
            rank: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn new(kind: impl TaskKind) -> Self {
        Self::builder(kind).build()
    }

    /// A task that goes `initialized -> finished`.
    pub fn basic() -> Self {
        Self::new(BasicTask)
    }

    fn lock(&self) -> MutexGuard<'_, RunSlot> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn kind(&self) -> &dyn TaskKind {
        self.inner.kind.as_ref()
    }

    pub fn context(&self) -> Option<&serde_json::Value> {
        self.inner.context.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_at
    }

    pub fn priority(&self) -> Priority {
        self.inner.priority
    }

    pub fn state(&self) -> State {
        self.lock().state.clone()
    }

    /// Last captured failure, if any.
    pub fn exception(&self) -> Option<TaskExecutionError> {
        self.lock().exception.clone()
    }

    pub fn has_exception(&self) -> bool {
        self.lock().exception.is_some()
    }

    pub fn has_executor(&self) -> bool {
        self.lock().executor.is_some()
    }

    /// Processor currently running this task.
    pub fn processor(&self) -> Option<ProcessorId> {
        self.lock().processor
    }

    pub(crate) fn assign_processor(&self, processor: Option<ProcessorId>) {
        self.lock().processor = processor;
    }

    pub fn is_finished(&self) -> bool {
        self.state() == State::FINISHED
    }

    pub fn is_failed(&self) -> bool {
        self.state() == State::FAILED
    }

    /// `failed` is always terminal, whatever the kind declares.
    pub fn is_terminal_state(&self, state: &State) -> bool {
        *state == State::FAILED || self.inner.kind.terminal_states().contains(state)
    }

    /// Is the current state terminal?
    pub fn is_terminal(&self) -> bool {
        let state = self.state();
        self.is_terminal_state(&state)
    }

    /// Has the terminal step, hooks included, finished running?
    pub fn is_completed(&self) -> bool {
        self.lock().settled
    }

    /// Start the state machine.
    ///
    /// Binds `executor` if given, installs `callback` if given, enters the
    /// initial state and runs that first step on the calling thread. The rest
    /// proceeds through the executor. Handler failures never escape; the only
    /// error is having no executor at all.
    ///
    /// A task that has already completed is left untouched.
    pub fn run(
        &self,
        executor: Option<SharedExecutor>,
        callback: Option<StepCallback>,
    ) -> Result<(), SchedulerError> {
        let initial = {
            let mut slot = self.lock();
            if slot.completed {
                tracing::debug!(task = %self.id(), state = %slot.state, "task already completed; run ignored");
                return Ok(());
            }
            if let Some(executor) = executor {
                slot.executor = Some(executor);
            }
            if slot.executor.is_none() {
                return Err(SchedulerError::NoExecutor(self.id()));
            }
            if callback.is_some() {
                slot.callback = callback;
            }
            slot.started_at = Some(self.inner.clock.now());
            let initial = self.inner.kind.initial_state();
            slot.state = initial.clone();
            initial
        };

        tracing::debug!(task = %self.id(), state = %initial, "task started");
        self.run_state(initial);
        Ok(())
    }

    /// Record `state` and schedule its step on the executor.
    ///
    /// Call at most once per step; each call schedules one more step.
    pub fn transition_to_state(&self, state: impl Into<State>) -> Result<(), SchedulerError> {
        let state = state.into();
        let executor = {
            let mut slot = self.lock();
            if slot.completed {
                tracing::debug!(task = %self.id(), state = %state, "task already completed; transition ignored");
                return Ok(());
            }
            let executor = slot
                .executor
                .clone()
                .ok_or(SchedulerError::NoExecutor(self.id()))?;
            slot.state = state.clone();
            executor
        };

        let task = self.clone();
        executor.dispatch(Box::new(move || task.run_state(state)));
        Ok(())
    }

    /// Run side work on the task's executor.
    pub fn dispatch<F>(&self, work: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let executor = self
            .lock()
            .executor
            .clone()
            .ok_or(SchedulerError::NoExecutor(self.id()))?;
        executor.dispatch(Box::new(work));
        Ok(())
    }

    /// Run `hook` once the terminal step has run; immediately if it already has.
    pub fn on_complete<F>(&self, hook: F)
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        {
            let mut slot = self.lock();
            if !slot.completed {
                slot.on_complete.push(Box::new(hook));
                return;
            }
        }
        self.guarded("on_complete", || hook(self));
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.inner.progress.subscribe()
    }

    /// Resolve once the task has completed; returns the final state.
    pub async fn wait(&self) -> State {
        let mut rx = self.subscribe();
        match rx.wait_for(|progress| progress.completed).await {
            Ok(progress) => progress.state.clone(),
            // 送信側は self が保持しているので閉じることはない
            Err(_) => self.state(),
        }
    }

    /// Blocking variant of [`Task::wait`]. Returns whether the task completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let slot = self.lock();
        let (slot, _) = self
            .inner
            .settled
            .wait_timeout_while(slot, timeout, |slot| !slot.settled)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.settled
    }

    fn run_state(&self, state: State) {
        let terminal = self.is_terminal_state(&state);
        let callback = {
            let mut slot = self.lock();
            if slot.completed {
                tracing::debug!(task = %self.id(), state = %state, "ignoring step after completion");
                return;
            }
            slot.state = state.clone();
            if terminal {
                slot.completed = true;
            }
            slot.callback.clone()
        };
        self.publish(&state, false);
        tracing::debug!(task = %self.id(), state = %state, terminal, "running state");

        let kind = self.inner.kind.as_ref();
        let outcome = catch_unwind(AssertUnwindSafe(|| -> Result<(), BoxError> {
            kind.before_state(self, &state)?;
            if let Some(callback) = &callback {
                callback(self, &state);
            }
            if !terminal {
                kind.handle_state(self, &state)?;
            }
            Ok(())
        }));

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(TaskExecutionError::from_error(state.clone(), err)),
            Err(payload) => Some(TaskExecutionError::from_panic(state.clone(), payload)),
        };
        if let Some(failure) = failure {
            self.fail(failure, terminal);
        }

        self.guarded("after_state", || kind.after_state(self, &state));

        if terminal {
            self.guarded("after_finished", || kind.after_finished(self));
            self.settle();
        }
    }

    fn fail(&self, failure: TaskExecutionError, terminal_step: bool) {
        tracing::warn!(task = %self.id(), error = %failure, "task state failed");

        let already_failed = {
            let mut slot = self.lock();
            slot.exception = Some(failure.clone());
            slot.state == State::FAILED
        };

        let kind = self.inner.kind.as_ref();
        match catch_unwind(AssertUnwindSafe(|| kind.handle_exception(self, &failure))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(task = %self.id(), error = %e, "handle_exception failed; ignored")
            }
            Err(_) => tracing::debug!(task = %self.id(), "handle_exception panicked; ignored"),
        }

        if !already_failed {
            if terminal_step {
                // 終端ステップ内の失敗: 追加のステップは走らせずにラベルだけ変える
                self.lock().state = State::FAILED;
            } else if let Err(e) = self.transition_to_state(State::FAILED) {
                tracing::error!(task = %self.id(), error = %e, "cannot schedule failed state");
            }
        }

        self.guarded("after_failed", || kind.after_failed(self));
    }

    fn settle(&self) {
        let hooks = std::mem::take(&mut self.lock().on_complete);
        for hook in hooks {
            self.guarded("on_complete", || hook(self));
        }

        let state = {
            let mut slot = self.lock();
            slot.settled = true;
            slot.state.clone()
        };
        self.inner.settled.notify_all();
        self.publish(&state, true);
        tracing::debug!(task = %self.id(), state = %state, "task completed");
    }

    fn publish(&self, state: &State, completed: bool) {
        self.inner.progress.send_replace(Progress {
            state: state.clone(),
            completed,
        });
    }

    fn guarded(&self, hook: &'static str, f: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            tracing::warn!(
                task = %self.id(),
                hook,
                panic = %panic_message(payload.as_ref()),
                "task hook panicked"
            );
        }
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl PartialOrd for Task {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Ranks tasks by priority.
impl Ord for Task {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner
            .priority
            .cmp(&other.inner.priority)
            .then_with(|| self.inner.id.cmp(&other.inner.id))
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("priority", &self.inner.priority)
            .field("context", &self.inner.context)
            .finish()
    }
}
