//! Queue - 優先度順・複数フィルタ付きのタスク置き場
//!
//! # 学習ポイント
//! - push されたタスクは、backlog に入る前に observer（= 待機中の Processor）へ
//!   「先に取る権利」を与える。誰も claim しなければ backlog へ
//! - observer の中から push してもよい（再帰せず pending に積み、外側の push が捌く）
//! - 別スレッドからの push は、進行中の push が捌き終わるのを待ってから自分で捌く。
//!   push が返った時点でそのタスクは claim 済みか backlog にある
//! - observer はロックを何も持たずに呼ぶので、
//!   observer から claim / observe を呼んでもデッドロックしない
//! - backlog に入れたあとで attach 済み Processor を poll する。
//!   observer で断った直後に手が空いた Processor も取りこぼさない
//!
//! # ロック
//! - `backlog`: タスク列・フィルタ・キャッシュ・claimable 集合
//! - `observers`: フィルタごとの observer 一覧と attach 済み Processor
//! - `inflow`: push の pending 列と、捌いているスレッド

mod backlog;
mod selector;

pub use selector::{DEFAULT_FILTER, Predicate, Selector};

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use self::backlog::Backlog;
use crate::domain::{ObserverId, ProcessorId};
use crate::error::{SchedulerError, panic_message};
use crate::processor::Processor;
use crate::sorted_array::{Comparator, SortedArray};
use crate::task::Task;

/// Callback run for each pushed task that matches its filter.
pub type ObserverFn = Arc<dyn Fn(&Task) + Send + Sync>;

/// Asks an attached processor to take waiting work.
pub(crate) type PollFn = Arc<dyn Fn() + Send + Sync>;

/// Explicit construction-time setup: ordering and named filters.
#[derive(Clone)]
pub struct QueueConfig {
    /// `None` is rejected with `InvalidComparator`.
    pub comparator: Option<Comparator<Task>>,
    pub filters: Vec<(String, Predicate)>,
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comparator(mut self, cmp: Comparator<Task>) -> Self {
        self.comparator = Some(cmp);
        self
    }

    pub fn filter<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        self.filters.push((name.into(), Arc::new(predicate)));
        self
    }
}

impl Default for QueueConfig {
    /// Priority ascending, no extra filters.
    fn default() -> Self {
        Self {
            comparator: Some(Comparator::natural()),
            filters: Vec::new(),
        }
    }
}

struct Attached {
    observer: ObserverId,
    poll: PollFn,
}

#[derive(Default)]
struct Observers {
    by_filter: HashMap<String, Vec<(ObserverId, ObserverFn)>>,
    processors: HashMap<ProcessorId, Attached>,
}

impl Observers {
    fn remove(&mut self, id: ObserverId) -> bool {
        let mut removed = false;
        for list in self.by_filter.values_mut() {
            let before = list.len();
            list.retain(|(observer, _)| *observer != id);
            removed |= list.len() != before;
        }
        removed
    }
}

#[derive(Default)]
struct Inflow {
    drainer: Option<ThreadId>,
    pending: VecDeque<Task>,
}

struct QueueInner {
    backlog: Mutex<Backlog>,
    observers: Mutex<Observers>,
    inflow: Mutex<Inflow>,
    drained: Condvar,
}

/// Releases the inflow on drop, waking pushes from other threads.
struct Drain<'a>(&'a QueueInner);

impl Drop for Drain<'_> {
    fn drop(&mut self) {
        lock(&self.0.inflow).drainer = None;
        self.0.drained.notify_all();
    }
}

/// Thread-safe priority queue of tasks. Cloning yields another handle to the
/// same queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Queue {
    /// Empty queue ordered by task priority.
    pub fn new() -> Self {
        let accept_all: Predicate = Arc::new(|_: &Task| true);
        Self::from_parts(SortedArray::new(), accept_all)
    }

    pub fn with_config(config: QueueConfig) -> Result<Self, SchedulerError> {
        let tasks = SortedArray::try_new(config.comparator)?;
        let queue = Self::from_parts(tasks, Arc::new(|_: &Task| true));
        for (name, predicate) in config.filters {
            queue.define_filter_arc(name, predicate)?;
        }
        Ok(queue)
    }

    fn from_parts(tasks: SortedArray<Task>, accept_all: Predicate) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                backlog: Mutex::new(Backlog::new(tasks, accept_all)),
                observers: Mutex::new(Observers::default()),
                inflow: Mutex::new(Inflow::default()),
                drained: Condvar::new(),
            }),
        }
    }

    fn backlog(&self) -> MutexGuard<'_, Backlog> {
        lock(&self.inner.backlog)
    }

    fn observers(&self) -> MutexGuard<'_, Observers> {
        lock(&self.inner.observers)
    }

    /// Do both handles refer to the same queue?
    pub fn same_queue(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Replace the ordering. The backlog is re-sorted and every cache dropped.
    pub fn set_comparator(&self, cmp: Comparator<Task>) {
        self.backlog().set_comparator(cmp);
    }

    /// Register or replace a named filter and compute its next task right away.
    pub fn define_filter<F>(&self, name: impl Into<String>, predicate: F) -> Result<(), SchedulerError>
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        self.define_filter_arc(name.into(), Arc::new(predicate))
    }

    fn define_filter_arc(&self, name: String, predicate: Predicate) -> Result<(), SchedulerError> {
        if name == DEFAULT_FILTER {
            return Err(SchedulerError::ReservedFilter(name));
        }
        self.backlog().define_filter(name, predicate);
        Ok(())
    }

    pub fn filters(&self) -> Vec<String> {
        self.backlog().filter_names()
    }

    /// Register `callback` for tasks pushed through filter `filter`.
    ///
    /// Returns the observer's id and the task currently next for that filter,
    /// so a new observer can pick up work already waiting.
    pub fn observe<F>(&self, filter: impl Into<String>, callback: F) -> (ObserverId, Option<Task>)
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        let filter = filter.into();
        let id = ObserverId::generate();
        self.observers()
            .by_filter
            .entry(filter.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        (id, self.peek(filter))
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers().remove(id)
    }

    /// Bind `processor` to this queue (see `Processor::set_queue`).
    pub fn add_processor(&self, processor: &Processor) {
        processor.set_queue(self.clone());
    }

    /// Unbind `processor` if it is bound here.
    pub fn remove_processor(&self, processor: &Processor) -> bool {
        if self.has_processor(processor.id()) {
            processor.unbind();
            true
        } else {
            false
        }
    }

    pub fn processors(&self) -> Vec<ProcessorId> {
        self.observers().processors.keys().copied().collect()
    }

    pub fn has_processor(&self, id: ProcessorId) -> bool {
        self.observers().processors.contains_key(&id)
    }

    /// Register a processor's claim callback on the default filter, and the
    /// hook used to wake it when a task lands in the backlog.
    pub(crate) fn attach_processor(&self, processor: ProcessorId, callback: ObserverFn, poll: PollFn) {
        let id = ObserverId::generate();
        let mut observers = self.observers();
        let attached = Attached { observer: id, poll };
        if let Some(previous) = observers.processors.insert(processor, attached) {
            observers.remove(previous.observer);
        }
        observers
            .by_filter
            .entry(DEFAULT_FILTER.to_string())
            .or_default()
            .push((id, callback));
    }

    pub(crate) fn detach_processor(&self, processor: ProcessorId) -> bool {
        let mut observers = self.observers();
        match observers.processors.remove(&processor) {
            Some(attached) => observers.remove(attached.observer),
            None => false,
        }
    }

    /// Insert `task`, offering it to matching observers first.
    ///
    /// A push made from inside an observer callback is queued and handled by
    /// the outer push before it returns. A push from another thread waits for
    /// the active one to finish, so on return the task has been claimed or is
    /// in the backlog.
    pub fn push(&self, task: Task) -> Task {
        let current = thread::current().id();
        {
            let mut inflow = lock(&self.inner.inflow);
            loop {
                match inflow.drainer {
                    Some(drainer) if drainer == current => {
                        inflow.pending.push_back(task.clone());
                        tracing::debug!(task = %task.id(), "push deferred to the active insertion");
                        return task;
                    }
                    Some(_) => {
                        inflow = self
                            .inner
                            .drained
                            .wait(inflow)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                    }
                    None => break,
                }
            }
            inflow.drainer = Some(current);
            inflow.pending.push_back(task.clone());
        }

        let _drain = Drain(&self.inner);
        while let Some(next) = self.next_pending() {
            self.insert(next);
        }
        task
    }

    fn next_pending(&self) -> Option<Task> {
        lock(&self.inner.inflow).pending.pop_front()
    }

    fn insert(&self, task: Task) {
        let filters = {
            let mut backlog = self.backlog();
            if backlog.is_tracked(&task) {
                tracing::debug!(task = %task.id(), "task already queued; push ignored");
                return;
            }
            backlog.mark_claimable(&task);
            backlog.matching_filters(&task)
        };

        let callbacks: Vec<ObserverFn> = {
            let observers = self.observers();
            filters
                .iter()
                .filter_map(|name| observers.by_filter.get(name))
                .flatten()
                .map(|(_, callback)| Arc::clone(callback))
                .collect()
        };

        for callback in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(&task))) {
                tracing::warn!(
                    task = %task.id(),
                    panic = %panic_message(payload.as_ref()),
                    "queue observer panicked"
                );
            }
            if !self.backlog().is_claimable(&task) {
                tracing::debug!(task = %task.id(), "task claimed on push");
                return;
            }
        }

        let queued = {
            let mut backlog = self.backlog();
            let queued = backlog.take_claimable(&task);
            if queued {
                tracing::debug!(task = %task.id(), "task queued");
                backlog.insert(task);
            }
            queued
        };
        if queued {
            self.poll_processors();
        }
    }

    /// 断ったあとで空いた Processor に backlog を見直させる
    fn poll_processors(&self) {
        let polls: Vec<PollFn> = self
            .observers()
            .processors
            .values()
            .map(|attached| Arc::clone(&attached.poll))
            .collect();
        for poll in polls {
            poll();
        }
    }

    /// Next task for `selector`, left in place.
    pub fn peek(&self, selector: impl Into<Selector>) -> Option<Task> {
        self.backlog().peek(&selector.into())
    }

    /// Remove and return the next task for `selector`.
    pub fn pop(&self, selector: impl Into<Selector>) -> Option<Task> {
        let mut backlog = self.backlog();
        let index = backlog.position(&selector.into())?;
        Some(backlog.remove(index))
    }

    /// Remove and return every task matching `selector`, in queue order.
    pub fn pull(&self, selector: impl Into<Selector>) -> Vec<Task> {
        self.backlog().pull(&selector.into())
    }

    /// Take custody of `task`: either pre-empt its insertion or remove it
    /// from the backlog.
    pub fn claim(&self, task: &Task) -> Result<Task, SchedulerError> {
        let mut backlog = self.backlog();
        if backlog.take_claimable(task) {
            return Ok(task.clone());
        }
        match backlog.tasks.index_of(task) {
            Some(index) => Ok(backlog.remove(index)),
            None => Err(SchedulerError::TaskNotQueued(task.id())),
        }
    }

    /// Is `task` in the backlog or being inserted?
    pub fn contains(&self, task: &Task) -> bool {
        self.backlog().is_tracked(task)
    }

    pub fn is_empty(&self, selector: impl Into<Selector>) -> bool {
        self.peek(selector).is_none()
    }

    pub fn len(&self, selector: impl Into<Selector>) -> usize {
        self.backlog().len(&selector.into())
    }

    /// Snapshot of the backlog in order.
    pub fn to_vec(&self) -> Vec<Task> {
        self.backlog().tasks.to_vec()
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backlog = self.backlog();
        f.debug_struct("Queue")
            .field("len", &backlog.tasks.len())
            .field("filters", &backlog.filter_names())
            .finish()
    }
}
