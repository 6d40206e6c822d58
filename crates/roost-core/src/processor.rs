//! Processor - Queue に bind して 1 度に 1 タスクだけ実行するワーカー
//!
//! # 学習ポイント
//! - 空いている Processor は Queue の observer として push を先取りする
//! - タスク完了の continuation で、次のタスクを Queue から直接 pop する
//! - observer で断ったタスクが backlog に入ると、Queue から poll される
//! - Queue からは `Weak` 経由でしか参照されない（Processor ⇄ Queue の循環を作らない）
//!
//! # ロック順
//! 常に Processor → Queue。タスクの実行（最初のステップ）はロック外で行う。

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::domain::ProcessorId;
use crate::ports::{IdGenerator, SharedExecutor, SystemClock, UlidGenerator};
use crate::queue::{ObserverFn, PollFn, Predicate, Queue, Selector};
use crate::task::{StepCallback, Task};

struct Slot {
    queue: Option<Queue>,
    task: Option<Task>,
    paused: bool,
}

struct ProcessorInner {
    id: ProcessorId,
    filter: Option<Predicate>,
    context: Option<serde_json::Value>,
    executor: SharedExecutor,
    callback: Option<StepCallback>,
    slot: Mutex<Slot>,
}

impl Drop for ProcessorInner {
    fn drop(&mut self) {
        let slot = self
            .slot
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(queue) = slot.queue.take() {
            queue.detach_processor(self.id);
        }
    }
}

/// Worker bound to one queue. Cloning yields another handle to the same
/// processor.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

pub struct ProcessorBuilder {
    executor: SharedExecutor,
    filter: Option<Predicate>,
    context: Option<serde_json::Value>,
    callback: Option<StepCallback>,
    paused: bool,
}

impl ProcessorBuilder {
    /// Only tasks passing `filter` are taken.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Task) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Step callback installed on every task this processor runs.
    pub fn callback(mut self, callback: StepCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Start paused; nothing is taken until `resume`.
    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    /// Build without binding to a queue.
    pub fn build(self) -> Processor {
        Processor {
            inner: Arc::new(ProcessorInner {
                id: UlidGenerator::new(SystemClock).generate_processor_id(),
                filter: self.filter,
                context: self.context,
                executor: self.executor,
                callback: self.callback,
                slot: Mutex::new(Slot {
                    queue: None,
                    task: None,
                    paused: self.paused,
                }),
            }),
        }
    }

    /// Build and bind to `queue`, picking up waiting work immediately.
    pub fn bind(self, queue: Queue) -> Processor {
        let processor = self.build();
        processor.set_queue(queue);
        processor
    }
}

impl Processor {
    pub fn builder(executor: SharedExecutor) -> ProcessorBuilder {
        ProcessorBuilder {
            executor,
            filter: None,
            context: None,
            callback: None,
            paused: false,
        }
    }

    pub fn new(queue: Queue, executor: SharedExecutor) -> Self {
        Self::builder(executor).bind(queue)
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn downgrade(&self) -> Weak<ProcessorInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<ProcessorInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Processor { inner })
    }

    pub fn id(&self) -> ProcessorId {
        self.inner.id
    }

    pub fn context(&self) -> Option<&serde_json::Value> {
        self.inner.context.as_ref()
    }

    pub fn queue(&self) -> Option<Queue> {
        self.lock().queue.clone()
    }

    /// Would this processor take `task`? No side effects.
    pub fn accept(&self, task: &Task) -> bool {
        self.inner.filter.as_ref().is_none_or(|filter| filter(task))
    }

    pub fn has_task(&self) -> bool {
        self.lock().task.is_some()
    }

    /// The task currently held.
    pub fn task(&self) -> Option<Task> {
        self.lock().task.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Move to `queue`: drop the claim observer on the previous queue,
    /// register one on the new queue and try to pick up waiting work.
    ///
    /// A task already running finishes normally; afterwards the processor
    /// pulls from the new queue only.
    pub fn set_queue(&self, queue: Queue) {
        let next = {
            let mut slot = self.lock();
            if let Some(previous) = slot.queue.take() {
                previous.detach_processor(self.id());
            }
            queue.attach_processor(self.id(), self.claim_observer(), self.poll_hook());
            tracing::debug!(processor = %self.id(), "processor bound");
            slot.queue = Some(queue);
            self.take_next(&mut slot)
        };
        if let Some(task) = next {
            self.start(task);
        }
    }

    /// Detach from the current queue. Returns it, if there was one.
    pub fn unbind(&self) -> Option<Queue> {
        let queue = self.lock().queue.take()?;
        queue.detach_processor(self.id());
        tracing::debug!(processor = %self.id(), "processor unbound");
        Some(queue)
    }

    /// Stop starting new tasks. The held task keeps running.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
        self.poll();
    }

    /// Start the next waiting task now, if idle. Returns whether one started.
    pub fn poll(&self) -> bool {
        let next = {
            let mut slot = self.lock();
            self.take_next(&mut slot)
        };
        match next {
            Some(task) => {
                self.start(task);
                true
            }
            None => false,
        }
    }

    fn claim_observer(&self) -> ObserverFn {
        let weak = self.downgrade();
        Arc::new(move |task: &Task| {
            if let Some(processor) = Processor::upgrade(&weak) {
                processor.offer(task);
            }
        })
    }

    fn poll_hook(&self) -> PollFn {
        let weak = self.downgrade();
        Arc::new(move || {
            if let Some(processor) = Processor::upgrade(&weak) {
                processor.poll();
            }
        })
    }

    /// Queue observer: claim a freshly pushed task if idle.
    fn offer(&self, task: &Task) {
        let claimed = {
            let mut slot = self.lock();
            if slot.task.is_some() || slot.paused || !self.accept(task) {
                return;
            }
            let Some(queue) = slot.queue.as_ref() else {
                return;
            };
            match queue.claim(task) {
                Ok(task) => {
                    slot.task = Some(task.clone());
                    task
                }
                Err(_) => return,
            }
        };
        self.start(claimed);
    }

    /// Pop the next acceptable task into the slot. Caller holds the lock.
    fn take_next(&self, slot: &mut Slot) -> Option<Task> {
        if slot.task.is_some() || slot.paused {
            return None;
        }
        let queue = slot.queue.as_ref()?;
        let selector = match &self.inner.filter {
            Some(filter) => Selector::Matching(Arc::clone(filter)),
            None => Selector::All,
        };
        let task = queue.pop(selector)?;
        slot.task = Some(task.clone());
        Some(task)
    }

    fn start(&self, task: Task) {
        tracing::debug!(processor = %self.id(), task = %task.id(), "processor starting task");
        task.assign_processor(Some(self.id()));

        let weak = self.downgrade();
        task.on_complete(move |task| {
            task.assign_processor(None);
            if let Some(processor) = Processor::upgrade(&weak) {
                processor.finished(task);
            }
        });

        // タスク自身の executor が優先
        let executor = (!task.has_executor()).then(|| Arc::clone(&self.inner.executor));
        if let Err(e) = task.run(executor, self.inner.callback.clone()) {
            tracing::error!(processor = %self.id(), error = %e, "cannot run task");
            task.assign_processor(None);
            self.finished(&task);
        }
    }

    /// Completion continuation: release the task and pull the next one.
    fn finished(&self, task: &Task) {
        let next = {
            let mut slot = self.lock();
            if slot.task.as_ref() == Some(task) {
                slot.task = None;
            }
            self.take_next(&mut slot)
        };
        if let Some(next) = next {
            self.start(next);
        }
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.lock();
        f.debug_struct("Processor")
            .field("id", &self.inner.id)
            .field("task", &slot.task.as_ref().map(Task::id))
            .field("paused", &slot.paused)
            .field("bound", &slot.queue.is_some())
            .finish()
    }
}
