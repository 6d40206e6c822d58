//! Scheduler - 名前付き Queue 群と Processor 群のまとめ役
//!
//! # 学習ポイント
//! - `default` キューは常に存在する。ルーター（`Fn(&Task) -> Option<String>`）で振り分け先を変えられる
//! - run / pause / stop は Processor 単位の pause / resume に落とし込む
//! - Processor を呼ぶ（= タスクの最初のステップが走る）間は Scheduler のロックを持たない

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::SchedulerConfig;
use crate::domain::RunState;
use crate::error::SchedulerError;
use crate::ports::SharedExecutor;
use crate::processor::Processor;
use crate::queue::{Queue, Selector};
use crate::task::Task;

/// Name of the queue every scheduler owns.
pub const DEFAULT_QUEUE: &str = "default";

/// Picks a queue name for a task; `None` means the default queue.
pub type Router = Arc<dyn Fn(&Task) -> Option<String> + Send + Sync>;

struct Registry {
    queues: HashMap<String, Queue>,
    processors: Vec<Processor>,
    run_state: RunState,
}

struct SchedulerInner {
    executor: SharedExecutor,
    router: Option<Router>,
    serialize_pushes: bool,
    registry: Mutex<Registry>,
}

/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

pub struct SchedulerBuilder {
    executor: SharedExecutor,
    config: SchedulerConfig,
    default_queue: Option<Queue>,
    queues: Vec<(String, Queue)>,
    processors: Vec<Processor>,
    router: Option<Router>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn default_queue(mut self, queue: Queue) -> Self {
        self.default_queue = Some(queue);
        self
    }

    pub fn queue(mut self, name: impl Into<String>, queue: Queue) -> Self {
        self.queues.push((name.into(), queue));
        self
    }

    /// Supplied processors replace the default ones. Unbound processors are
    /// bound to the default queue.
    pub fn processor(mut self, processor: Processor) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn router<F>(mut self, router: F) -> Self
    where
        F: Fn(&Task) -> Option<String> + Send + Sync + 'static,
    {
        self.router = Some(Arc::new(router));
        self
    }

    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        self.config.validate()?;

        let default_queue = self.default_queue.unwrap_or_default();
        let mut queues = HashMap::new();
        for (name, queue) in self.queues {
            queues.insert(name, queue);
        }
        queues.insert(DEFAULT_QUEUE.to_string(), default_queue.clone());

        let processors = if self.processors.is_empty() {
            (0..self.config.processors)
                .map(|_| Processor::new(default_queue.clone(), Arc::clone(&self.executor)))
                .collect()
        } else {
            for processor in &self.processors {
                if processor.queue().is_none() {
                    processor.set_queue(default_queue.clone());
                }
            }
            self.processors
        };

        tracing::debug!(
            queues = queues.len(),
            processors = processors.len(),
            serialize_pushes = self.config.serialize_pushes,
            "scheduler built"
        );

        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                executor: self.executor,
                router: self.router,
                serialize_pushes: self.config.serialize_pushes,
                registry: Mutex::new(Registry {
                    queues,
                    processors,
                    run_state: RunState::Running,
                }),
            }),
        })
    }
}

impl Scheduler {
    pub fn builder(executor: SharedExecutor) -> SchedulerBuilder {
        SchedulerBuilder {
            executor,
            config: SchedulerConfig::default(),
            default_queue: None,
            queues: Vec::new(),
            processors: Vec::new(),
            router: None,
        }
    }

    /// Default queue with one processor, running.
    pub fn new(executor: SharedExecutor) -> Result<Self, SchedulerError> {
        Self::builder(executor).build()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn executor(&self) -> &SharedExecutor {
        &self.inner.executor
    }

    fn route(&self, task: &Task) -> Result<Queue, SchedulerError> {
        let name = self
            .inner
            .router
            .as_ref()
            .and_then(|router| router(task))
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        self.registry()
            .queues
            .get(&name)
            .cloned()
            .ok_or(SchedulerError::UnknownQueue(name))
    }

    /// Route `task` to its queue and push it.
    ///
    /// With `serialize_pushes` the push itself runs on the executor's control
    /// thread, so the task may not be queued yet when this returns.
    pub fn push(&self, task: Task) -> Result<Task, SchedulerError> {
        let queue = self.route(&task)?;
        if self.inner.serialize_pushes {
            let pushed = task.clone();
            self.inner.executor.run_on_control_thread(Box::new(move || {
                queue.push(pushed);
            }));
            Ok(task)
        } else {
            Ok(queue.push(task))
        }
    }

    /// Push several tasks. Stops at the first routing error.
    pub fn add<I>(&self, tasks: I) -> Result<Vec<Task>, SchedulerError>
    where
        I: IntoIterator<Item = Task>,
    {
        tasks.into_iter().map(|task| self.push(task)).collect()
    }

    pub fn queue(&self, name: &str) -> Option<Queue> {
        self.registry().queues.get(name).cloned()
    }

    pub fn default_queue(&self) -> Queue {
        // build() が必ず登録する
        self.queue(DEFAULT_QUEUE).unwrap_or_default()
    }

    /// Register (or replace) a named queue. Returns the replaced queue.
    pub fn add_queue(&self, name: impl Into<String>, queue: Queue) -> Option<Queue> {
        self.registry().queues.insert(name.into(), queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn processors(&self) -> Vec<Processor> {
        self.registry().processors.clone()
    }

    /// Adopt `processor`, binding it to the default queue if unbound. It
    /// follows the scheduler's run state from now on.
    pub fn add_processor(&self, processor: Processor) {
        let run_state = {
            let mut registry = self.registry();
            registry.processors.push(processor.clone());
            registry.run_state
        };
        if !run_state.accepts_work() {
            processor.pause();
        }
        if processor.queue().is_none() {
            processor.set_queue(self.default_queue());
        }
    }

    fn set_run_state(&self, run_state: RunState) -> Vec<Processor> {
        let mut registry = self.registry();
        registry.run_state = run_state;
        tracing::info!(state = ?run_state, "scheduler run state changed");
        registry.processors.clone()
    }

    /// Resume every processor; idle ones start waiting work.
    pub fn run(&self) {
        for processor in self.set_run_state(RunState::Running) {
            processor.resume();
        }
    }

    /// Stop starting tasks. Backlog and in-flight tasks are kept.
    pub fn pause(&self) {
        for processor in self.set_run_state(RunState::Paused) {
            processor.pause();
        }
    }

    /// Pause and discard every queue's backlog. Returns the discarded tasks.
    ///
    /// In-flight tasks still run to completion.
    pub fn stop(&self) -> Vec<Task> {
        for processor in self.set_run_state(RunState::Stopped) {
            processor.pause();
        }
        let queues: Vec<Queue> = self.registry().queues.values().cloned().collect();
        let discarded: Vec<Task> = queues
            .iter()
            .flat_map(|queue| queue.pull(Selector::All))
            .collect();
        tracing::info!(discarded = discarded.len(), "scheduler stopped");
        discarded
    }

    pub fn state(&self) -> RunState {
        self.registry().run_state
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    pub fn is_paused(&self) -> bool {
        self.state() == RunState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == RunState::Stopped
    }

    fn queues(&self) -> Vec<Queue> {
        self.registry().queues.values().cloned().collect()
    }

    /// Tasks waiting across all queues.
    pub fn queue_length(&self) -> usize {
        self.queues().iter().map(|queue| queue.len(Selector::All)).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues().iter().all(|queue| queue.is_empty(Selector::All))
    }

    /// Processors currently holding a task.
    pub fn active_count(&self) -> usize {
        self.processors()
            .iter()
            .filter(|processor| processor.has_task())
            .count()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        let mut queues: Vec<&String> = registry.queues.keys().collect();
        queues.sort();
        f.debug_struct("Scheduler")
            .field("state", &registry.run_state)
            .field("queues", &queues)
            .field("processors", &registry.processors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::domain::State;
    use crate::impls::{ManualExecutor, ThreadedExecutor};
    use crate::task::{BasicTask, StateTable};
    use serde_json::json;
    use std::time::Duration;

    fn tagged(tag: i64) -> Task {
        Task::builder(BasicTask).context(json!({ "tag": tag })).build()
    }

    fn tag(task: &Task) -> i64 {
        task.context()
            .and_then(|context| context["tag"].as_i64())
            .unwrap_or(-1)
    }

    fn manual() -> (ManualExecutor, SharedExecutor) {
        let executor = ManualExecutor::new();
        let shared: SharedExecutor = Arc::new(executor.clone());
        (executor, shared)
    }

    #[test]
    fn default_setup_runs_pushed_tasks() {
        let (executor, shared) = manual();
        let scheduler = Scheduler::new(shared).unwrap();

        assert_eq!(scheduler.queue_names(), vec!["default"]);
        assert_eq!(scheduler.processors().len(), 1);
        assert!(scheduler.is_running());

        let task = scheduler.push(tagged(1)).unwrap();
        assert_eq!(scheduler.active_count(), 1);

        executor.run_pending();
        assert!(task.is_finished());
        assert!(scheduler.is_empty());
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn configured_processor_count_bounds_concurrency() {
        let (executor, shared) = manual();
        let scheduler = Scheduler::builder(shared)
            .config(SchedulerConfig {
                processors: 3,
                ..SchedulerConfig::default()
            })
            .build()
            .unwrap();

        let tasks = scheduler.add((0..5).map(tagged)).unwrap();
        assert_eq!(scheduler.active_count(), 3);
        assert_eq!(scheduler.queue_length(), 2);

        executor.run_pending();
        assert!(tasks.iter().all(Task::is_finished));
        assert_eq!(scheduler.queue_length(), 0);
    }

    #[test]
    fn zero_processors_is_rejected() {
        let (_executor, shared) = manual();
        let result = Scheduler::builder(shared)
            .config(SchedulerConfig {
                processors: 0,
                ..SchedulerConfig::default()
            })
            .build();
        assert!(matches!(result, Err(SchedulerError::InvalidConfig(_))));
    }

    #[test]
    fn router_selects_named_queues() {
        let (_executor, shared) = manual();
        let mail = Queue::new();
        let scheduler = Scheduler::builder(shared)
            .queue("mail", mail.clone())
            .router(|task| match tag(task) {
                100.. => Some("mail".to_string()),
                n if n < 0 => Some("nowhere".to_string()),
                _ => None,
            })
            .build()
            .unwrap();

        // mail には Processor がいないので backlog に残る
        let letter = scheduler.push(tagged(100)).unwrap();
        assert_eq!(mail.to_vec(), vec![letter]);
        assert_eq!(scheduler.queue("mail").map(|q| q.len(Selector::All)), Some(1));
        assert_eq!(scheduler.queue_length(), 1);

        let err = scheduler.push(tagged(-1)).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownQueue(name) if name == "nowhere"));
    }

    #[test]
    fn pause_keeps_work_and_run_resumes_it() {
        let (executor, shared) = manual();
        let scheduler = Scheduler::new(shared).unwrap();

        scheduler.pause();
        assert!(scheduler.is_paused());
        let tasks = scheduler.add([tagged(1), tagged(2)]).unwrap();
        executor.run_pending();
        assert_eq!(scheduler.queue_length(), 2);
        assert_eq!(scheduler.active_count(), 0);

        scheduler.run();
        assert_eq!(scheduler.active_count(), 1);
        executor.run_pending();

        assert!(tasks.iter().all(Task::is_finished));
        assert!(scheduler.is_empty());
    }

    #[test]
    fn stop_discards_backlog_but_finishes_in_flight_work() {
        let (executor, shared) = manual();
        let scheduler = Scheduler::new(shared).unwrap();
        let tasks = scheduler.add((0..3).map(tagged)).unwrap();

        let discarded = scheduler.stop();
        assert!(scheduler.is_stopped());
        assert_eq!(discarded, tasks[1..].to_vec());
        assert_eq!(scheduler.queue_length(), 0);

        executor.run_pending();
        assert!(tasks[0].is_finished());
        assert_eq!(tasks[1].state(), State::INITIALIZED);
        assert!(tasks[1].started_at().is_none());
        assert_eq!(scheduler.active_count(), 0);
    }

    #[test]
    fn serialized_pushes_go_through_the_control_thread() {
        let (executor, shared) = manual();
        let scheduler = Scheduler::builder(shared)
            .config(SchedulerConfig {
                serialize_pushes: true,
                ..SchedulerConfig::default()
            })
            .build()
            .unwrap();

        let task = scheduler.push(tagged(1)).unwrap();
        assert!(!scheduler.default_queue().contains(&task));
        assert_eq!(scheduler.active_count(), 0);

        executor.run_pending();
        assert!(task.is_finished());
    }

    #[test]
    fn added_processors_follow_the_run_state() {
        let (executor, shared) = manual();
        let scheduler = Scheduler::new(Arc::clone(&shared)).unwrap();
        scheduler.pause();

        let extra = Processor::builder(shared).build();
        scheduler.add_processor(extra.clone());
        assert!(extra.is_paused());
        assert!(scheduler.default_queue().has_processor(extra.id()));

        scheduler.add([tagged(1), tagged(2)]).unwrap();
        assert_eq!(scheduler.active_count(), 0);

        scheduler.run();
        assert_eq!(scheduler.active_count(), 2);
        executor.run_pending();
        assert!(scheduler.is_empty());
    }

    #[test]
    fn multi_queue_workload_on_threads() {
        let executor: SharedExecutor =
            Arc::new(ThreadedExecutor::new(DispatcherConfig::with_thread_limit(6)).unwrap());
        let bulk = Queue::new();
        let scheduler = Scheduler::builder(Arc::clone(&executor))
            .queue("bulk", bulk.clone())
            .router(|task| (tag(task) % 3 == 0).then(|| "bulk".to_string()))
            .config(SchedulerConfig {
                processors: 2,
                ..SchedulerConfig::default()
            })
            .build()
            .unwrap();
        scheduler.add_processor(Processor::new(bulk, Arc::clone(&executor)));

        let tasks: Vec<Task> = (0..60)
            .map(|n| {
                let kind = StateTable::new()
                    .on("initialized", |task| Ok(task.transition_to_state("step")?))
                    .on("step", |task| Ok(task.transition_to_state(State::FINISHED)?));
                scheduler
                    .push(Task::builder(kind).context(json!({ "tag": n })).build())
                    .unwrap()
            })
            .collect();

        for task in &tasks {
            assert!(task.wait_timeout(Duration::from_secs(10)));
        }
        assert!(tasks.iter().all(Task::is_finished));
        assert!(scheduler.is_empty());
    }
}
