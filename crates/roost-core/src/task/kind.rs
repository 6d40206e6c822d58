//! TaskKind - タスクの振る舞い（状態ごとの handler とフック）
//!
//! # 学習ポイント
//! - デフォルト実装付きの trait で「オーバーライドしたいところだけ書く」
//! - `StateTable`: クロージャを状態名に対応付けるだけの汎用実装

use std::collections::HashMap;
use std::sync::Arc;

use super::Task;
use crate::domain::State;
use crate::error::{BoxError, TaskExecutionError};

static DEFAULT_TERMINAL_STATES: [State; 2] = [State::FAILED, State::FINISHED];

/// Behaviour of one type of task.
///
/// Every method has a default, so the unit struct [`BasicTask`] is a complete
/// kind: `initialized` goes straight to `finished`.
///
/// Handlers run synchronously on whatever thread the executor picked. To move
/// on, a handler calls [`Task::transition_to_state`]; returning without doing
/// so leaves the task waiting in that state (e.g. for an I/O callback that
/// transitions later).
pub trait TaskKind: Send + Sync + 'static {
    fn initial_state(&self) -> State {
        State::INITIALIZED
    }

    /// States after which nothing else runs. `failed` is terminal even when
    /// it is not listed.
    fn terminal_states(&self) -> &[State] {
        &DEFAULT_TERMINAL_STATES
    }

    /// Handler for a non-terminal state. Unknown states are a no-op.
    fn handle_state(&self, task: &Task, state: &State) -> Result<(), BoxError> {
        if *state == State::INITIALIZED {
            task.transition_to_state(State::FINISHED)?;
        }
        Ok(())
    }

    /// Rank used as the queue sort key. `None` means creation time.
    fn priority(&self) -> Option<i64> {
        None
    }

    /// Called once, when the task is built.
    fn after_initialized(&self, _task: &Task) {}

    fn before_state(&self, _task: &Task, _state: &State) -> Result<(), BoxError> {
        Ok(())
    }

    fn after_state(&self, _task: &Task, _state: &State) {}

    /// Called after a terminal state has run (finished or failed).
    fn after_finished(&self, _task: &Task) {}

    fn after_failed(&self, _task: &Task) {}

    /// Failures returned from here are ignored.
    fn handle_exception(&self, _task: &Task, _error: &TaskExecutionError) -> Result<(), BoxError> {
        Ok(())
    }
}

/// The base no-op task.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicTask;

impl TaskKind for BasicTask {}

type StateHandler = Arc<dyn Fn(&Task) -> Result<(), BoxError> + Send + Sync>;

/// Task kind assembled from closures, one per state.
///
/// ```ignore
/// let kind = StateTable::new()
///     .on("initialized", |task| task.transition_to_state("fetch").map_err(Into::into))
///     .on("fetch", |task| { /* ... */ task.transition_to_state("finished").map_err(Into::into) });
/// ```
#[derive(Clone)]
pub struct StateTable {
    initial: State,
    terminal: Vec<State>,
    handlers: HashMap<State, StateHandler>,
    priority: Option<i64>,
}

impl StateTable {
    /// Starts with the built-in `initialized -> finished` handler, which `on`
    /// can replace.
    pub fn new() -> Self {
        let mut table = Self {
            initial: State::INITIALIZED,
            terminal: DEFAULT_TERMINAL_STATES.to_vec(),
            handlers: HashMap::new(),
            priority: None,
        };
        table.handlers.insert(
            State::INITIALIZED,
            Arc::new(|task: &Task| -> Result<(), BoxError> {
                task.transition_to_state(State::FINISHED)?;
                Ok(())
            }),
        );
        table
    }

    pub fn on<F>(mut self, state: impl Into<State>, handler: F) -> Self
    where
        F: Fn(&Task) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.handlers.insert(state.into(), Arc::new(handler));
        self
    }

    /// Declare a state that deliberately has no handler.
    pub fn waiting(mut self, state: impl Into<State>) -> Self {
        self.handlers.remove(&state.into());
        self
    }

    pub fn initial_state(mut self, state: impl Into<State>) -> Self {
        self.initial = state.into();
        self
    }

    /// Replace the terminal set. `failed` stays terminal regardless.
    pub fn terminal_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<State>,
    {
        self.terminal = states.into_iter().map(Into::into).collect();
        self
    }

    pub fn priority(mut self, rank: i64) -> Self {
        self.priority = Some(rank);
        self
    }
}

impl Default for StateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskKind for StateTable {
    fn initial_state(&self) -> State {
        self.initial.clone()
    }

    fn terminal_states(&self) -> &[State] {
        &self.terminal
    }

    fn handle_state(&self, task: &Task, state: &State) -> Result<(), BoxError> {
        match self.handlers.get(state) {
            Some(handler) => handler(task),
            None => Ok(()),
        }
    }

    fn priority(&self) -> Option<i64> {
        self.priority
    }
}

impl std::fmt::Debug for StateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut states: Vec<&str> = self.handlers.keys().map(State::as_str).collect();
        states.sort_unstable();
        f.debug_struct("StateTable")
            .field("initial", &self.initial)
            .field("terminal", &self.terminal)
            .field("handlers", &states)
            .finish()
    }
}
