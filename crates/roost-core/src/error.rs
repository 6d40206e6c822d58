//! Errors - エラー型と分類
//!
//! - `SchedulerError`: 構造的なエラー（呼び出し元へ同期的に返す）
//! - `TaskExecutionError`: state handler の失敗（Task に記録され、伝播しない）
//! - `WorkerError`: Dispatcher に投げた処理の失敗（Dispatcher に記録され、伝播しない）

use std::any::Any;

use serde::Serialize;
use thiserror::Error;

use crate::domain::{State, TaskId};

/// Error type returned by state handlers and dispatched work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no usable comparator was supplied")]
    InvalidComparator,

    #[error("task {0} is not tracked by this queue")]
    TaskNotQueued(TaskId),

    #[error("no queue named '{0}'")]
    UnknownQueue(String),

    #[error("filter name '{0}' is reserved")]
    ReservedFilter(String),

    #[error("task {0} has no executor to dispatch its states through")]
    NoExecutor(TaskId),

    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

/// How a state step blew up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Error,
    Panic,
}

/// Error captured while running one state of a task.
#[derive(Debug, Clone, Error, Serialize)]
#[error("task failed in state '{state}': {message}")]
pub struct TaskExecutionError {
    pub state: State,
    pub kind: FailureKind,
    pub message: String,
}

impl TaskExecutionError {
    pub fn from_error(state: State, err: BoxError) -> Self {
        Self {
            state,
            kind: FailureKind::Error,
            message: err.to_string(),
        }
    }

    pub fn from_panic(state: State, payload: Box<dyn Any + Send>) -> Self {
        Self {
            state,
            kind: FailureKind::Panic,
            message: panic_message(payload.as_ref()),
        }
    }
}

/// Error captured inside a Dispatcher worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("work failed: {0}")]
    Failed(String),

    #[error("work panicked: {0}")]
    Panicked(String),
}

impl WorkerError {
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        WorkerError::Panicked(panic_message(payload.as_ref()))
    }
}

/// Best-effort text of a panic payload (`&str` / `String`).
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_are_readable() {
        let caught = std::panic::catch_unwind(|| panic!("boom {}", 42)).unwrap_err();
        let err = WorkerError::from_panic(caught);
        assert_eq!(err, WorkerError::Panicked("boom 42".to_string()));

        let caught = std::panic::catch_unwind(|| panic!("static")).unwrap_err();
        let err = TaskExecutionError::from_panic(State::INITIALIZED, caught);
        assert_eq!(err.kind, FailureKind::Panic);
        assert_eq!(err.to_string(), "task failed in state 'initialized': static");
    }

    #[test]
    fn scheduler_error_messages() {
        let msg = SchedulerError::UnknownQueue("mail".into()).to_string();
        assert!(msg.contains("mail"));
        assert_eq!(
            SchedulerError::InvalidComparator.to_string(),
            "no usable comparator was supplied"
        );
    }
}
