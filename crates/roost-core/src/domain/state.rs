//! State - タスクの状態ラベルとスケジューラの実行状態

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// State label of a task.
///
/// Task kinds declare their own states as plain labels; the built-in ones are
/// provided as constants.
///
/// # 状態遷移（デフォルト）
/// - initialized -> finished
/// - initialized -> (custom states...) -> finished | failed
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State(Cow<'static, str>);

impl State {
    pub const INITIALIZED: State = State::from_static("initialized");
    pub const FINISHED: State = State::from_static("finished");
    pub const FAILED: State = State::from_static("failed");

    pub const fn from_static(label: &'static str) -> Self {
        Self(Cow::Borrowed(label))
    }

    pub fn new(label: impl Into<String>) -> Self {
        Self(Cow::Owned(label.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&'static str> for State {
    fn from(label: &'static str) -> Self {
        Self::from_static(label)
    }
}

impl PartialEq<str> for State {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for State {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

/// RunState はスケジューラ全体の実行状態
///
/// - running: Processor が新しいタスクを開始できる
/// - paused: backlog と実行中タスクはそのまま、新規開始だけ止める
/// - stopped: paused に加えて backlog を破棄済み
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

impl RunState {
    /// Can processors start new work?
    pub fn accepts_work(self) -> bool {
        matches!(self, RunState::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_and_owned_labels_compare_equal() {
        assert_eq!(State::new("finished"), State::FINISHED);
        assert_eq!(State::from("failed"), State::FAILED);
        assert!(State::INITIALIZED == "initialized");
    }

    #[test]
    fn state_serializes_as_plain_string() {
        let json = serde_json::to_string(&State::new("download")).unwrap();
        assert_eq!(json, "\"download\"");

        let back: State = serde_json::from_str(&json).unwrap();
        assert_eq!(back, "download");
    }

    #[test]
    fn only_running_accepts_work() {
        assert!(RunState::Running.accepts_work());
        assert!(!RunState::Paused.accepts_work());
        assert!(!RunState::Stopped.accepts_work());
        assert_eq!(serde_json::to_string(&RunState::Paused).unwrap(), "\"paused\"");
    }
}
