//! roost-core
//!
//! Scheduling and execution engine for long-running background daemons.
//!
//! # モジュール構成
//! - **domain**: ID と状態ラベル（TaskId, ProcessorId, State, RunState）
//! - **ports**: 抽象化レイヤー（Clock, IdGenerator, Executor）
//! - **impls**: Executor の実装（ThreadedExecutor, TokioExecutor, ManualExecutor）
//! - **sorted_array**: 比較関数でソートを保つ Vec
//! - **dispatcher**: 上限付きワーカースレッドプール
//! - **task**: 状態機械としての Task と TaskKind
//! - **queue**: 優先度順・フィルタ・observer 付きのタスク置き場
//! - **processor**: Queue に bind して 1 タスクずつ実行するワーカー
//! - **scheduler**: 名前付き Queue と Processor の組み合わせ
//!
//! # データの流れ
//! ```text
//! push ─► Queue ─(observer が claim)─► Processor ─► Task::run ─► Executor
//!            └─(誰も取らない)─► backlog ─(完了時に pop)─┘
//! ```

pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod sorted_array;
pub mod task;

pub use config::{DispatcherConfig, RoostConfig, SchedulerConfig};
pub use dispatcher::Dispatcher;
pub use domain::{ProcessorId, RunState, State, TaskId};
pub use error::{BoxError, SchedulerError, TaskExecutionError, WorkerError};
pub use processor::Processor;
pub use queue::{Queue, QueueConfig, Selector};
pub use scheduler::Scheduler;
pub use sorted_array::{Comparator, SortedArray};
pub use task::{BasicTask, StateTable, Task, TaskKind};
