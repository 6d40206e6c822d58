//! Ports - 抽象化レイヤー
//!
//! コアが外部に依存する箇所（時刻・ID・実行コンテキスト）を trait として切り出します。

pub mod clock;
pub mod executor;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::{Executor, Job, SharedExecutor};
pub use self::id_generator::{IdGenerator, UlidGenerator};
