//! roost デモ
//!
//! ThreadedExecutor の上に Scheduler を組み立て、複数ステップのタスクを流す。
//! - `RUST_LOG` でログレベル（既定 info）
//! - `ROOST_CONFIG` に JSON 設定ファイルのパス（省略時は既定値）
//!
//! 失敗したタスクは自動では再実行されないので、ここで新しい Task として 1 回だけ投げ直す。

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use roost_core::impls::ThreadedExecutor;
use roost_core::ports::SharedExecutor;
use roost_core::{Processor, Queue, RoostConfig, Scheduler, State, StateTable, Task};
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

/// initialized -> greet -> finished
fn greeting(failures: Arc<AtomicU32>) -> StateTable {
    StateTable::new()
        .on("initialized", |task| Ok(task.transition_to_state("greet")?))
        .on("greet", move |task| {
            let name = task
                .context()
                .and_then(|context| context["name"].as_str())
                .unwrap_or("world");

            let left = failures.load(Ordering::Relaxed);
            if left > 0 {
                failures.fetch_sub(1, Ordering::Relaxed);
                return Err(format!("intentional failure for {name} (left={left})").into());
            }

            println!("Hello, {name}!");
            task.transition_to_state(State::FINISHED)?;
            Ok(())
        })
}

fn queue_of(task: &Task) -> Option<String> {
    task.context()
        .and_then(|context| context["queue"].as_str())
        .map(str::to_string)
}

async fn wait_all(tasks: &[Task]) -> Result<(), tokio::time::error::Elapsed> {
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(10), task.wait()).await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::var("ROOST_CONFIG") {
        Ok(path) => RoostConfig::from_json_file(path)?,
        Err(_) => RoostConfig::default(),
    };
    config.validate()?;

    // (A) Executor と Scheduler
    let executor: SharedExecutor = Arc::new(ThreadedExecutor::new(config.dispatcher.clone())?);
    let slow = Queue::new();
    let scheduler = Scheduler::builder(Arc::clone(&executor))
        .config(config.scheduler.clone())
        .queue("slow", slow.clone())
        .router(queue_of)
        .build()?;
    scheduler.add_processor(Processor::new(slow, Arc::clone(&executor)));

    // (B) タスク投入
    let failures = Arc::new(AtomicU32::new(2));
    let contexts: Vec<Value> = ["alice", "bob", "carol", "dave", "erin"]
        .into_iter()
        .enumerate()
        .map(|(n, name)| {
            if n % 2 == 0 {
                json!({ "name": name })
            } else {
                json!({ "name": name, "queue": "slow" })
            }
        })
        .collect();

    let tasks = scheduler.add(contexts.iter().map(|context| {
        Task::builder(greeting(Arc::clone(&failures)))
            .context(context.clone())
            .build()
    }))?;
    wait_all(&tasks).await?;

    // (C) 失敗分を新しい Task として投げ直す
    let failed: Vec<&Task> = tasks.iter().filter(|task| task.is_failed()).collect();
    for task in &failed {
        if let Some(error) = task.exception() {
            tracing::warn!(task = %task.id(), %error, "resubmitting failed task");
        }
    }
    let retries = scheduler.add(failed.iter().map(|task| {
        let mut builder = Task::builder(greeting(Arc::clone(&failures)));
        if let Some(context) = task.context() {
            builder = builder.context(context.clone());
        }
        builder.build()
    }))?;
    wait_all(&retries).await?;

    // (D) 集計
    let finished = tasks
        .iter()
        .chain(retries.iter())
        .filter(|task| task.is_finished())
        .count();
    tracing::info!(
        submitted = tasks.len(),
        retried = retries.len(),
        finished,
        queued = scheduler.queue_length(),
        "demo complete"
    );

    scheduler.stop();
    Ok(())
}
