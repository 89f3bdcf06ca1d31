//! Conductor 命令行入口
//!
//! 用法：`conductor "<instruction>" [code-file]`
//! 进度事件以 JSON 行写到 stdout，日志写到 stderr；任务失败时以非零码退出。
//! 配置文件路径可由 CONDUCTOR_CONFIG 指定，Ctrl-C 取消当前任务。

use std::path::PathBuf;

use anyhow::{bail, Context};
use conductor::config::load_config_or_default;
use conductor::core::EngineBuilder;
use futures_util::StreamExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conductor::observability::init();

    let mut args = std::env::args().skip(1);
    let Some(instruction) = args.next() else {
        bail!("usage: conductor \"<instruction>\" [code-file]");
    };
    let source_code = match args.next() {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read code file {path}"))?,
        None => String::new(),
    };

    let config_path = std::env::var("CONDUCTOR_CONFIG").ok().map(PathBuf::from);
    let orchestrator = EngineBuilder::new(load_config_or_default(config_path)).build();

    let submitted = orchestrator
        .submit(instruction, source_code)
        .await
        .context("Failed to submit task")?;
    let task_id = submitted.task_id;

    let events = submitted.progress.into_stream();
    tokio::pin!(events);
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event)?);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!(task_id = %task_id, "interrupted, cancelling task");
                orchestrator.cancel(&task_id).await?;
            }
        }
    }

    let snapshot = submitted.handle.await.context("Task runner panicked")?;
    orchestrator.registry().shutdown();
    if snapshot.task_failed {
        bail!(
            "task {task_id} failed: {}",
            snapshot.failure_reason.unwrap_or_default()
        );
    }
    Ok(())
}
