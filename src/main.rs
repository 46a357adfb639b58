//! Spotter 演示入口
//!
//! 从 stdin 逐行读取用户输入，每行作为一轮对话执行一次 echo 步骤，并把结果以 JSON 打印到 stdout。
//! Ctrl-C 在等待输入或执行一轮时都会生效：取消所有会话的在途请求后退出。

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

use spotter::config::{load_config, StorageKind};
use spotter::core::TaskType;
use spotter::memory::{DefaultProfileLoader, InMemoryStateStorage, JsonFileStateStorage, StateStorageAdapter};
use spotter::tools::{EchoTool, ToolCall, ToolRegistry};
use spotter::{ChatAgent, TaskPlan, TurnRequest};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    spotter::observability::init();

    let cfg = load_config(None).context("Failed to load config")?;

    let storage: Arc<dyn StateStorageAdapter> = match cfg.state.storage {
        StorageKind::Memory => Arc::new(InMemoryStateStorage::new()),
        StorageKind::File => {
            let dir = cfg.state.storage_dir(&cfg.app);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            Arc::new(JsonFileStateStorage::new(dir))
        }
    };

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    let agent = ChatAgent::from_config(&cfg, registry, storage, Arc::new(DefaultProfileLoader));

    let session_id = std::env::var("SPOTTER_SESSION").unwrap_or_else(|_| "local".to_string());
    let user_id = std::env::var("SPOTTER_USER").unwrap_or_else(|_| "local-user".to_string());
    tracing::info!(session_id = %session_id, user_id = %user_id, "spotter ready, reading stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                agent.supervisor().cancel_all();
                None
            }
        };
        let Some(line) = line else { break };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }

        let plan = TaskPlan::new(TaskType::GeneralChat)
            .step("echo", ToolCall::new("echo", json!({ "text": text })));
        let turn = agent.run_turn(TurnRequest::new(&session_id, &user_id, text).with_plan(plan));
        tokio::pin!(turn);
        // 执行中收到 Ctrl-C：取消在途工具链，等本轮收尾（任务记为 cancelled）后退出
        let (outcome, interrupted) = tokio::select! {
            outcome = &mut turn => (outcome, false),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, cancelling in-flight turn");
                agent.supervisor().cancel_all();
                ((&mut turn).await, true)
            }
        };
        let outcome = outcome.context("Turn failed")?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        if interrupted {
            break;
        }
    }

    tracing::info!("shutting down");
    Ok(())
}
