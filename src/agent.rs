//! 单轮对话运行时
//!
//! ChatAgent 把状态管理器与工具链执行器串起来跑一轮：
//! 记录用户消息，按计划创建任务，执行工具链，回写步骤状态与工具结果消息，最后生成 AI 上下文。
//! 计划（要调用哪些工具）由上游决定，这里不做意图识别。

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::AppConfig;
use crate::core::{
    ChainError, ConversationStateManager, SessionSupervisor, StateManagerConfig, StateManagerError,
    StepPatch, StepSpec, StepStatus, TaskContext, TaskType,
};
use crate::memory::{NewMessage, ProfileLoader, StateStorageAdapter};
use crate::tools::{ToolCall, ToolChainExecutor, ToolContext, ToolExecutor, ToolRegistry, ToolResult, ToolRuntime};

/// 一轮对话的输入
#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    /// 无计划时只记录消息
    pub plan: Option<TaskPlan>,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            message: message.into(),
            plan: None,
        }
    }

    pub fn with_plan(mut self, plan: TaskPlan) -> Self {
        self.plan = Some(plan);
        self
    }
}

/// 任务计划：每个步骤对应一次工具调用，步骤间依赖用工具名表达
#[derive(Clone, Debug)]
pub struct TaskPlan {
    pub task_type: TaskType,
    pub steps: Vec<PlannedStep>,
}

impl TaskPlan {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            task_type,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, name: impl Into<String>, call: ToolCall) -> Self {
        self.steps.push(PlannedStep {
            name: name.into(),
            call,
        });
        self
    }
}

#[derive(Clone, Debug)]
pub struct PlannedStep {
    pub name: String,
    pub call: ToolCall,
}

/// 一轮对话的结果
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnOutcome {
    pub results: HashMap<String, ToolResult>,
    pub task: Option<TaskContext>,
    pub context_for_ai: String,
    /// 依赖无法满足而未执行的工具
    pub deadlocked: Vec<String>,
    pub cancelled: bool,
}

pub struct ChatAgent {
    chain: ToolChainExecutor,
    state: Arc<ConversationStateManager>,
}

impl ChatAgent {
    pub fn new(chain: ToolChainExecutor, state: Arc<ConversationStateManager>) -> Self {
        Self { chain, state }
    }

    /// 按配置组装运行时、执行器与状态管理器
    pub fn from_config(
        cfg: &AppConfig,
        registry: ToolRegistry,
        storage: Arc<dyn StateStorageAdapter>,
        profiles: Arc<dyn ProfileLoader>,
    ) -> Self {
        let runtime = Arc::new(ToolRuntime::from_config(registry, &cfg.tools));
        let chain = ToolChainExecutor::new(ToolExecutor::new(runtime));
        let state = ConversationStateManager::new(storage, profiles, StateManagerConfig::from(&cfg.state));
        Self::new(chain, Arc::new(state))
    }

    pub fn state(&self) -> &Arc<ConversationStateManager> {
        &self.state
    }

    pub fn chain(&self) -> &ToolChainExecutor {
        &self.chain
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        self.state.supervisor()
    }

    /// 取消会话在途的工具链
    pub fn cancel_session(&self, session_id: &str) {
        self.supervisor().cancel(session_id);
    }

    pub async fn run_turn(&self, req: TurnRequest) -> Result<TurnOutcome, StateManagerError> {
        let sid = req.session_id.as_str();
        // 同会话的轮次依次执行，任务与消息不会交错
        let _turn = self.supervisor().acquire_turn(sid).await;
        if self.state.get_state(sid).await.is_none() {
            self.state.initialize_state(sid, &req.user_id).await?;
        }
        self.state.add_message(sid, NewMessage::user(&req.message)).await?;

        let plan = match req.plan {
            Some(plan) if !plan.steps.is_empty() => plan,
            _ => return self.outcome(sid, HashMap::new(), Vec::new(), false).await,
        };

        let specs = plan
            .steps
            .iter()
            .map(|s| StepSpec::new(&s.name).with_input(s.call.parameters.clone()))
            .collect();
        let task = self.state.start_task(sid, plan.task_type, specs).await?;
        let step_ids: Vec<String> = task.steps.iter().map(|s| s.step_id.clone()).collect();
        for step_id in &step_ids {
            self.state
                .update_task_step(sid, step_id, StepPatch::status(StepStatus::InProgress))
                .await?;
        }

        let ctx = self.tool_context(&req.session_id, &req.user_id, &task.task_id).await;
        let calls: Vec<ToolCall> = plan
            .steps
            .iter()
            .zip(&step_ids)
            .map(|(s, id)| s.call.clone().for_step(id))
            .collect();

        let (results, unresolved, cancelled) = match self.chain.execute_tool_chain(calls, &ctx).await {
            Ok(outcome) => (outcome.results, Vec::new(), false),
            Err(e) => {
                let cancelled = matches!(e, ChainError::Cancelled { .. });
                let unresolved = e.unresolved().to_vec();
                (e.into_results(), unresolved, cancelled)
            }
        };

        let mut failures: Vec<String> = Vec::new();
        let mut skipped: Vec<&str> = Vec::new();
        for (planned, step_id) in plan.steps.iter().zip(&step_ids) {
            match results.get(&planned.call.tool_name) {
                Some(r) if r.success => {
                    let output = r.data.clone().unwrap_or(Value::Null);
                    self.state
                        .update_task_step(sid, step_id, StepPatch::completed(output))
                        .await?;
                }
                Some(r) => {
                    let message = r
                        .error
                        .as_ref()
                        .map(|e| e.message.clone())
                        .unwrap_or_else(|| "tool failed".to_string());
                    failures.push(format!("step {} failed: {}", planned.name, message));
                    self.state
                        .update_task_step(sid, step_id, StepPatch::failed(message))
                        .await?;
                }
                None => skipped.push(step_id),
            }
        }

        if cancelled {
            self.state.fail_task(sid, "cancelled").await?;
        } else if !failures.is_empty() {
            self.state.fail_task(sid, failures.join("; ")).await?;
        } else if !unresolved.is_empty() {
            self.state
                .fail_task(sid, format!("unresolved dependencies: {}", unresolved.join(", ")))
                .await?;
        }
        for step_id in skipped {
            self.state
                .update_task_step(sid, step_id, StepPatch::status(StepStatus::Skipped))
                .await?;
        }

        for planned in &plan.steps {
            if let Some(r) = results.get(&planned.call.tool_name) {
                let mut message =
                    NewMessage::tool_result(&planned.call.tool_name, result_text(r)).with_task(&task.task_id);
                if let Some(confidence) = r.metadata.confidence {
                    message = message.with_confidence(confidence);
                }
                self.state.add_message(sid, message).await?;
            }
        }

        tracing::info!(
            session_id = %sid,
            task_id = %task.task_id,
            tools = results.len(),
            failed = failures.len(),
            unresolved = unresolved.len(),
            cancelled,
            "turn finished"
        );
        let deadlocked = if cancelled { Vec::new() } else { unresolved };
        self.outcome(sid, results, deadlocked, cancelled).await
    }

    async fn tool_context(&self, session_id: &str, user_id: &str, task_id: &str) -> ToolContext {
        let mut ctx = ToolContext::new(session_id, user_id)
            .with_task(task_id)
            .with_conversation_context(self.state.get_context_for_ai(session_id).await)
            .with_cancel(self.supervisor().cancel_token(session_id));
        if let Some(state) = self.state.get_state(session_id).await {
            ctx = ctx.with_profile(state.context.user_profile);
        }
        ctx
    }

    async fn outcome(
        &self,
        session_id: &str,
        results: HashMap<String, ToolResult>,
        deadlocked: Vec<String>,
        cancelled: bool,
    ) -> Result<TurnOutcome, StateManagerError> {
        let task = self
            .state
            .get_state(session_id)
            .await
            .and_then(|s| s.context.current_task);
        Ok(TurnOutcome {
            results,
            task,
            context_for_ai: self.state.get_context_for_ai(session_id).await,
            deadlocked,
            cancelled,
        })
    }
}

/// 工具结果写入历史时的文本：成功为 data 的 JSON，失败为错误消息
fn result_text(result: &ToolResult) -> String {
    if result.success {
        match &result.data {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        }
    } else {
        result
            .error
            .as_ref()
            .map(|e| format!("{}: {}", e.code, e.message))
            .unwrap_or_default()
    }
}
