//! 工具链执行
//!
//! 一批带依赖声明的工具调用：每轮找出依赖全部「已成功」的待执行调用，同时发起、一起等待，
//! 记录结果后进入下一轮；没有可执行调用而仍有待执行时即为依赖死锁（不可满足或循环依赖），
//! 以 ChainError::Deadlock 返回未完成的调用名与已有结果。
//! 每轮开始前与结束后检查取消令牌，被取消时以 ChainError::Cancelled 返回。

use std::collections::HashMap;

use futures_util::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ChainError;
use crate::tools::{ToolContext, ToolExecutor, ToolResult};

/// 工具链中的一次调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// 工具名
    pub tool_name: String,
    /// 工具参数
    #[serde(default)]
    pub parameters: Value,
    /// 必须已成功产出结果的工具名
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// 关联的任务步骤（透传给工具上下文）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            dependencies: Vec::new(),
            step_id: None,
        }
    }

    pub fn depends_on(mut self, tool_name: impl Into<String>) -> Self {
        self.dependencies.push(tool_name.into());
        self
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    fn is_ready(&self, results: &HashMap<String, ToolResult>) -> bool {
        self.dependencies
            .iter()
            .all(|dep| results.get(dep).map(|r| r.success).unwrap_or(false))
    }
}

/// 工具链执行结果：按工具名的结果，以及每轮发起的调用（执行分组顺序）
#[derive(Clone, Debug, Default)]
pub struct ChainOutcome {
    pub results: HashMap<String, ToolResult>,
    pub batches: Vec<Vec<String>>,
}

#[derive(Clone)]
pub struct ToolChainExecutor {
    executor: ToolExecutor,
}

impl ToolChainExecutor {
    pub fn new(executor: ToolExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &ToolExecutor {
        &self.executor
    }

    /// 按依赖执行整条工具链；同名工具的结果以后完成者为准
    pub async fn execute_tool_chain(
        &self,
        calls: Vec<ToolCall>,
        ctx: &ToolContext,
    ) -> Result<ChainOutcome, ChainError> {
        let mut pending: Vec<usize> = (0..calls.len()).collect();
        let mut outcome = ChainOutcome::default();

        while !pending.is_empty() {
            if ctx.cancel.is_cancelled() {
                tracing::info!(unresolved = pending.len(), "tool chain cancelled");
                return Err(ChainError::Cancelled {
                    unresolved: names(&calls, &pending),
                    results: outcome.results,
                });
            }

            let (ready, waiting): (Vec<usize>, Vec<usize>) = pending
                .iter()
                .partition(|&&i| calls[i].is_ready(&outcome.results));

            if ready.is_empty() {
                let unresolved = names(&calls, &waiting);
                tracing::warn!(unresolved = ?unresolved, "tool chain deadlock: dependencies cannot be satisfied");
                return Err(ChainError::Deadlock {
                    unresolved,
                    results: outcome.results,
                });
            }
            pending = waiting;

            let batch = names(&calls, &ready);
            tracing::debug!(batch = ?batch, "tool chain batch");

            let mut base = ctx.clone();
            base.previous_results = outcome.results.clone();
            let contexts: Vec<ToolContext> = ready
                .iter()
                .map(|&i| {
                    let mut c = base.clone();
                    if let Some(step_id) = &calls[i].step_id {
                        c.step_id = Some(step_id.clone());
                    }
                    c
                })
                .collect();

            let runs = ready.iter().zip(contexts.iter()).map(|(&i, c)| {
                let call = &calls[i];
                self.executor
                    .execute_tool(&call.tool_name, call.parameters.clone(), c)
            });
            let results = join_all(runs).await;

            for (&i, result) in ready.iter().zip(results) {
                outcome.results.insert(calls[i].tool_name.clone(), result);
            }
            outcome.batches.push(batch);

            // 最后一批执行中被取消也按取消返回
            if ctx.cancel.is_cancelled() {
                tracing::info!(unresolved = pending.len(), "tool chain cancelled during batch");
                return Err(ChainError::Cancelled {
                    unresolved: names(&calls, &pending),
                    results: outcome.results,
                });
            }
        }

        Ok(outcome)
    }
}

fn names(calls: &[ToolCall], indices: &[usize]) -> Vec<String> {
    indices.iter().map(|&i| calls[i].tool_name.clone()).collect()
}
