//! 工具执行器
//!
//! execute_tool 依次：查找工具 → 参数校验 → 熔断检查 → 超时内执行 → 按策略退避重试
//! → 重试耗尽后降级 → 最终失败。任何情况下都返回结构化 ToolResult，不向调用方抛错；
//! 每次调用输出一条结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};

use crate::tools::{
    ToolContext, ToolError, ToolErrorCategory, ToolResult, ToolResultMetadata, ToolRuntime,
};

/// 降级结果的置信度
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

/// 单次尝试的结果
enum Attempt {
    Ok(Value),
    Failed {
        message: String,
        category: ToolErrorCategory,
    },
    Cancelled,
}

/// 工具执行器：持有共享的 ToolRuntime
#[derive(Clone)]
pub struct ToolExecutor {
    runtime: Arc<ToolRuntime>,
}

impl ToolExecutor {
    pub fn new(runtime: Arc<ToolRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<ToolRuntime> {
        &self.runtime
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.runtime.registry().tool_names()
    }

    /// 执行指定工具；返回值总是完整的 ToolResult（成功、降级成功或结构化失败）
    pub async fn execute_tool(&self, tool_name: &str, params: Value, ctx: &ToolContext) -> ToolResult {
        let start = Instant::now();
        let preview = args_preview(&params);

        let Some(tool) = self.runtime.registry().get(tool_name) else {
            audit(tool_name, false, "not_found", 0, start, &preview);
            let error = ToolError::new(
                ToolErrorCategory::Validation,
                "TOOL_NOT_FOUND",
                format!("Unknown tool: {tool_name}"),
            )
            .with_details(json!({ "available": self.runtime.registry().tool_names() }))
            .with_suggested_action("Use one of the registered tools");
            return ToolResult::failed(error, metadata(tool_name, start, 0, None));
        };
        self.runtime.record_call(tool_name);

        let mut params = params;
        if let Some(validation) = tool.validate(&params) {
            if !validation.is_valid {
                audit(tool_name, false, "invalid", 0, start, &preview);
                let error = ToolError::new(
                    ToolErrorCategory::Validation,
                    "VALIDATION_FAILED",
                    format!("Invalid parameters for {tool_name}: {}", validation.errors.join("; ")),
                )
                .with_details(json!({
                    "errors": validation.errors,
                    "warnings": validation.warnings,
                }))
                .with_suggested_action("Check the parameters or rephrase the request");
                return ToolResult::failed(error, metadata(tool_name, start, 0, None));
            }
            if !validation.warnings.is_empty() {
                tracing::debug!(tool = %tool_name, warnings = ?validation.warnings, "validation warnings");
            }
            if let Some(sanitized) = validation.sanitized_params {
                params = sanitized;
            }
        }

        if let Err(rejection) = self
            .runtime
            .check_circuit(tool_name, self.runtime.breaker_config_for(tool.as_ref()))
        {
            audit(tool_name, false, "circuit_open", 0, start, &preview);
            let snapshot = rejection.snapshot;
            let error = ToolError::new(
                ToolErrorCategory::CircuitBreaker,
                "CIRCUIT_BREAKER_OPEN",
                format!("Tool {tool_name} is temporarily unavailable"),
            )
            .with_details(json!({
                "state": snapshot.state,
                "failures": snapshot.failures,
                "nextRetryTime": snapshot.next_retry_time.map(|t| t.to_rfc3339()),
            }))
            .recoverable(true)
            .with_suggested_action("Wait for the service to recover and try again later");
            return ToolResult::failed(error, metadata(tool_name, start, 0, None));
        }

        let policy = self.runtime.retry_policy_for(tool.as_ref());
        let limit = self.runtime.timeout();
        let mut attempt: u32 = 0;
        let (last_error, last_category) = loop {
            let attempt_start = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Attempt::Cancelled,
                r = timeout(limit, tool.execute(params.clone(), ctx)) => match r {
                    Ok(Ok(data)) => Attempt::Ok(data),
                    Ok(Err(message)) => Attempt::Failed { message, category: ToolErrorCategory::Execution },
                    Err(_) => Attempt::Failed {
                        message: format!("Tool execution timeout after {}ms", limit.as_millis()),
                        category: ToolErrorCategory::Timeout,
                    },
                },
            };

            match outcome {
                Attempt::Ok(data) => {
                    self.runtime.record_success(tool_name, attempt_start.elapsed());
                    audit(tool_name, true, "ok", attempt + 1, start, &preview);
                    return ToolResult::ok(data, metadata(tool_name, start, attempt, None));
                }
                Attempt::Cancelled => {
                    self.runtime.release_trial(tool_name);
                    audit(tool_name, false, "cancelled", attempt + 1, start, &preview);
                    return cancelled(tool_name, start, attempt);
                }
                Attempt::Failed { message, category } => {
                    self.runtime
                        .record_failure(tool_name, attempt_start.elapsed(), &message);
                    if policy.should_retry(attempt, &message) {
                        let delay = policy.delay_for_attempt(attempt);
                        tracing::warn!(
                            tool = %tool_name,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %message,
                            "tool attempt failed, retrying"
                        );
                        tokio::select! {
                            biased;
                            _ = ctx.cancel.cancelled() => {
                                self.runtime.release_trial(tool_name);
                                audit(tool_name, false, "cancelled", attempt + 1, start, &preview);
                                return cancelled(tool_name, start, attempt);
                            }
                            _ = sleep(delay) => {}
                        }
                        attempt += 1;
                        continue;
                    }
                    break (message, category);
                }
            }
        };

        if let Some(data) = self.run_fallback(tool.as_ref(), params, &last_error, ctx, limit).await {
            self.runtime.record_fallback(tool_name);
            audit(tool_name, true, "fallback", attempt + 1, start, &preview);
            let fallback_name = format!("{tool_name}_fallback");
            return ToolResult::ok(
                data,
                metadata(&fallback_name, start, attempt, Some(FALLBACK_CONFIDENCE)),
            );
        }

        audit(tool_name, false, "error", attempt + 1, start, &preview);
        let error = ToolError::new(
            ToolErrorCategory::Execution,
            "EXECUTION_FAILED",
            format!("Tool {tool_name} failed after {} attempt(s): {last_error}", attempt + 1),
        )
        .with_details(json!({
            "originalError": last_error,
            "attempts": attempt + 1,
            "lastErrorCategory": last_category,
        }))
        .with_suggested_action("Try again later or rephrase the request");
        ToolResult::failed(error, metadata(tool_name, start, attempt, None))
    }

    /// 调用降级函数；未配置、失败或超时均返回 None（失败只记日志）
    async fn run_fallback(
        &self,
        tool: &dyn crate::tools::Tool,
        params: Value,
        last_error: &str,
        ctx: &ToolContext,
        limit: Duration,
    ) -> Option<Value> {
        match timeout(limit, tool.fallback(params, last_error, ctx)).await {
            Ok(None) => None,
            Ok(Some(Ok(data))) => Some(data),
            Ok(Some(Err(e))) => {
                tracing::warn!(tool = %tool.name(), error = %e, "fallback failed");
                None
            }
            Err(_) => {
                tracing::warn!(tool = %tool.name(), "fallback timed out");
                None
            }
        }
    }
}

fn metadata(tool_name: &str, start: Instant, retry_count: u32, confidence: Option<f64>) -> ToolResultMetadata {
    ToolResultMetadata {
        tool_name: tool_name.to_string(),
        execution_time: start.elapsed().as_millis() as u64,
        retry_count,
        timestamp: Utc::now(),
        confidence,
    }
}

fn cancelled(tool_name: &str, start: Instant, attempt: u32) -> ToolResult {
    let error = ToolError::new(
        ToolErrorCategory::Unknown,
        "CANCELLED",
        format!("Tool {tool_name} was cancelled by the caller"),
    )
    .recoverable(true)
    .with_suggested_action("Resubmit the request if it is still needed");
    ToolResult::failed(error, metadata(tool_name, start, attempt, None))
}

fn audit(tool_name: &str, ok: bool, outcome: &str, attempts: u32, start: Instant, args_preview: &str) {
    let audit = json!({
        "event": "tool_audit",
        "tool": tool_name,
        "ok": ok,
        "outcome": outcome,
        "attempts": attempts,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
