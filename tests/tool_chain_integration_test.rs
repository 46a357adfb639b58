//! 工具执行与工具链集成测试

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use spotter::core::ChainError;
use spotter::tools::{
    CircuitBreakerConfig, RetryPolicy, Tool, ToolCall, ToolChainExecutor, ToolContext,
    ToolErrorCategory, ToolExecutor, ToolRegistry, ToolRuntime, FALLBACK_CONFIDENCE,
};

/// 总是抛出临时错误、带降级的 echo
struct FlakyEcho {
    calls: AtomicUsize,
}

#[async_trait]
impl Tool for FlakyEcho {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "always fails with a temporary error"
    }

    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("temporary failure".to_string())
    }

    async fn fallback(&self, _params: Value, _err: &str, _ctx: &ToolContext) -> Option<Result<Value, String>> {
        Some(Ok(json!({ "value": "fallback" })))
    }

    fn retry_policy(&self) -> Option<RetryPolicy> {
        Some(
            RetryPolicy::default()
                .with_max_retries(2)
                .with_delays(Duration::from_millis(5), Duration::from_millis(20)),
        )
    }
}

/// 回显参数中的 step 字段，并记录看到的前序结果
struct Step {
    name: &'static str,
}

#[async_trait]
impl Tool for Step {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "chain step"
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value, String> {
        let mut seen: Vec<&String> = ctx.previous_results.keys().collect();
        seen.sort();
        Ok(json!({ "step": self.name, "seen": seen }))
    }
}

/// 不可重试的失败，启用熔断
struct Broken;

#[async_trait]
impl Tool for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn description(&self) -> &str {
        "always fails"
    }

    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<Value, String> {
        Err("invalid input".to_string())
    }

    fn circuit_breaker_config(&self) -> Option<CircuitBreakerConfig> {
        Some(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        })
    }
}

fn executor(registry: ToolRegistry) -> ToolExecutor {
    ToolExecutor::new(Arc::new(ToolRuntime::new(registry)))
}

#[tokio::test]
async fn test_fallback_after_retries_exhausted() {
    let flaky = Arc::new(FlakyEcho {
        calls: AtomicUsize::new(0),
    });
    let mut registry = ToolRegistry::new();
    registry.register_arc(flaky.clone());
    let exec = executor(registry);

    let result = exec
        .execute_tool("echo", json!({}), &ToolContext::new("s1", "u1"))
        .await;

    assert!(result.success);
    assert_eq!(result.data.as_ref().unwrap()["value"], "fallback");
    assert_eq!(result.metadata.tool_name, "echo_fallback");
    assert_eq!(result.metadata.confidence, Some(FALLBACK_CONFIDENCE));
    assert_eq!(result.metadata.retry_count, 2);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);

    let metrics = exec.runtime().metrics("echo").unwrap();
    assert_eq!(metrics.fallback_calls, 1);
}

#[tokio::test]
async fn test_chain_runs_in_dependency_order() {
    let mut registry = ToolRegistry::new();
    registry.register(Step { name: "a" });
    registry.register(Step { name: "b" });
    registry.register(Step { name: "c" });
    let chain = ToolChainExecutor::new(executor(registry));

    let calls = vec![
        ToolCall::new("c", json!({})).depends_on("b"),
        ToolCall::new("a", json!({})),
        ToolCall::new("b", json!({})).depends_on("a"),
    ];
    let outcome = chain
        .execute_tool_chain(calls, &ToolContext::new("s1", "u1"))
        .await
        .unwrap();

    assert_eq!(
        outcome.batches,
        vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
    );
    assert_eq!(outcome.results["c"].data.as_ref().unwrap()["seen"], json!(["a", "b"]));
    assert!(outcome.results.values().all(|r| r.success));
}

#[tokio::test]
async fn test_chain_reports_deadlock_with_partial_results() {
    let mut registry = ToolRegistry::new();
    registry.register(Broken);
    registry.register(Step { name: "after" });
    let chain = ToolChainExecutor::new(executor(registry));

    let calls = vec![
        ToolCall::new("broken", json!({})),
        ToolCall::new("after", json!({})).depends_on("broken"),
    ];
    let err = chain
        .execute_tool_chain(calls, &ToolContext::new("s1", "u1"))
        .await
        .unwrap_err();

    assert!(matches!(err, ChainError::Deadlock { .. }));
    assert_eq!(err.unresolved(), ["after".to_string()]);
    assert!(!err.results()["broken"].success);
}

#[tokio::test]
async fn test_circuit_opens_after_threshold() {
    let mut registry = ToolRegistry::new();
    registry.register(Broken);
    let exec = executor(registry);
    let ctx = ToolContext::new("s1", "u1");

    for _ in 0..2 {
        let r = exec.execute_tool("broken", json!({}), &ctx).await;
        assert_eq!(r.error.unwrap().code, "EXECUTION_FAILED");
    }
    let r = exec.execute_tool("broken", json!({}), &ctx).await;
    let err = r.error.unwrap();
    assert_eq!(err.code, "CIRCUIT_BREAKER_OPEN");
    assert_eq!(err.category, ToolErrorCategory::CircuitBreaker);
    assert!(err.recoverable);

    assert!(exec.runtime().reset_circuit_breaker("broken"));
    let r = exec.execute_tool("broken", json!({}), &ctx).await;
    assert_eq!(r.error.unwrap().code, "EXECUTION_FAILED");
}
