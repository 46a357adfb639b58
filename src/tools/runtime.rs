//! 工具运行时：注册表 + 每工具熔断器 + 每工具统计 + 默认重试/超时
//!
//! 进程启动时构建一次，以 Arc 共享给所有执行器与会话。注册表只读；熔断器与统计跨会话读写，
//! 某个工具熔断会影响所有会话对它的调用（失败的是依赖本身，而不是会话）。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::ToolsSection;
use crate::tools::{
    CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, RetryPolicy, Tool, ToolMetrics,
    ToolRegistry,
};

/// 熔断拒绝时的信息
#[derive(Clone, Debug)]
pub struct CircuitRejection {
    pub snapshot: CircuitSnapshot,
}

pub struct ToolRuntime {
    registry: ToolRegistry,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    metrics: Mutex<HashMap<String, ToolMetrics>>,
    default_retry: RetryPolicy,
    default_breaker: CircuitBreakerConfig,
    timeout: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ToolRuntime {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            breakers: Mutex::new(HashMap::new()),
            metrics: Mutex::new(HashMap::new()),
            default_retry: RetryPolicy::default(),
            default_breaker: CircuitBreakerConfig::default(),
            timeout: Duration::from_secs(30),
        }
    }

    /// 按 [tools] 配置设置默认重试、默认熔断参数与超时
    pub fn from_config(registry: ToolRegistry, cfg: &ToolsSection) -> Self {
        Self::new(registry)
            .with_default_retry(cfg.retry.to_policy())
            .with_default_breaker(cfg.circuit_breaker.to_config())
            .with_timeout(Duration::from_secs(cfg.timeout_secs))
    }

    /// 声明 uses_circuit_breaker 但未自带参数的工具使用的熔断参数
    pub fn with_default_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.default_breaker = config;
        self
    }

    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 工具自身的重试策略，未配置时用默认
    pub fn retry_policy_for(&self, tool: &dyn Tool) -> RetryPolicy {
        tool.retry_policy().unwrap_or_else(|| self.default_retry.clone())
    }

    /// 工具的熔断参数：自带参数优先，其次（声明启用时）用运行时默认；None 表示不熔断
    pub fn breaker_config_for(&self, tool: &dyn Tool) -> Option<CircuitBreakerConfig> {
        tool.circuit_breaker_config().or_else(|| {
            tool.uses_circuit_breaker()
                .then(|| self.default_breaker.clone())
        })
    }

    /// 熔断检查：未配置熔断的工具总是放行；首次调用时惰性创建熔断器
    pub fn check_circuit(
        &self,
        tool_name: &str,
        config: Option<CircuitBreakerConfig>,
    ) -> Result<(), CircuitRejection> {
        let Some(config) = config else {
            return Ok(());
        };
        let mut breakers = lock(&self.breakers);
        let breaker = breakers
            .entry(tool_name.to_string())
            .or_insert_with(|| CircuitBreaker::new(config));
        if breaker.allow_request() {
            Ok(())
        } else {
            Err(CircuitRejection {
                snapshot: breaker.snapshot(),
            })
        }
    }

    pub fn record_call(&self, tool_name: &str) {
        lock(&self.metrics)
            .entry(tool_name.to_string())
            .or_default()
            .record_call();
    }

    pub fn record_success(&self, tool_name: &str, elapsed: Duration) {
        lock(&self.metrics)
            .entry(tool_name.to_string())
            .or_default()
            .record_success(elapsed);
        if let Some(breaker) = lock(&self.breakers).get_mut(tool_name) {
            breaker.record_success();
        }
    }

    pub fn record_failure(&self, tool_name: &str, elapsed: Duration, error: &str) {
        lock(&self.metrics)
            .entry(tool_name.to_string())
            .or_default()
            .record_failure(elapsed, error);
        if let Some(breaker) = lock(&self.breakers).get_mut(tool_name) {
            breaker.record_failure();
        }
    }

    /// 半开试探没有给出结果（被取消）时释放试探名额
    pub fn release_trial(&self, tool_name: &str) {
        if let Some(breaker) = lock(&self.breakers).get_mut(tool_name) {
            breaker.release_trial();
        }
    }

    pub fn record_fallback(&self, tool_name: &str) {
        lock(&self.metrics)
            .entry(tool_name.to_string())
            .or_default()
            .record_fallback();
    }

    pub fn metrics(&self, tool_name: &str) -> Option<ToolMetrics> {
        lock(&self.metrics).get(tool_name).cloned()
    }

    /// 所有工具统计（按名称排序）
    pub fn all_metrics(&self) -> BTreeMap<String, ToolMetrics> {
        lock(&self.metrics)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn circuit_snapshot(&self, tool_name: &str) -> Option<CircuitSnapshot> {
        lock(&self.breakers).get(tool_name).map(|b| b.snapshot())
    }

    /// 手动闭合熔断器；工具从未创建熔断器时返回 false
    pub fn reset_circuit_breaker(&self, tool_name: &str) -> bool {
        match lock(&self.breakers).get_mut(tool_name) {
            Some(breaker) => {
                breaker.reset();
                tracing::info!(tool = %tool_name, "circuit breaker reset manually");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{CircuitState, EchoTool};

    #[test]
    fn test_breaker_created_lazily_and_trips() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        let rt = ToolRuntime::new(reg);
        let cfg = CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        };
        assert!(rt.circuit_snapshot("echo").is_none());
        assert!(rt.check_circuit("echo", Some(cfg.clone())).is_ok());
        rt.record_failure("echo", Duration::from_millis(1), "boom");
        rt.record_failure("echo", Duration::from_millis(1), "boom");
        let rejection = rt.check_circuit("echo", Some(cfg)).unwrap_err();
        assert_eq!(rejection.snapshot.state, CircuitState::Open);
        assert!(rt.reset_circuit_breaker("echo"));
        assert_eq!(rt.circuit_snapshot("echo").unwrap().state, CircuitState::Closed);
        assert_eq!(rt.metrics("echo").unwrap().failed_calls, 2);
    }

    struct OptIn;

    #[async_trait::async_trait]
    impl Tool for OptIn {
        fn name(&self) -> &str {
            "opt_in"
        }

        fn description(&self) -> &str {
            "uses the runtime breaker"
        }

        async fn execute(&self, _params: serde_json::Value, _ctx: &crate::tools::ToolContext) -> Result<serde_json::Value, String> {
            Ok(serde_json::Value::Null)
        }

        fn uses_circuit_breaker(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_breaker_config_comes_from_tools_section() {
        let mut section = crate::config::ToolsSection::default();
        section.circuit_breaker.failure_threshold = 2;
        section.circuit_breaker.reset_timeout_secs = 7;
        let rt = ToolRuntime::from_config(ToolRegistry::new(), &section);

        let cfg = rt.breaker_config_for(&OptIn).unwrap();
        assert_eq!(cfg.failure_threshold, 2);
        assert_eq!(cfg.reset_timeout, Duration::from_secs(7));
        assert!(rt.breaker_config_for(&EchoTool).is_none());
    }

    #[test]
    fn test_unconfigured_breaker_always_allows() {
        let rt = ToolRuntime::new(ToolRegistry::new());
        for _ in 0..10 {
            rt.record_failure("x", Duration::ZERO, "err");
        }
        assert!(rt.check_circuit("x", None).is_ok());
        assert!(!rt.reset_circuit_breaker("x"));
    }
}
