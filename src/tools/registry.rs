//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute，可选 validate、
//! fallback、重试与熔断配置），启动时注册到 ToolRegistry，之后只读、跨会话共享。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{CircuitBreakerConfig, RetryPolicy, ToolContext, ValidationResult};

/// 工具定义：执行函数必填，其余均有默认（无校验、无降级、用运行时默认重试、不熔断）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（工具链与 ToolResult.metadata.toolName 使用）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 参数校验；None 表示未配置校验
    fn validate(&self, _params: &Value) -> Option<ValidationResult> {
        None
    }

    /// 执行工具；Err 为错误消息（用于可重试判定）
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, String>;

    /// 降级函数：重试耗尽后以原始参数与最后一次错误调用；None 表示未配置
    async fn fallback(
        &self,
        _params: Value,
        _last_error: &str,
        _ctx: &ToolContext,
    ) -> Option<Result<Value, String>> {
        None
    }

    /// 工具专属重试策略；None 时使用运行时默认
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// 熔断配置；None 时看 uses_circuit_breaker
    fn circuit_breaker_config(&self) -> Option<CircuitBreakerConfig> {
        None
    }

    /// 启用熔断但沿用运行时默认参数（[tools.circuit_breaker]）
    fn uses_circuit_breaker(&self) -> bool {
        false
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool re-registered, previous definition replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 返回 (name, description) 列表
    pub fn tool_descriptions(&self) -> Vec<(String, String)> {
        let mut list: Vec<(String, String)> = self
            .tools
            .iter()
            .map(|(name, tool)| (name.clone(), tool.description().to_string()))
            .collect();
        list.sort();
        list
    }

    /// 所有已注册工具的 schema JSON（名称、描述、参数）
    pub fn to_schema_json(&self) -> String {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        let tools: Vec<Value> = names
            .into_iter()
            .map(|name| {
                let tool = &self.tools[name];
                serde_json::json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[test]
    fn test_register_and_lookup() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        assert!(reg.contains("echo"));
        assert!(reg.get("missing").is_none());
        assert_eq!(reg.tool_names(), vec!["echo".to_string()]);
        let schema: Value = serde_json::from_str(&reg.to_schema_json()).unwrap();
        assert_eq!(schema[0]["name"], "echo");
        assert_eq!(schema[0]["parameters"]["required"][0], "text");
    }
}
