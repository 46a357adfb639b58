//! Echo 工具（演示与测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolContext, ValidationResult};

/// Echo 工具：回显 text 参数
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing). Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    fn validate(&self, params: &Value) -> Option<ValidationResult> {
        let result = match params.get("text") {
            Some(Value::String(text)) if !text.trim().is_empty() => {
                ValidationResult::valid().with_sanitized(serde_json::json!({ "text": text.trim() }))
            }
            Some(Value::String(_)) => ValidationResult::invalid(vec!["text must not be empty".into()]),
            Some(_) => ValidationResult::invalid(vec!["text must be a string".into()]),
            None => ValidationResult::invalid(vec!["missing required parameter: text".into()]),
        };
        Some(result)
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value, String> {
        let text = params
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(serde_json::json!({
            "text": text,
            "sessionId": ctx.session_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_trims_and_echoes() {
        let v = EchoTool.validate(&serde_json::json!({"text": "  hi "})).unwrap();
        assert!(v.is_valid);
        let params = v.sanitized_params.unwrap();
        let out = EchoTool
            .execute(params, &ToolContext::new("s1", "u1"))
            .await
            .unwrap();
        assert_eq!(out["text"], "hi");
        assert_eq!(out["sessionId"], "s1");
    }

    #[test]
    fn test_echo_rejects_missing_text() {
        let v = EchoTool.validate(&serde_json::json!({})).unwrap();
        assert!(!v.is_valid);
        assert_eq!(v.errors.len(), 1);
    }
}
