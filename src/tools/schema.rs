//! 工具链调用 JSON Schema 生成（schemars）
//!
//! 用于向调用方（或 system prompt）描述合法的工具链条目格式。

use schemars::schema_for;

use crate::tools::ToolCall;

/// 返回单个工具链条目（ToolCall）的 JSON Schema 字符串
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCall);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

/// 返回整条工具链（ToolCall 数组）的 JSON Schema 字符串
pub fn tool_chain_schema_json() -> String {
    let schema = schema_for!(Vec<ToolCall>);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}
