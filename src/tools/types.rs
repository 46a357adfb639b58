//! 工具调用的结果、错误与上下文类型
//!
//! 工具失败不是 Rust 错误而是数据：执行器总是返回结构化的 ToolResult，
//! 由上层对话逻辑决定转述给用户、改用降级数据还是请用户改写请求。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::UserProfile;

/// 错误分类（决定是否重试、是否走降级）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorCategory {
    /// 参数错误或未知工具，从不重试
    Validation,
    /// 工具本身抛错：按策略重试，之后降级
    Execution,
    /// 超出截止时间，按可重试的执行失败处理
    Timeout,
    /// 依赖被判定为不健康，未实际调用即拒绝
    CircuitBreaker,
    Unknown,
}

/// 结构化工具错误
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    pub recoverable: bool,
    pub suggested_action: String,
    pub category: ToolErrorCategory,
}

impl ToolError {
    pub fn new(
        category: ToolErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Value::Null,
            recoverable: false,
            suggested_action: String::new(),
            category,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_suggested_action(mut self, action: impl Into<String>) -> Self {
        self.suggested_action = action.into();
        self
    }
}

/// 结果元数据：工具名、耗时、重试次数、时间戳、置信度（降级结果会调低）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMetadata {
    pub tool_name: String,
    /// 毫秒
    pub execution_time: u64,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// 单次工具调用的最终结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub metadata: ToolResultMetadata,
}

impl ToolResult {
    pub fn ok(data: Value, metadata: ToolResultMetadata) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            metadata,
        }
    }

    pub fn failed(error: ToolError, metadata: ToolResultMetadata) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            metadata,
        }
    }

    /// 错误分类（成功时为 None）
    pub fn category(&self) -> Option<ToolErrorCategory> {
        self.error.as_ref().map(|e| e.category)
    }
}

/// 参数校验结果；sanitized_params 存在时以其替代原始参数执行
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanitized_params: Option<Value>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            ..Self::default()
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
            ..Self::default()
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_sanitized(mut self, params: Value) -> Self {
        self.sanitized_params = Some(params);
        self
    }
}

/// 传给工具实现的调用上下文
#[derive(Clone, Debug, Default)]
pub struct ToolContext {
    pub session_id: String,
    pub user_id: String,
    pub task_id: Option<String>,
    pub step_id: Option<String>,
    /// 序列化后的对话上下文（见 ConversationStateManager::get_context_for_ai）
    pub conversation_context: String,
    pub user_profile: Option<UserProfile>,
    /// 当前工具链中已产生的结果（按工具名）
    pub previous_results: HashMap<String, ToolResult>,
    /// 调用方取消（如用户离开页面）
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_conversation_context(mut self, text: impl Into<String>) -> Self {
        self.conversation_context = text.into();
        self
    }

    pub fn with_profile(mut self, profile: UserProfile) -> Self {
        self.user_profile = Some(profile);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
