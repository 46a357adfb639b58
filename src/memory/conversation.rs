//! 对话历史
//!
//! 只追加、有上限（默认 50 条）的消息序列，超出时丢弃最旧的消息；
//! 由 ConversationStateManager 写入，供 AI 上下文与持久化使用。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 历史消息上限
pub const MAX_HISTORY: usize = 50;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// 消息来源
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    UserInput,
    AiResponse,
    ToolResult,
    SystemMessage,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub source: MessageSource,
}

impl MessageMetadata {
    pub fn from_source(source: MessageSource) -> Self {
        Self {
            task_id: None,
            tool_calls: None,
            confidence: None,
            source,
        }
    }
}

/// 单条对话消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: MessageMetadata,
}

/// 待追加的消息（id 与时间戳由状态管理器生成）
#[derive(Clone, Debug, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub metadata: MessageMetadata,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            metadata: MessageMetadata::from_source(MessageSource::UserInput),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            metadata: MessageMetadata::from_source(MessageSource::AiResponse),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            metadata: MessageMetadata::from_source(MessageSource::SystemMessage),
        }
    }

    /// 工具结果消息（以 assistant 角色记入历史）
    pub fn tool_result(tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        let mut metadata = MessageMetadata::from_source(MessageSource::ToolResult);
        metadata.tool_calls = Some(vec![tool_name.into()]);
        Self {
            role: Role::Assistant,
            content: content.into(),
            metadata,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.metadata.task_id = Some(task_id.into());
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.metadata.confidence = Some(confidence);
        self
    }

    /// 生成 id（时间 + 随机）并盖时间戳
    pub fn into_message(self) -> ConversationMessage {
        let now = Utc::now();
        let random = uuid::Uuid::new_v4().simple().to_string();
        ConversationMessage {
            id: format!("msg_{}_{}", now.timestamp_millis(), &random[..9]),
            role: self.role,
            content: self.content,
            timestamp: now,
            metadata: self.metadata,
        }
    }
}

/// 追加消息并只保留最近 max 条
pub fn push_bounded(history: &mut Vec<ConversationMessage>, msg: ConversationMessage, max: usize) {
    history.push(msg);
    prune(history, max);
}

/// 超出 max 时丢弃最旧的消息
pub fn prune(history: &mut Vec<ConversationMessage>, max: usize) {
    if history.len() > max {
        let excess = history.len() - max;
        history.drain(..excess);
    }
}

/// 最近 n 条消息，格式为 `role: content` 每行一条
pub fn recent_lines(history: &[ConversationMessage], n: usize) -> Vec<String> {
    let start = history.len().saturating_sub(n);
    history[start..]
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str(), m.content))
        .collect()
}
