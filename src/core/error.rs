//! 错误类型
//!
//! StateManagerError 表示调用方的编程错误（未初始化、无活动任务、未知步骤等），不重试；
//! StorageError 来自存储适配器；ChainError 为工具链无法全部完成时的显式结果。
//! 工具本身的失败不在此列：它们是 ToolResult 中的数据。

use std::collections::HashMap;

use thiserror::Error;

use crate::core::StepStatus;
use crate::tools::ToolResult;

/// 存储适配器错误
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// 会话状态管理器错误
#[derive(Error, Debug)]
pub enum StateManagerError {
    #[error("Session {0} is not initialized")]
    NotInitialized(String),

    #[error("Session {0} has no active task")]
    NoActiveTask(String),

    #[error("Step {step_id} not found in current task of session {session_id}")]
    StepNotFound { session_id: String, step_id: String },

    #[error("Invalid step transition for {step_id}: {from:?} -> {to:?}")]
    InvalidStepTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Retry budget exhausted for step {step_id} (max {max_retries})")]
    RetryBudgetExhausted { step_id: String, max_retries: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// 工具链未能全部执行
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Tool chain deadlock, unresolved calls: {unresolved:?}")]
    Deadlock {
        unresolved: Vec<String>,
        results: HashMap<String, ToolResult>,
    },

    #[error("Tool chain cancelled, unresolved calls: {unresolved:?}")]
    Cancelled {
        unresolved: Vec<String>,
        results: HashMap<String, ToolResult>,
    },
}

impl ChainError {
    pub fn unresolved(&self) -> &[String] {
        match self {
            ChainError::Deadlock { unresolved, .. } | ChainError::Cancelled { unresolved, .. } => {
                unresolved
            }
        }
    }

    pub fn results(&self) -> &HashMap<String, ToolResult> {
        match self {
            ChainError::Deadlock { results, .. } | ChainError::Cancelled { results, .. } => results,
        }
    }

    /// 取出已完成的部分结果
    pub fn into_results(self) -> HashMap<String, ToolResult> {
        match self {
            ChainError::Deadlock { results, .. } | ChainError::Cancelled { results, .. } => results,
        }
    }
}
