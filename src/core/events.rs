//! 会话状态生命周期事件：经 broadcast 通道发给进程内订阅者（无外部传输）

use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::{StepStatus, TaskStatus, TaskType};

/// 状态变更事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// 会话状态已加载或新建
    StateInitialized {
        session_id: String,
        user_id: String,
        version: u64,
        restored: bool,
    },
    /// 任意一次状态变更
    StateUpdated { session_id: String, version: u64 },
    TaskStarted {
        session_id: String,
        task_id: String,
        task_type: TaskType,
        steps: usize,
    },
    TaskStepUpdated {
        session_id: String,
        task_id: String,
        step_id: String,
        status: StepStatus,
        task_status: TaskStatus,
    },
    TaskCompleted { session_id: String, task_id: String },
    TaskFailed {
        session_id: String,
        task_id: String,
        error: String,
    },
    /// 会话状态已删除
    StateDeleted { session_id: String },
}

impl StateEvent {
    pub fn session_id(&self) -> &str {
        match self {
            StateEvent::StateInitialized { session_id, .. }
            | StateEvent::StateUpdated { session_id, .. }
            | StateEvent::TaskStarted { session_id, .. }
            | StateEvent::TaskStepUpdated { session_id, .. }
            | StateEvent::TaskCompleted { session_id, .. }
            | StateEvent::TaskFailed { session_id, .. }
            | StateEvent::StateDeleted { session_id } => session_id,
        }
    }
}

/// 事件总线：无订阅者时发送不算错误
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StateEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: StateEvent) {
        tracing::debug!(event = ?event, "state event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
