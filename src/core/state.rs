//! 会话状态定义
//!
//! 每个活跃会话恰好一个 ConversationState，只通过 ConversationStateManager 读写。
//! 每次变更 metadata.version 严格加 1 并刷新 last_updated。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::TaskContext;
use crate::memory::ConversationMessage;

/// 用户画像快照
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub fitness_level: String,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub equipment: Vec<String>,
    /// 每周训练次数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workout_frequency: Option<u32>,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            fitness_level: "beginner".to_string(),
            goals: Vec::new(),
            equipment: Vec::new(),
            workout_frequency: None,
        }
    }
}

/// 当前训练
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveWorkout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub status: String,
}

/// 领域快照（内容不透明，只读取 active_workout 生成上下文）
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkoutContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_workout: Option<ActiveWorkout>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateContext {
    pub user_profile: UserProfile,
    #[serde(default)]
    pub conversation_history: Vec<ConversationMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workout_context: Option<WorkoutContext>,
    #[serde(default)]
    pub preferences: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetadata {
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: u64,
    #[serde(default)]
    pub flags: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub session_id: String,
    pub user_id: String,
    pub context: StateContext,
    pub metadata: StateMetadata,
}

impl ConversationState {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, profile: UserProfile) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            context: StateContext {
                user_profile: profile,
                ..StateContext::default()
            },
            metadata: StateMetadata {
                created_at: now,
                last_updated: now,
                version: 1,
                flags: BTreeSet::new(),
            },
        }
    }

    /// 版本加 1 并刷新 last_updated
    pub fn touch(&mut self) {
        self.metadata.version += 1;
        self.metadata.last_updated = Utc::now();
    }
}

/// 对 StateContext 的部分更新；未设置的字段保持不变
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContextPatch {
    pub user_profile: Option<UserProfile>,
    pub conversation_history: Option<Vec<ConversationMessage>>,
    /// Some(None) 清除当前任务
    pub current_task: Option<Option<TaskContext>>,
    pub workout_context: Option<Option<WorkoutContext>>,
    /// 与已有偏好按键合并
    pub preferences: Option<Map<String, Value>>,
}

impl ContextPatch {
    pub fn profile(profile: UserProfile) -> Self {
        Self {
            user_profile: Some(profile),
            ..Self::default()
        }
    }

    pub fn history(history: Vec<ConversationMessage>) -> Self {
        Self {
            conversation_history: Some(history),
            ..Self::default()
        }
    }

    pub fn task(task: Option<TaskContext>) -> Self {
        Self {
            current_task: Some(task),
            ..Self::default()
        }
    }

    pub fn workout(workout: Option<WorkoutContext>) -> Self {
        Self {
            workout_context: Some(workout),
            ..Self::default()
        }
    }

    pub fn preferences(preferences: Map<String, Value>) -> Self {
        Self {
            preferences: Some(preferences),
            ..Self::default()
        }
    }

    pub fn apply(self, context: &mut StateContext) {
        if let Some(profile) = self.user_profile {
            context.user_profile = profile;
        }
        if let Some(history) = self.conversation_history {
            context.conversation_history = history;
        }
        if let Some(task) = self.current_task {
            context.current_task = task;
        }
        if let Some(workout) = self.workout_context {
            context.workout_context = workout;
        }
        if let Some(preferences) = self.preferences {
            context.preferences.extend(preferences);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_merges_preferences() {
        let mut ctx = StateContext::default();
        let mut a = Map::new();
        a.insert("units".into(), Value::from("kg"));
        ContextPatch::preferences(a).apply(&mut ctx);
        let mut b = Map::new();
        b.insert("language".into(), Value::from("en"));
        ContextPatch::preferences(b).apply(&mut ctx);
        assert_eq!(ctx.preferences.len(), 2);
        assert_eq!(ctx.user_profile.fitness_level, "beginner");
    }

    #[test]
    fn test_touch_bumps_version() {
        let mut s = ConversationState::new("s", "u", UserProfile::default());
        let before = s.metadata.last_updated;
        s.touch();
        assert_eq!(s.metadata.version, 2);
        assert!(s.metadata.last_updated >= before);
    }

    #[test]
    fn test_state_round_trips_camel_case() {
        let s = ConversationState::new("s1", "u1", UserProfile::default());
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["sessionId"], "s1");
        assert!(v["context"]["conversationHistory"].as_array().unwrap().is_empty());
        let back: ConversationState = serde_json::from_value(v).unwrap();
        assert_eq!(back, s);
    }
}
