//! 会话状态管理器
//!
//! 每个会话一个 ConversationState：用户画像、有上限的对话历史、至多一个活动任务、领域快照与偏好。
//! 存储适配器是权威来源，进程内 map 只做读缓存：每次变更前重新加载，若存储中的版本更新则以其为准。
//! 同一会话的变更经 SessionSupervisor 的会话锁串行，每次变更 version 加 1、写回存储并发出事件。
//! 未初始化的会话不会被自动初始化，直接返回 StateManagerError。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::config::StateSection;
use crate::core::{
    ContextPatch, ConversationState, EventBus, SessionSupervisor, StateEvent, StateManagerError,
    StepPatch, StepSpec, StepUpdateError, TaskContext, TaskStatus, TaskStep, TaskType,
};
use crate::memory::conversation::{prune, push_bounded, recent_lines};
use crate::memory::{ConversationMessage, NewMessage, ProfileLoader, StateStorageAdapter};

/// 迁移修复过的状态打此标记
pub const MIGRATED_FLAG: &str = "migrated";

#[derive(Debug, Clone)]
pub struct StateManagerConfig {
    pub max_history: usize,
    /// get_context_for_ai 取最近几条消息
    pub context_messages: usize,
    pub task_max_retries: u32,
    pub event_capacity: usize,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self::from(&StateSection::default())
    }
}

impl From<&StateSection> for StateManagerConfig {
    fn from(s: &StateSection) -> Self {
        Self {
            max_history: s.max_history,
            context_messages: s.context_messages,
            task_max_retries: s.task_max_retries,
            event_capacity: s.event_capacity,
        }
    }
}

pub struct ConversationStateManager {
    storage: Arc<dyn StateStorageAdapter>,
    profiles: Arc<dyn ProfileLoader>,
    cache: RwLock<HashMap<String, ConversationState>>,
    supervisor: Arc<SessionSupervisor>,
    events: EventBus,
    config: StateManagerConfig,
}

impl ConversationStateManager {
    pub fn new(
        storage: Arc<dyn StateStorageAdapter>,
        profiles: Arc<dyn ProfileLoader>,
        config: StateManagerConfig,
    ) -> Self {
        Self {
            storage,
            profiles,
            cache: RwLock::new(HashMap::new()),
            supervisor: Arc::new(SessionSupervisor::new()),
            events: EventBus::new(config.event_capacity),
            config,
        }
    }

    /// 与其他组件共享同一个会话监管（锁与取消令牌）
    pub fn with_supervisor(mut self, supervisor: Arc<SessionSupervisor>) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn supervisor(&self) -> &Arc<SessionSupervisor> {
        &self.supervisor
    }

    pub fn config(&self) -> &StateManagerConfig {
        &self.config
    }

    /// 订阅生命周期事件
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// 加载已持久化的状态，否则以加载到的（或默认）画像新建；校验/迁移后缓存并写回
    pub async fn initialize_state(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<ConversationState, StateManagerError> {
        let _guard = self.supervisor.acquire(session_id).await;

        let (mut state, restored) = match self.storage.load_state(session_id).await? {
            Some(state) => (state, true),
            None => {
                let profile = self
                    .profiles
                    .load_profile(user_id)
                    .await?
                    .unwrap_or_default();
                (ConversationState::new(session_id, user_id, profile), false)
            }
        };

        let repaired = self.validate_state(&mut state, session_id, user_id);
        if !restored || repaired {
            self.storage.save_state(&state).await?;
        }
        self.cache
            .write()
            .await
            .insert(session_id.to_string(), state.clone());

        tracing::info!(
            session_id = %session_id,
            user_id = %user_id,
            version = state.metadata.version,
            restored,
            repaired,
            "session state initialized"
        );
        self.events.emit(StateEvent::StateInitialized {
            session_id: session_id.to_string(),
            user_id: state.user_id.clone(),
            version: state.metadata.version,
            restored,
        });
        Ok(state)
    }

    /// 合并部分上下文、版本加 1、写回存储并发出 state_updated
    pub async fn update_state(
        &self,
        session_id: &str,
        patch: ContextPatch,
    ) -> Result<ConversationState, StateManagerError> {
        let (state, ()) = self
            .mutate(session_id, |state| {
                patch.apply(&mut state.context);
                Ok(())
            })
            .await?;
        Ok(state)
    }

    /// 追加消息（生成 id），历史只保留最近 max_history 条
    pub async fn add_message(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> Result<ConversationMessage, StateManagerError> {
        let message = message.into_message();
        let max = self.config.max_history;
        let stored = message.clone();
        self.mutate(session_id, move |state| {
            push_bounded(&mut state.context.conversation_history, message, max);
            Ok(())
        })
        .await?;
        Ok(stored)
    }

    /// 新建任务并设为当前任务（替换之前的任务）
    pub async fn start_task(
        &self,
        session_id: &str,
        task_type: TaskType,
        steps: Vec<StepSpec>,
    ) -> Result<TaskContext, StateManagerError> {
        let task = TaskContext::new(task_type, steps, self.config.task_max_retries);
        let installed = task.clone();
        let (_, superseded) = self
            .mutate(session_id, move |state| {
                Ok(state
                    .context
                    .current_task
                    .replace(installed)
                    .map(|t| t.task_id))
            })
            .await?;

        if let Some(previous) = superseded {
            tracing::debug!(session_id = %session_id, previous = %previous, "previous task superseded");
        }
        tracing::info!(
            session_id = %session_id,
            task_id = %task.task_id,
            task_type = task.task_type.as_str(),
            steps = task.steps.len(),
            "task started"
        );
        self.events.emit(StateEvent::TaskStarted {
            session_id: session_id.to_string(),
            task_id: task.task_id.clone(),
            task_type,
            steps: task.steps.len(),
        });
        Ok(task)
    }

    /// 更新当前任务中的一个步骤；completed 时盖 completed_at
    pub async fn update_task_step(
        &self,
        session_id: &str,
        step_id: &str,
        patch: StepPatch,
    ) -> Result<TaskStep, StateManagerError> {
        let (_, (step, task_id, before, after, task_error)) = self
            .mutate(session_id, |state| {
                let task = state
                    .context
                    .current_task
                    .as_mut()
                    .ok_or_else(|| StateManagerError::NoActiveTask(session_id.to_string()))?;
                let before = task.status;
                let step = task
                    .apply_step_patch(step_id, patch)
                    .map_err(|e| step_error(session_id, step_id, e))?;
                Ok((step, task.task_id.clone(), before, task.status, task.error.clone()))
            })
            .await?;

        tracing::debug!(
            session_id = %session_id,
            step_id = %step_id,
            status = ?step.status,
            task_status = after.as_str(),
            "task step updated"
        );
        self.events.emit(StateEvent::TaskStepUpdated {
            session_id: session_id.to_string(),
            task_id: task_id.clone(),
            step_id: step_id.to_string(),
            status: step.status,
            task_status: after,
        });
        if before != after {
            self.emit_task_outcome(session_id, &task_id, after, task_error);
        }
        Ok(step)
    }

    /// 显式完成当前任务（未结束的步骤记为 skipped）
    pub async fn complete_task(&self, session_id: &str) -> Result<TaskContext, StateManagerError> {
        let (_, task) = self
            .mutate(session_id, |state| {
                let task = state
                    .context
                    .current_task
                    .as_mut()
                    .ok_or_else(|| StateManagerError::NoActiveTask(session_id.to_string()))?;
                task.complete();
                Ok(task.clone())
            })
            .await?;
        self.emit_task_outcome(session_id, &task.task_id, task.status, None);
        Ok(task)
    }

    /// 显式标记当前任务失败
    pub async fn fail_task(
        &self,
        session_id: &str,
        error: impl Into<String>,
    ) -> Result<TaskContext, StateManagerError> {
        let error = error.into();
        let (_, task) = self
            .mutate(session_id, |state| {
                let task = state
                    .context
                    .current_task
                    .as_mut()
                    .ok_or_else(|| StateManagerError::NoActiveTask(session_id.to_string()))?;
                task.fail(error);
                Ok(task.clone())
            })
            .await?;
        self.emit_task_outcome(session_id, &task.task_id, task.status, task.error.clone());
        Ok(task)
    }

    /// 清除当前任务，返回被清除的任务
    pub async fn clear_task(&self, session_id: &str) -> Result<Option<TaskContext>, StateManagerError> {
        let (_, task) = self
            .mutate(session_id, |state| Ok(state.context.current_task.take()))
            .await?;
        Ok(task)
    }

    /// 添加元数据标记
    pub async fn set_flag(
        &self,
        session_id: &str,
        flag: impl Into<String>,
    ) -> Result<ConversationState, StateManagerError> {
        let flag = flag.into();
        let (state, ()) = self
            .mutate(session_id, |state| {
                state.metadata.flags.insert(flag);
                Ok(())
            })
            .await?;
        Ok(state)
    }

    /// 缓存中的会话状态
    pub async fn get_state(&self, session_id: &str) -> Option<ConversationState> {
        self.cache.read().await.get(session_id).cloned()
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.cache.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 删除会话状态（缓存与存储）
    pub async fn delete_state(&self, session_id: &str) -> Result<(), StateManagerError> {
        {
            let _guard = self.supervisor.acquire(session_id).await;
            self.storage.delete_state(session_id).await?;
            self.cache.write().await.remove(session_id);
        }
        self.supervisor.remove(session_id);
        tracing::info!(session_id = %session_id, "session state deleted");
        self.events.emit(StateEvent::StateDeleted {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    /// 供 AI 使用的纯文本上下文：画像、当前任务、当前训练、最近几条消息；无状态时返回空串
    pub async fn get_context_for_ai(&self, session_id: &str) -> String {
        match self.cache.read().await.get(session_id) {
            Some(state) => render_context(state, self.config.context_messages),
            None => String::new(),
        }
    }

    /// 变更核心：会话锁 → 读缓存 → 与存储对齐版本 → 应用 → version+1 → 写回 → 更新缓存 → 事件
    async fn mutate<F, R>(&self, session_id: &str, f: F) -> Result<(ConversationState, R), StateManagerError>
    where
        F: FnOnce(&mut ConversationState) -> Result<R, StateManagerError>,
    {
        let _guard = self.supervisor.acquire(session_id).await;

        let mut state = self
            .cache
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| StateManagerError::NotInitialized(session_id.to_string()))?;

        if let Some(stored) = self.storage.load_state(session_id).await? {
            if stored.session_id != session_id {
                tracing::warn!(
                    session_id = %session_id,
                    stored = %stored.session_id,
                    "storage returned another session's state, keeping cache"
                );
            } else if stored.metadata.version > state.metadata.version {
                tracing::debug!(
                    session_id = %session_id,
                    cached = state.metadata.version,
                    stored = stored.metadata.version,
                    "cached state is stale, adopting stored copy"
                );
                state = stored;
            }
        }

        let out = f(&mut state)?;
        prune(&mut state.context.conversation_history, self.config.max_history);
        state.touch();

        self.storage.save_state(&state).await?;
        self.cache
            .write()
            .await
            .insert(session_id.to_string(), state.clone());

        self.events.emit(StateEvent::StateUpdated {
            session_id: session_id.to_string(),
            version: state.metadata.version,
        });
        Ok((state, out))
    }

    /// 校验/迁移加载或新建的状态；发生修复时返回 true 并打 migrated 标记
    fn validate_state(&self, state: &mut ConversationState, session_id: &str, user_id: &str) -> bool {
        let mut repaired = false;
        if state.session_id != session_id {
            state.session_id = session_id.to_string();
            repaired = true;
        }
        if state.user_id.is_empty() {
            state.user_id = user_id.to_string();
            repaired = true;
        } else if state.user_id != user_id {
            tracing::warn!(
                session_id = %session_id,
                stored = %state.user_id,
                requested = %user_id,
                "session belongs to a different user id, keeping stored owner"
            );
        }
        if state.context.conversation_history.len() > self.config.max_history {
            prune(&mut state.context.conversation_history, self.config.max_history);
            repaired = true;
        }
        if let Some(task) = state.context.current_task.as_mut() {
            if task.current_step > task.steps.len() {
                task.refresh_status();
                repaired = true;
            }
        }
        if state.metadata.version == 0 {
            state.metadata.version = 1;
            repaired = true;
        }
        if repaired {
            state.metadata.flags.insert(MIGRATED_FLAG.to_string());
        }
        repaired
    }

    fn emit_task_outcome(&self, session_id: &str, task_id: &str, status: TaskStatus, error: Option<String>) {
        let event = match status {
            TaskStatus::Completed => StateEvent::TaskCompleted {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
            },
            TaskStatus::Failed => StateEvent::TaskFailed {
                session_id: session_id.to_string(),
                task_id: task_id.to_string(),
                error: error.unwrap_or_default(),
            },
            _ => return,
        };
        tracing::info!(session_id = %session_id, task_id = %task_id, status = status.as_str(), "task finished");
        self.events.emit(event);
    }
}

fn step_error(session_id: &str, step_id: &str, e: StepUpdateError) -> StateManagerError {
    match e {
        StepUpdateError::NotFound => StateManagerError::StepNotFound {
            session_id: session_id.to_string(),
            step_id: step_id.to_string(),
        },
        StepUpdateError::InvalidTransition { from, to } => StateManagerError::InvalidStepTransition {
            step_id: step_id.to_string(),
            from,
            to,
        },
        StepUpdateError::RetryBudgetExhausted { max_retries } => StateManagerError::RetryBudgetExhausted {
            step_id: step_id.to_string(),
            max_retries,
        },
    }
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

/// 生成确定性的上下文文本
fn render_context(state: &ConversationState, recent: usize) -> String {
    let profile = &state.context.user_profile;
    let mut sections: Vec<String> = Vec::new();

    let mut lines = vec![
        "User Profile:".to_string(),
        format!("- Fitness Level: {}", profile.fitness_level),
        format!("- Goals: {}", join_or_none(&profile.goals)),
        format!("- Equipment: {}", join_or_none(&profile.equipment)),
    ];
    if let Some(freq) = profile.workout_frequency {
        lines.push(format!("- Workout Frequency: {freq} times per week"));
    }
    sections.push(lines.join("\n"));

    if let Some(task) = &state.context.current_task {
        let (done, total) = task.progress();
        let mut lines = vec![
            format!("Current Task: {} ({})", task.task_type.as_str(), task.status.as_str()),
            format!("- Progress: {done}/{total} steps completed"),
        ];
        if let Some(step) = task.steps.get(task.current_step) {
            lines.push(format!("- Current Step: {}", step.name));
        }
        sections.push(lines.join("\n"));
    }

    if let Some(workout) = state
        .context
        .workout_context
        .as_ref()
        .and_then(|w| w.active_workout.as_ref())
    {
        sections.push(format!("Active Workout: {} ({})", workout.name, workout.status));
    }

    let history = recent_lines(&state.context.conversation_history, recent);
    if !history.is_empty() {
        sections.push(format!("Recent Conversation:\n{}", history.join("\n")));
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ActiveWorkout, StepStatus, UserProfile, WorkoutContext};
    use crate::memory::{DefaultProfileLoader, InMemoryStateStorage, StaticProfileLoader};

    fn manager() -> (ConversationStateManager, Arc<InMemoryStateStorage>) {
        let storage = Arc::new(InMemoryStateStorage::new());
        let mgr = ConversationStateManager::new(
            storage.clone(),
            Arc::new(DefaultProfileLoader),
            StateManagerConfig::default(),
        );
        (mgr, storage)
    }

    #[tokio::test]
    async fn test_update_without_initialize_fails() {
        let (mgr, _) = manager();
        let err = mgr
            .update_state("s1", ContextPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StateManagerError::NotInitialized(ref s) if s == "s1"));
        assert!(mgr.add_message("s1", NewMessage::user("hi")).await.is_err());
        assert!(mgr.get_state("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_persists_and_emits() {
        let (mgr, storage) = manager();
        let mut rx = mgr.subscribe();
        let state = mgr.initialize_state("s1", "u1").await.unwrap();
        assert_eq!(state.metadata.version, 1);
        assert_eq!(state.context.user_profile, UserProfile::default());
        assert!(storage.load_state("s1").await.unwrap().is_some());
        match rx.recv().await.unwrap() {
            StateEvent::StateInitialized { restored, .. } => assert!(!restored),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initialize_uses_loaded_profile() {
        let profile = UserProfile {
            fitness_level: "advanced".into(),
            goals: vec!["endurance".into()],
            equipment: vec!["kettlebell".into()],
            workout_frequency: Some(5),
        };
        let mgr = ConversationStateManager::new(
            Arc::new(InMemoryStateStorage::new()),
            Arc::new(StaticProfileLoader::new().with_profile("u1", profile.clone())),
            StateManagerConfig::default(),
        );
        let state = mgr.initialize_state("s1", "u1").await.unwrap();
        assert_eq!(state.context.user_profile, profile);
    }

    #[tokio::test]
    async fn test_each_update_bumps_version_by_one() {
        let (mgr, _) = manager();
        mgr.initialize_state("s1", "u1").await.unwrap();
        let mut last = mgr.get_state("s1").await.unwrap().metadata;
        for i in 0..3 {
            mgr.add_message("s1", NewMessage::user(format!("m{i}")))
                .await
                .unwrap();
            let now = mgr.get_state("s1").await.unwrap().metadata;
            assert_eq!(now.version, last.version + 1);
            assert!(now.last_updated >= last.last_updated);
            last = now;
        }
    }

    #[tokio::test]
    async fn test_history_capped_at_fifty() {
        let (mgr, _) = manager();
        mgr.initialize_state("s1", "u1").await.unwrap();
        for i in 0..60 {
            mgr.add_message("s1", NewMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let state = mgr.get_state("s1").await.unwrap();
        let history = &state.context.conversation_history;
        assert_eq!(history.len(), 50);
        assert_eq!(history[0].content, "m10");
        assert_eq!(history[49].content, "m59");
    }

    #[tokio::test]
    async fn test_start_task_and_update_step() {
        let (mgr, _) = manager();
        mgr.initialize_state("sid", "u1").await.unwrap();
        let task = mgr
            .start_task(
                "sid",
                TaskType::GeneralChat,
                vec![StepSpec::new("s1"), StepSpec::new("s2")],
            )
            .await
            .unwrap();
        assert_eq!(task.max_retries, 3);

        let step_id = format!("{}_step_1", task.task_id);
        mgr.update_task_step("sid", &step_id, StepPatch::status(StepStatus::Completed))
            .await
            .unwrap();

        let state = mgr.get_state("sid").await.unwrap();
        let current = state.context.current_task.unwrap();
        assert_eq!(current.steps[1].status, StepStatus::Completed);
        assert!(current.steps[1].completed_at.is_some());
        assert_eq!(current.steps[0].status, StepStatus::Pending);
        assert!(current.steps[0].completed_at.is_none());
    }

    #[tokio::test]
    async fn test_step_update_errors() {
        let (mgr, _) = manager();
        mgr.initialize_state("s1", "u1").await.unwrap();
        let version = mgr.get_state("s1").await.unwrap().metadata.version;
        let err = mgr
            .update_task_step("s1", "x", StepPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StateManagerError::NoActiveTask(_)));

        mgr.start_task("s1", TaskType::ExerciseSearch, vec![StepSpec::new("a")])
            .await
            .unwrap();
        let err = mgr
            .update_task_step("s1", "missing", StepPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StateManagerError::StepNotFound { .. }));
        // 失败的更新不改变版本
        assert_eq!(mgr.get_state("s1").await.unwrap().metadata.version, version + 1);
    }

    #[tokio::test]
    async fn test_task_completion_event() {
        let (mgr, _) = manager();
        mgr.initialize_state("s1", "u1").await.unwrap();
        let task = mgr
            .start_task("s1", TaskType::WorkoutCreation, vec![StepSpec::new("only")])
            .await
            .unwrap();
        let mut rx = mgr.subscribe();
        mgr.update_task_step(
            "s1",
            &task.steps[0].step_id,
            StepPatch::completed(serde_json::json!({"ok": true})),
        )
        .await
        .unwrap();

        let mut saw_completed = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, StateEvent::TaskCompleted { .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
        let t = mgr.get_state("s1").await.unwrap().context.current_task.unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_context_for_ai_profile_only() {
        let profile = UserProfile {
            fitness_level: "beginner".into(),
            goals: vec!["strength".into()],
            ..UserProfile::default()
        };
        let mgr = ConversationStateManager::new(
            Arc::new(InMemoryStateStorage::new()),
            Arc::new(StaticProfileLoader::new().with_profile("u1", profile)),
            StateManagerConfig::default(),
        );
        assert_eq!(mgr.get_context_for_ai("s1").await, "");
        mgr.initialize_state("s1", "u1").await.unwrap();
        let text = mgr.get_context_for_ai("s1").await;
        assert!(text.contains("Fitness Level: beginner"));
        assert!(text.contains("Goals: strength"));
        assert!(!text.contains("Current Task"));
        assert!(!text.contains("Active Workout"));
    }

    #[tokio::test]
    async fn test_context_for_ai_full() {
        let (mgr, _) = manager();
        mgr.initialize_state("s1", "u1").await.unwrap();
        mgr.update_state(
            "s1",
            ContextPatch::workout(Some(WorkoutContext {
                active_workout: Some(ActiveWorkout {
                    id: None,
                    name: "Push Day".into(),
                    status: "in_progress".into(),
                }),
                data: serde_json::Value::Null,
            })),
        )
        .await
        .unwrap();
        mgr.start_task(
            "s1",
            TaskType::WorkoutCreation,
            vec![StepSpec::new("collect"), StepSpec::new("generate")],
        )
        .await
        .unwrap();
        for i in 0..7 {
            mgr.add_message("s1", NewMessage::user(format!("q{i}"))).await.unwrap();
        }
        let text = mgr.get_context_for_ai("s1").await;
        assert!(text.contains("Current Task: workout_creation (pending)"));
        assert!(text.contains("- Progress: 0/2 steps completed"));
        assert!(text.contains("- Current Step: collect"));
        assert!(text.contains("Active Workout: Push Day (in_progress)"));
        assert!(text.contains("user: q6"));
        assert!(text.contains("user: q2"));
        assert!(!text.contains("user: q1"));
        assert_eq!(text, mgr.get_context_for_ai("s1").await);
    }

    #[tokio::test]
    async fn test_restores_persisted_state_and_migrates() {
        let storage = Arc::new(InMemoryStateStorage::new());
        let mut stored = ConversationState::new("s1", "", UserProfile::default());
        for i in 0..70 {
            stored
                .context
                .conversation_history
                .push(NewMessage::user(format!("old{i}")).into_message());
        }
        stored.metadata.version = 7;
        storage.save_state(&stored).await.unwrap();

        let mgr = ConversationStateManager::new(
            storage.clone(),
            Arc::new(DefaultProfileLoader),
            StateManagerConfig::default(),
        );
        let state = mgr.initialize_state("s1", "u1").await.unwrap();
        assert_eq!(state.user_id, "u1");
        assert_eq!(state.metadata.version, 7);
        assert_eq!(state.context.conversation_history.len(), 50);
        assert!(state.metadata.flags.contains(MIGRATED_FLAG));
    }

    #[tokio::test]
    async fn test_adopts_newer_stored_version() {
        let (mgr, storage) = manager();
        mgr.initialize_state("s1", "u1").await.unwrap();

        // 另一个进程写入了更新的版本
        let mut external = storage.load_state("s1").await.unwrap().unwrap();
        external.context.user_profile.fitness_level = "intermediate".into();
        external.metadata.version = 10;
        storage.save_state(&external).await.unwrap();

        let state = mgr.set_flag("s1", "onboarded").await.unwrap();
        assert_eq!(state.metadata.version, 11);
        assert_eq!(state.context.user_profile.fitness_level, "intermediate");
        assert!(state.metadata.flags.contains("onboarded"));
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_not_lost() {
        let (mgr, _) = manager();
        let mgr = Arc::new(mgr);
        mgr.initialize_state("s1", "u1").await.unwrap();
        let mut handles = Vec::new();
        for i in 0..10 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move {
                mgr.add_message("s1", NewMessage::user(format!("c{i}"))).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let state = mgr.get_state("s1").await.unwrap();
        assert_eq!(state.metadata.version, 11);
        assert_eq!(state.context.conversation_history.len(), 10);
    }

    #[tokio::test]
    async fn test_fail_clear_and_delete() {
        let (mgr, storage) = manager();
        mgr.initialize_state("s1", "u1").await.unwrap();
        mgr.start_task("s1", TaskType::GeneralChat, vec![StepSpec::new("a")])
            .await
            .unwrap();
        let task = mgr.fail_task("s1", "provider down").await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("provider down"));

        let cleared = mgr.clear_task("s1").await.unwrap();
        assert!(cleared.is_some());
        assert!(mgr.get_state("s1").await.unwrap().context.current_task.is_none());
        assert!(matches!(
            mgr.complete_task("s1").await.unwrap_err(),
            StateManagerError::NoActiveTask(_)
        ));

        mgr.delete_state("s1").await.unwrap();
        assert!(mgr.get_state("s1").await.is_none());
        assert!(storage.load_state("s1").await.unwrap().is_none());
        assert!(mgr.active_sessions().await.is_empty());
    }
}
