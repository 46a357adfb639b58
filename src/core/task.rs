//! 任务状态机
//!
//! 一个会话同时最多一个 TaskContext。步骤状态迁移：
//! pending → in_progress / completed / failed / skipped，in_progress → completed / failed / skipped，
//! failed → in_progress（重试，消耗任务级重试预算）；completed 与 skipped 为终态。
//! 任务状态在每次步骤更新后重新推导。任务级 retry_count 与工具级重试相互独立。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 任务默认最大重试次数
pub const DEFAULT_TASK_MAX_RETRIES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    WorkoutCreation,
    ExerciseSearch,
    GeneralChat,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::WorkoutCreation => "workout_creation",
            TaskType::ExerciseSearch => "exercise_search",
            TaskType::GeneralChat => "general_chat",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    /// 是否允许迁移到 target（同状态视为字段修补，允许）
    pub fn can_transition_to(&self, target: StepStatus) -> bool {
        use StepStatus::*;
        if *self == target {
            return true;
        }
        match self {
            Pending => matches!(target, InProgress | Completed | Failed | Skipped),
            InProgress => matches!(target, Completed | Failed | Skipped),
            Failed => matches!(target, InProgress),
            Completed | Skipped => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStep {
    pub step_id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
}

/// 新任务中的一个步骤描述
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepSpec {
    pub name: String,
    pub input: Option<Value>,
}

impl StepSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: None,
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// 步骤的部分更新
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl StepPatch {
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn completed(output: Value) -> Self {
        Self {
            status: Some(StepStatus::Completed),
            output: Some(output),
            ..Self::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(StepStatus::Failed),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// 步骤更新失败原因（由状态管理器补上会话信息）
#[derive(Clone, Debug, PartialEq)]
pub enum StepUpdateError {
    NotFound,
    InvalidTransition { from: StepStatus, to: StepStatus },
    RetryBudgetExhausted { max_retries: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub steps: Vec<TaskStep>,
    pub current_step: usize,
    pub retry_count: u32,
    pub max_retries: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskContext {
    /// 新建任务：所有步骤 pending，step_id 为 `{task_id}_step_{序号}`（0 起）
    pub fn new(task_type: TaskType, steps: Vec<StepSpec>, max_retries: u32) -> Self {
        let now = Utc::now();
        let random = uuid::Uuid::new_v4().simple().to_string();
        let task_id = format!("task_{}_{}", now.timestamp_millis(), &random[..9]);
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(i, spec)| TaskStep {
                step_id: format!("{task_id}_step_{i}"),
                name: spec.name,
                status: StepStatus::Pending,
                input: spec.input,
                output: None,
                error: None,
                started_at: None,
                completed_at: None,
                retry_count: 0,
            })
            .collect();
        Self {
            task_id,
            task_type,
            status: TaskStatus::Pending,
            steps,
            current_step: 0,
            retry_count: 0,
            max_retries,
            started_at: now,
            completed_at: None,
            error: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// (已完成或跳过的步骤数, 总步骤数)
    pub fn progress(&self) -> (usize, usize) {
        let done = self.steps.iter().filter(|s| s.status.is_done()).count();
        (done, self.steps.len())
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 应用步骤更新并重新推导任务状态，返回更新后的步骤
    pub fn apply_step_patch(&mut self, step_id: &str, patch: StepPatch) -> Result<TaskStep, StepUpdateError> {
        let budget_left = self.retry_count < self.max_retries;
        let max_retries = self.max_retries;
        let step = self
            .steps
            .iter_mut()
            .find(|s| s.step_id == step_id)
            .ok_or(StepUpdateError::NotFound)?;

        let mut retried = false;
        if let Some(next) = patch.status {
            let from = step.status;
            if !from.can_transition_to(next) {
                return Err(StepUpdateError::InvalidTransition { from, to: next });
            }
            if from == StepStatus::Failed && next == StepStatus::InProgress {
                if !budget_left {
                    return Err(StepUpdateError::RetryBudgetExhausted { max_retries });
                }
                step.retry_count += 1;
                step.error = None;
                retried = true;
            }
            if from != next {
                let now = Utc::now();
                match next {
                    StepStatus::InProgress => step.started_at = Some(now),
                    StepStatus::Completed => step.completed_at = Some(now),
                    _ => {}
                }
            }
            step.status = next;
        }
        if let Some(input) = patch.input {
            step.input = Some(input);
        }
        if let Some(output) = patch.output {
            step.output = Some(output);
        }
        if let Some(error) = patch.error {
            step.error = Some(error);
        }
        let updated = step.clone();

        if retried {
            self.retry_count += 1;
        }
        self.refresh_status();
        Ok(updated)
    }

    /// 根据步骤状态推导任务状态与 current_step；显式失败的任务保持 failed
    pub fn refresh_status(&mut self) {
        self.current_step = self
            .steps
            .iter()
            .position(|s| !s.status.is_done())
            .unwrap_or(self.steps.len());

        if self.status == TaskStatus::Failed {
            return;
        }

        if !self.steps.is_empty() && self.steps.iter().all(|s| s.status.is_done()) {
            self.status = TaskStatus::Completed;
            self.completed_at.get_or_insert_with(Utc::now);
            return;
        }

        let exhausted = self.retry_count >= self.max_retries;
        if let Some(failed) = self.steps.iter().find(|s| s.status == StepStatus::Failed) {
            if exhausted {
                self.status = TaskStatus::Failed;
                self.error = failed
                    .error
                    .clone()
                    .or_else(|| Some(format!("step {} failed", failed.name)));
                return;
            }
        }

        self.status = if self.steps.iter().any(|s| s.status != StepStatus::Pending) {
            TaskStatus::InProgress
        } else {
            TaskStatus::Pending
        };
    }

    /// 显式完成：剩余未结束步骤标记为 skipped
    pub fn complete(&mut self) {
        for step in self.steps.iter_mut().filter(|s| !s.status.is_done()) {
            step.status = StepStatus::Skipped;
        }
        self.status = TaskStatus::Completed;
        self.completed_at.get_or_insert_with(Utc::now);
        self.current_step = self.steps.len();
    }

    /// 显式失败
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(n: usize, max_retries: u32) -> TaskContext {
        let steps = (0..n).map(|i| StepSpec::new(format!("s{i}"))).collect();
        TaskContext::new(TaskType::GeneralChat, steps, max_retries)
    }

    #[test]
    fn test_new_task_shape() {
        let t = task(2, 3);
        assert_eq!(t.status, TaskStatus::Pending);
        assert_eq!(t.steps[1].step_id, format!("{}_step_1", t.task_id));
        assert!(t.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(t.current_step, 0);
    }

    #[test]
    fn test_complete_step_stamps_and_progresses() {
        let mut t = task(2, 3);
        let id = t.steps[0].step_id.clone();
        let s = t.apply_step_patch(&id, StepPatch::status(StepStatus::InProgress)).unwrap();
        assert!(s.started_at.is_some());
        assert!(s.completed_at.is_none());
        assert_eq!(t.status, TaskStatus::InProgress);

        let s = t.apply_step_patch(&id, StepPatch::completed(serde_json::json!(1))).unwrap();
        assert!(s.completed_at.is_some());
        assert_eq!(t.current_step, 1);
        assert_eq!(t.progress(), (1, 2));

        let id1 = t.steps[1].step_id.clone();
        t.apply_step_patch(&id1, StepPatch::status(StepStatus::Skipped)).unwrap();
        assert_eq!(t.status, TaskStatus::Completed);
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn test_terminal_steps_reject_transitions() {
        let mut t = task(1, 3);
        let id = t.steps[0].step_id.clone();
        t.apply_step_patch(&id, StepPatch::status(StepStatus::Completed)).unwrap();
        let err = t
            .apply_step_patch(&id, StepPatch::status(StepStatus::Failed))
            .unwrap_err();
        assert_eq!(
            err,
            StepUpdateError::InvalidTransition {
                from: StepStatus::Completed,
                to: StepStatus::Failed
            }
        );
    }

    #[test]
    fn test_retry_consumes_task_budget() {
        let mut t = task(1, 1);
        let id = t.steps[0].step_id.clone();
        t.apply_step_patch(&id, StepPatch::failed("boom")).unwrap();
        assert_eq!(t.status, TaskStatus::InProgress);

        let s = t.apply_step_patch(&id, StepPatch::status(StepStatus::InProgress)).unwrap();
        assert_eq!(s.retry_count, 1);
        assert!(s.error.is_none());
        assert_eq!(t.retry_count, 1);

        t.apply_step_patch(&id, StepPatch::failed("boom again")).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.error.as_deref(), Some("boom again"));

        let err = t
            .apply_step_patch(&id, StepPatch::status(StepStatus::InProgress))
            .unwrap_err();
        assert_eq!(err, StepUpdateError::RetryBudgetExhausted { max_retries: 1 });
    }

    #[test]
    fn test_unknown_step() {
        let mut t = task(1, 3);
        assert_eq!(
            t.apply_step_patch("nope", StepPatch::default()).unwrap_err(),
            StepUpdateError::NotFound
        );
    }

    #[test]
    fn test_explicit_complete_skips_rest() {
        let mut t = task(3, 3);
        t.complete();
        assert!(t.steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert!(t.steps.iter().all(|s| s.completed_at.is_none()));
        assert_eq!(t.current_step, 3);
    }

    #[test]
    fn test_task_type_serialized_as_type() {
        let v = serde_json::to_value(task(1, 3)).unwrap();
        assert_eq!(v["type"], "general_chat");
        assert_eq!(v["status"], "pending");
        assert_eq!(v["steps"][0]["status"], "pending");
    }
}
