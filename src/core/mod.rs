//! 核心层：错误、会话状态模型、任务状态机、生命周期事件、会话监管与状态管理器

pub mod error;
pub mod events;
pub mod session_supervisor;
pub mod state;
pub mod state_manager;
pub mod task;

pub use error::{ChainError, StateManagerError, StorageError};
pub use events::{EventBus, StateEvent};
pub use session_supervisor::SessionSupervisor;
pub use state::{
    ActiveWorkout, ContextPatch, ConversationState, StateContext, StateMetadata, UserProfile,
    WorkoutContext,
};
pub use state_manager::{ConversationStateManager, StateManagerConfig, MIGRATED_FLAG};
pub use task::{
    StepPatch, StepSpec, StepStatus, StepUpdateError, TaskContext, TaskStatus, TaskStep, TaskType,
    DEFAULT_TASK_MAX_RETRIES,
};
