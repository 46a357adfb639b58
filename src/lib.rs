//! Spotter - 智能体工具执行与会话状态子系统
//!
//! 模块划分：
//! - **agent**: 单轮对话运行时（状态 + 工具链）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话状态、任务状态机、生命周期事件、会话监管、状态管理器
//! - **memory**: 对话历史与会话状态持久化
//! - **observability**: 日志初始化
//! - **tools**: 工具注册、重试与熔断、执行器、工具链

pub mod agent;
pub mod config;
pub mod core;
pub mod memory;
pub mod observability;
pub mod tools;

pub use agent::{ChatAgent, PlannedStep, TaskPlan, TurnOutcome, TurnRequest};
