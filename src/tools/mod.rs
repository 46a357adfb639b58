pub mod chain;
pub mod circuit_breaker;
pub mod echo;
pub mod executor;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod schema;
pub mod types;

pub use chain::{ChainOutcome, ToolCall, ToolChainExecutor};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use echo::EchoTool;
pub use executor::{ToolExecutor, FALLBACK_CONFIDENCE};
pub use metrics::ToolMetrics;
pub use registry::{Tool, ToolRegistry};
pub use retry::{RetryPolicy, DEFAULT_RETRYABLE_ERRORS};
pub use runtime::{CircuitRejection, ToolRuntime};
pub use schema::{tool_call_schema_json, tool_chain_schema_json};
pub use types::{
    ToolContext, ToolError, ToolErrorCategory, ToolResult, ToolResultMetadata, ValidationResult,
};
