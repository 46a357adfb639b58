//! 单工具调用统计

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// 调用计数与耗时；failed_calls 按「尝试」计，total_calls 按 execute_tool 调用计
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetrics {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub fallback_calls: u64,
    pub total_execution_ms: u64,
    pub last_error: Option<String>,
    pub last_called_at: Option<DateTime<Utc>>,
}

impl ToolMetrics {
    pub fn record_call(&mut self) {
        self.total_calls += 1;
        self.last_called_at = Some(Utc::now());
    }

    pub fn record_success(&mut self, elapsed: Duration) {
        self.successful_calls += 1;
        self.total_execution_ms += elapsed.as_millis() as u64;
    }

    pub fn record_failure(&mut self, elapsed: Duration, error: &str) {
        self.failed_calls += 1;
        self.total_execution_ms += elapsed.as_millis() as u64;
        self.last_error = Some(error.to_string());
    }

    pub fn record_fallback(&mut self) {
        self.fallback_calls += 1;
    }

    /// 平均单次尝试耗时（毫秒）
    pub fn average_execution_ms(&self) -> f64 {
        let attempts = self.successful_calls + self.failed_calls;
        if attempts == 0 {
            0.0
        } else {
            self.total_execution_ms as f64 / attempts as f64
        }
    }

    pub fn success_rate(&self) -> f64 {
        let attempts = self.successful_calls + self.failed_calls;
        if attempts == 0 {
            1.0
        } else {
            self.successful_calls as f64 / attempts as f64
        }
    }
}
