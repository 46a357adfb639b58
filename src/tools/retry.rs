//! 重试策略：可重试判定与指数退避
//!
//! 第 a 次尝试（0 起）失败后的等待时间为 `min(base_delay * multiplier^a, max_delay)`；
//! 错误消息包含 retryable_errors 中任一子串（忽略大小写）才重试。

use std::time::Duration;

/// 默认可重试错误关键词
pub const DEFAULT_RETRYABLE_ERRORS: [&str; 4] = ["timeout", "network", "temporary", "rate limit"];

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff_multiplier: 2.0,
            retryable_errors: DEFAULT_RETRYABLE_ERRORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RetryPolicy {
    /// 不重试的策略（max_retries = 0）
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_retryable_errors(mut self, patterns: Vec<String>) -> Self {
        self.retryable_errors = patterns;
        self
    }

    /// 第 attempt 次尝试失败后、下一次尝试前的等待时间
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max_ms = self.max_delay.as_millis() as f64;
        let raw_ms = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let ms = if raw_ms.is_finite() { raw_ms.min(max_ms) } else { max_ms };
        Duration::from_millis(ms.max(0.0).round() as u64)
    }

    pub fn is_retryable(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.retryable_errors
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
    }

    /// attempt 次尝试刚失败，是否还应再试
    pub fn should_retry(&self, attempt: u32, message: &str) -> bool {
        attempt < self.max_retries && self.is_retryable(message)
    }
}
