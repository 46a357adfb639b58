//! 单工具熔断器
//!
//! closed（放行）→ open（连续失败达到阈值，直接拒绝）→ half_open（冷却期过后放行一次试探）
//! → 试探成功回到 closed，失败重新 open。每个工具一个实例，由 ToolRuntime 持有。
//! 试探被取消时调用 release_trial 回到 open；未释放的试探在 reset_timeout 后过期，允许新的试探。

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn valid_transitions(&self) -> &'static [CircuitState] {
        match self {
            CircuitState::Closed => &[CircuitState::Open],
            CircuitState::Open => &[CircuitState::HalfOpen],
            CircuitState::HalfOpen => &[CircuitState::Closed, CircuitState::Open],
        }
    }

    fn can_transition_to(&self, target: CircuitState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

/// 熔断参数：失败阈值与冷却时间
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// 熔断器状态快照（供诊断与 metrics 展示）
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub next_retry_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    /// half_open 时是否已有试探请求在途
    trial_in_flight: bool,
    trial_started: Option<Instant>,
    trial_started_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            last_failure_at: None,
            trial_in_flight: false,
            trial_started: None,
            trial_started_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    fn transition_to(&mut self, next: CircuitState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "Invalid circuit state transition: {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    fn start_trial(&mut self) {
        self.trial_in_flight = true;
        self.trial_started = Some(Instant::now());
        self.trial_started_at = Some(Utc::now());
    }

    fn clear_trial(&mut self) {
        self.trial_in_flight = false;
        self.trial_started = None;
        self.trial_started_at = None;
    }

    fn trial_expired(&self) -> bool {
        self.trial_started
            .map(|t| t.elapsed() >= self.config.reset_timeout)
            .unwrap_or(true)
    }

    /// 是否放行本次调用；open 且冷却期已过时转入 half_open 并放行一次试探
    pub fn allow_request(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                if self.trial_in_flight && !self.trial_expired() {
                    return false;
                }
                if self.trial_in_flight {
                    tracing::warn!("circuit breaker trial call never reported back, allowing another");
                }
                self.start_trial();
                true
            }
            CircuitState::Open => {
                let cooled = self
                    .last_failure
                    .map(|t| t.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if cooled {
                    self.transition_to(CircuitState::HalfOpen);
                    self.start_trial();
                    tracing::info!(failures = self.failures, "circuit breaker half-open, allowing one trial call");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.clear_trial();
        if self.state != CircuitState::Closed {
            // open 期间的迟到成功也视为恢复
            if self.state == CircuitState::Open {
                self.state = CircuitState::HalfOpen;
            }
            self.transition_to(CircuitState::Closed);
            tracing::info!("circuit breaker closed");
        }
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
        self.last_failure = Some(Instant::now());
        self.last_failure_at = Some(Utc::now());
        self.clear_trial();
        match self.state {
            CircuitState::HalfOpen => {
                self.transition_to(CircuitState::Open);
                tracing::warn!(failures = self.failures, "circuit breaker trial call failed, re-opened");
            }
            CircuitState::Closed if self.failures >= self.config.failure_threshold => {
                self.transition_to(CircuitState::Open);
                tracing::warn!(
                    failures = self.failures,
                    threshold = self.config.failure_threshold,
                    "circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    /// 试探未给出结果（如被取消）：回到 open，保留上次失败时间，下次调用即可重新试探
    pub fn release_trial(&mut self) {
        if self.state != CircuitState::HalfOpen || !self.trial_in_flight {
            return;
        }
        self.clear_trial();
        self.transition_to(CircuitState::Open);
        tracing::debug!(failures = self.failures, "circuit breaker trial call released");
    }

    /// open 状态下剩余冷却时间
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let last = self.last_failure?;
        Some(self.config.reset_timeout.saturating_sub(last.elapsed()))
    }

    /// 下一次允许试探的时间：open 时为上次失败 + 冷却，half_open 试探在途时为试探过期时间
    pub fn next_retry_time(&self) -> Option<DateTime<Utc>> {
        let since = match self.state {
            CircuitState::Closed => return None,
            CircuitState::Open => self.last_failure_at?,
            CircuitState::HalfOpen => self.trial_started_at?,
        };
        let timeout = chrono::Duration::from_std(self.config.reset_timeout).ok()?;
        Some(since + timeout)
    }

    /// 手动复位
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.last_failure = None;
        self.last_failure_at = None;
        self.clear_trial();
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failures: self.failures,
            last_failure_time: self.last_failure_at,
            next_retry_time: self.next_retry_time(),
        }
    }
}
