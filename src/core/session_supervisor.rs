//! 会话监管：每会话互斥与取消令牌
//!
//! 两层锁：状态锁（acquire）串行单次状态变更，版本号不会互相覆盖；
//! 轮次锁（acquire_turn）覆盖一整轮对话，逻辑上并发的两轮（如客户端重复提交）依次执行。
//! 两者是不同的互斥量，持有轮次锁时仍可获取状态锁。
//! 每会话一个取消令牌（根令牌的子令牌），用户离开时可中止在途工具链。
//! 无人持有也无人等待的锁在下次获取时清理，没有在途轮次的会话令牌随之清理。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    root: CancellationToken,
    locks: Mutex<HashMap<String, SessionLock>>,
    turns: Mutex<HashMap<String, SessionLock>>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

type SessionLock = Arc<tokio::sync::Mutex<()>>;

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// map 之外没有引用即空闲（持锁者与等待者都持有 Arc）
fn is_busy(lock: &SessionLock) -> bool {
    Arc::strong_count(lock) > 1
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取会话状态锁；持有期间同会话的其他状态变更等待
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        self.prune_idle();
        let lock = guard(&self.locks)
            .entry(session_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// 获取会话轮次锁；持有期间同会话的下一轮等待
    pub async fn acquire_turn(&self, session_id: &str) -> OwnedMutexGuard<()> {
        self.prune_idle();
        let lock = guard(&self.turns)
            .entry(session_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// 仍被跟踪的会话数（有锁或令牌记录）
    pub fn tracked_sessions(&self) -> usize {
        let mut ids: Vec<String> = guard(&self.locks).keys().cloned().collect();
        ids.extend(guard(&self.turns).keys().cloned());
        ids.extend(guard(&self.tokens).keys().cloned());
        ids.sort();
        ids.dedup();
        ids.len()
    }

    /// 清理空闲的锁；没有在途轮次的会话同时清理令牌
    fn prune_idle(&self) {
        guard(&self.locks).retain(|_, lock| is_busy(lock));
        let mut turns = guard(&self.turns);
        turns.retain(|_, lock| is_busy(lock));
        guard(&self.tokens).retain(|id, _| turns.contains_key(id));
    }

    /// 会话当前的取消令牌；上一个已取消时换新
    pub fn cancel_token(&self, session_id: &str) -> CancellationToken {
        let mut tokens = guard(&self.tokens);
        let token = tokens
            .entry(session_id.to_string())
            .or_insert_with(|| self.root.child_token());
        if token.is_cancelled() && !self.root.is_cancelled() {
            *token = self.root.child_token();
        }
        token.clone()
    }

    /// 取消会话的在途请求
    pub fn cancel(&self, session_id: &str) {
        if let Some(token) = guard(&self.tokens).get(session_id) {
            token.cancel();
        }
    }

    /// 取消所有会话（进程关闭）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    pub fn remove(&self, session_id: &str) {
        guard(&self.locks).remove(session_id);
        guard(&self.turns).remove(session_id);
        if let Some(token) = guard(&self.tokens).remove(session_id) {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_session_is_serialized() {
        let sup = Arc::new(SessionSupervisor::new());
        let g = sup.acquire("s").await;
        let sup2 = sup.clone();
        let waiter = tokio::spawn(async move {
            let _g = sup2.acquire("s").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        // 其他会话不受影响
        let _other = sup.acquire("t").await;
        drop(g);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_turn_lock_is_separate_from_state_lock() {
        let sup = Arc::new(SessionSupervisor::new());
        let turn = sup.acquire_turn("s").await;
        // 同一轮内仍可做状态变更
        drop(sup.acquire("s").await);

        let sup2 = sup.clone();
        let next_turn = tokio::spawn(async move {
            let _t = sup2.acquire_turn("s").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!next_turn.is_finished());
        drop(turn);
        next_turn.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_sessions_are_pruned() {
        let sup = SessionSupervisor::new();
        let mut held = Vec::new();
        for i in 0..10 {
            let id = format!("s{i}");
            held.push(sup.acquire_turn(&id).await);
            held.push(sup.acquire(&id).await);
            sup.cancel_token(&id);
        }
        assert_eq!(sup.tracked_sessions(), 10);
        drop(held);
        assert_eq!(sup.tracked_sessions(), 10);

        let _held = sup.acquire("live").await;
        assert_eq!(sup.tracked_sessions(), 1);
    }

    #[tokio::test]
    async fn test_token_kept_while_turn_in_flight() {
        let sup = SessionSupervisor::new();
        let _turn = sup.acquire_turn("s").await;
        let token = sup.cancel_token("s");
        drop(sup.acquire("other").await);
        sup.cancel("s");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_then_fresh_token() {
        let sup = SessionSupervisor::new();
        let t1 = sup.cancel_token("s");
        sup.cancel("s");
        assert!(t1.is_cancelled());
        let t2 = sup.cancel_token("s");
        assert!(!t2.is_cancelled());
        sup.cancel_all();
        assert!(t2.is_cancelled());
    }
}
