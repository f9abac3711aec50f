//! 会话监管：回合级取消
//!
//! 持有当前回合的 CancellationToken，用户 Ctrl+C 或 /cancel 时取消进行中的回合。
//! 令牌一旦取消不可复位，下一回合开始时换新令牌。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct SessionSupervisor {
    current: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(CancellationToken::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 当前回合的令牌
    pub fn cancel_token(&self) -> CancellationToken {
        self.lock().clone()
    }

    /// 触发取消（用户 Ctrl+C）
    pub fn cancel(&self) {
        self.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().is_cancelled()
    }

    /// 开始新回合：上一令牌已取消时换新，返回本回合令牌
    pub fn begin_turn(&self) -> CancellationToken {
        let mut current = self.lock();
        if current.is_cancelled() {
            *current = CancellationToken::new();
        }
        current.clone()
    }

    /// 创建子 token（用于单个后台任务）
    pub fn child_token(&self) -> CancellationToken {
        self.lock().child_token()
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_turn_replaces_cancelled_token() {
        let supervisor = SessionSupervisor::new();
        let first = supervisor.begin_turn();
        supervisor.cancel();
        assert!(first.is_cancelled());

        let second = supervisor.begin_turn();
        assert!(!second.is_cancelled());
        assert!(!supervisor.is_cancelled());
    }

    #[test]
    fn test_child_token_follows_parent() {
        let supervisor = SessionSupervisor::new();
        let child = supervisor.child_token();
        supervisor.cancel();
        assert!(child.is_cancelled());
    }
}
