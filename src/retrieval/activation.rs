//! 激活追踪：条目最近一次被选入 Tier 2/3 的回合位置
//!
//! 位置 P 选中的条目在 `current - P <= window` 期间保持可用（sticky），无需再次命中；
//! 每次检索之后清理早于 `current - window` 的记录。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::world::EntityId;

pub const DEFAULT_STICKY_WINDOW: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationTracker {
    window: u64,
    records: HashMap<EntityId, u64>,
}

impl Default for ActivationTracker {
    fn default() -> Self {
        Self::new(DEFAULT_STICKY_WINDOW)
    }
}

impl ActivationTracker {
    pub fn new(window: u64) -> Self {
        Self {
            window,
            records: HashMap::new(),
        }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    /// 记录激活；已有更晚的记录时保持不变
    pub fn record(&mut self, id: &str, position: u64) {
        let slot = self.records.entry(id.to_string()).or_insert(position);
        *slot = (*slot).max(position);
    }

    pub fn last_activation(&self, id: &str) -> Option<u64> {
        self.records.get(id).copied()
    }

    /// 条目在 current 位置是否仍处于粘滞窗口内
    pub fn is_sticky(&self, id: &str, current: u64) -> bool {
        match self.records.get(id) {
            Some(&p) => p <= current && current - p <= self.window,
            None => false,
        }
    }

    /// 删除早于 `current - window` 的记录，返回删除数
    pub fn prune(&mut self, current: u64) -> usize {
        let before = self.records.len();
        let window = self.window;
        self.records.retain(|_, p| *p + window >= current);
        before - self.records.len()
    }

    /// 回合被删除或回滚时，忘记位置 ≥ from 的激活
    pub fn forget_from(&mut self, from: u64) {
        self.records.retain(|_, p| *p < from);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stickiness_boundary() {
        let mut t = ActivationTracker::new(10);
        t.record("e1", 5);

        assert!(t.is_sticky("e1", 5));
        assert!(t.is_sticky("e1", 14)); // P+W-1
        assert!(t.is_sticky("e1", 15)); // P+W
        assert!(!t.is_sticky("e1", 16)); // P+W+1

        assert_eq!(t.prune(15), 0);
        assert_eq!(t.last_activation("e1"), Some(5));
        assert_eq!(t.prune(16), 1);
        assert!(t.last_activation("e1").is_none());
    }

    #[test]
    fn test_record_keeps_latest_position() {
        let mut t = ActivationTracker::default();
        t.record("e1", 8);
        t.record("e1", 3);
        assert_eq!(t.last_activation("e1"), Some(8));
    }

    #[test]
    fn test_forget_from() {
        let mut t = ActivationTracker::default();
        t.record("old", 2);
        t.record("new", 7);
        t.forget_from(5);
        assert_eq!(t.len(), 1);
        assert!(t.last_activation("new").is_none());
    }

    #[test]
    fn test_not_sticky_before_recorded_position() {
        let mut t = ActivationTracker::new(3);
        t.record("e1", 10);
        assert!(!t.is_sticky("e1", 9));
    }
}
