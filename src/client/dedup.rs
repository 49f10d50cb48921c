//! 有界去重集合
//!
//! 回填与实时流可能重复投递同一事件，按 `(session_id, id, timestamp)` 去重。
//! 容量固定，超出后淘汰最早记录的键。

use std::collections::{HashSet, VecDeque};

use crate::types::DedupKey;

/// 默认容量
pub const DEFAULT_SEEN_CAPACITY: usize = 10_000;

/// 有界去重环
#[derive(Debug, Clone)]
pub struct SeenSet {
    capacity: usize,
    order: VecDeque<DedupKey>,
    keys: HashSet<DedupKey>,
}

impl SeenSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            keys: HashSet::with_capacity(capacity.min(1024)),
        }
    }

    /// 记录键；首次出现返回 true
    pub fn insert(&mut self, key: DedupKey) -> bool {
        if self.keys.contains(&key) {
            return false;
        }

        self.keys.insert(key.clone());
        self.order.push_back(key);

        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.keys.clear();
    }

    /// 移除某个会话的全部键，返回移除数量
    ///
    /// 会话被删除后，同一会话的事件可能被重新投递，必须能再次折叠。
    pub fn remove_session(&mut self, session_id: &str) -> usize {
        let before = self.order.len();
        self.order.retain(|key| key.session_id != session_id);
        self.keys.retain(|key| key.session_id != session_id);
        before - self.order.len()
    }
}

impl Default for SeenSet {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY)
    }
}
