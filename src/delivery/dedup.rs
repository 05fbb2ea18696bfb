//! 有界、会过期的去重集合
//!
//! 推送与轮询两条路径会竞争同一条插入；先观察到的一方生效，后到者为空操作。
//! 集合按容量与 TTL 淘汰，订阅存活期间不会无限增长。

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct DedupSet {
    capacity: usize,
    ttl: Duration,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DedupSet {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// 首次出现返回 true；TTL 内重复出现返回 false（不刷新时间）
    pub fn insert(&mut self, id: &str) -> bool {
        let now = Instant::now();
        self.evict(now);
        if self.seen.contains_key(id) {
            return false;
        }
        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));
        self.evict(now);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen
            .get(id)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict(&mut self, now: Instant) {
        while let Some((id, at)) = self.order.front() {
            let expired = now.duration_since(*at) >= self.ttl;
            if !expired && self.order.len() <= self.capacity {
                break;
            }
            if self.seen.get(id) == Some(at) {
                self.seen.remove(id);
            }
            self.order.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_insert_is_noop() {
        let mut set = DedupSet::new(8, Duration::from_secs(60));
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert!(set.insert("b"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut set = DedupSet::new(2, Duration::from_secs(60));
        set.insert("a");
        set.insert("b");
        set.insert("c");
        assert!(!set.contains("a"));
        assert!(set.contains("b"));
        assert!(set.contains("c"));
        assert_eq!(set.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let mut set = DedupSet::new(8, Duration::from_secs(10));
        set.insert("a");
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!set.insert("a"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!set.contains("a"));
        assert!(set.insert("a"));
    }
}
