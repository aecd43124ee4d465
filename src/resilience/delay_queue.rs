//! # Delay Queue
//!
//! Keyed deadline scheduler on `tokio::time::Instant`. Each key has at most one
//! pending deadline; scheduling a key again replaces it. Keys with equal
//! deadlines come due in the order they were scheduled. Reading the due keys
//! does not remove them; callers cancel or reschedule what they act on.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use tokio::time::Instant;

#[derive(Debug)]
pub struct DelayQueue<K> {
    deadlines: BTreeMap<(Instant, u64), K>,
    index: HashMap<K, (Instant, u64)>,
    next_seq: u64,
}

impl<K> Default for DelayQueue<K> {
    fn default() -> Self {
        Self {
            deadlines: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<K> DelayQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, key: K, at: Instant) {
        self.cancel(&key);
        let slot = (at, self.next_seq);
        self.next_seq += 1;
        self.deadlines.insert(slot, key.clone());
        self.index.insert(key, slot);
    }

    /// Returns `true` if the key had a pending deadline
    pub fn cancel(&mut self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(slot) => {
                self.deadlines.remove(&slot);
                true
            }
            None => false,
        }
    }

    /// Every key whose deadline is at or before `now`, earliest first; keys stay scheduled
    pub fn due(&self, now: Instant) -> Vec<K> {
        self.deadlines
            .iter()
            .take_while(|((at, _), _)| *at <= now)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn deadline(&self, key: &K) -> Option<Instant> {
        self.index.get(key).map(|(at, _)| *at)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(at, _)| *at)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_due_in_deadline_order() {
        let mut queue = DelayQueue::new();
        let now = Instant::now();
        queue.schedule("late", now + Duration::from_secs(4));
        queue.schedule("early", now + Duration::from_secs(1));
        queue.schedule("also_early", now + Duration::from_secs(1));

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(queue.due(now).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(queue.due(Instant::now()), vec!["early", "also_early"]);
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_deadline() {
        let mut queue = DelayQueue::new();
        let now = Instant::now();
        queue.schedule(1u32, now + Duration::from_secs(1));
        queue.schedule(1u32, now + Duration::from_secs(8));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.deadline(&1), Some(now + Duration::from_secs(8)));
        assert!(queue.due(now + Duration::from_secs(2)).is_empty());

        assert!(queue.cancel(&1));
        assert!(!queue.cancel(&1));
        assert!(queue.is_empty());
        assert_eq!(queue.next_deadline(), None);
    }
}
