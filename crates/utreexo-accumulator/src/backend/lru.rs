//! Least-recently-used map shared by the caching backends.

use indexmap::IndexMap;
use std::collections::VecDeque;

/// Map keyed by position or page number that hands out its least recently
/// used entry in constant amortized time.
///
/// Every use stamps the entry and queues `(key, stamp)`. A queued pair whose
/// stamp no longer matches its entry is stale and skipped.
pub(crate) struct Lru<V> {
    entries: IndexMap<u64, (V, u64)>,
    recency: VecDeque<(u64, u64)>,
    clock: u64,
}

impl<V> Lru<V> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity),
            recency: VecDeque::with_capacity(capacity),
            clock: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn enqueue(&mut self, key: u64, stamp: u64) {
        self.recency.push_back((key, stamp));
        if self.recency.len() > 2 * self.entries.len() + 32 {
            let entries = &self.entries;
            self.recency
                .retain(|(key, stamp)| entries.get(key).is_some_and(|(_, current)| current == stamp));
        }
    }

    /// Returns the value of `key`, marking it most recently used.
    pub fn get_mut(&mut self, key: u64) -> Option<&mut V> {
        let index = self.entries.get_index_of(&key)?;
        let stamp = self.tick();
        self.entries[index].1 = stamp;
        self.enqueue(key, stamp);
        Some(&mut self.entries[index].0)
    }

    /// Returns the value of `key` without changing its recency.
    pub fn peek_mut(&mut self, key: u64) -> Option<&mut V> {
        self.entries.get_mut(&key).map(|(value, _)| value)
    }

    /// Inserts `value` as the most recently used entry.
    pub fn insert(&mut self, key: u64, value: V) -> Option<V> {
        let stamp = self.tick();
        let previous = self.entries.insert(key, (value, stamp)).map(|(value, _)| value);
        self.enqueue(key, stamp);
        previous
    }

    /// Removes and returns the least recently used entry.
    pub fn pop_lru(&mut self) -> Option<(u64, V)> {
        while let Some((key, stamp)) = self.recency.pop_front() {
            if self.entries.get(&key).is_some_and(|(_, current)| *current == stamp) {
                return self.entries.swap_remove(&key).map(|(value, _)| (key, value));
            }
        }
        None
    }

    pub fn retain(&mut self, mut keep: impl FnMut(u64, &mut V) -> bool) {
        self.entries.retain(|key, (value, _)| keep(*key, value));
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u64, &mut V)> {
        self.entries.iter_mut().map(|(key, (value, _))| (*key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_in_order_of_last_use() {
        let mut lru = Lru::with_capacity(4);
        for key in 0..4 {
            lru.insert(key, key * 10);
        }
        assert_eq!(lru.get_mut(0), Some(&mut 0));
        assert_eq!(lru.peek_mut(1), Some(&mut 10));
        lru.insert(2, 21);

        assert_eq!(lru.pop_lru(), Some((1, 10)));
        assert_eq!(lru.pop_lru(), Some((3, 30)));
        assert_eq!(lru.pop_lru(), Some((0, 0)));
        assert_eq!(lru.pop_lru(), Some((2, 21)));
        assert_eq!(lru.pop_lru(), None);
        assert_eq!(lru.len(), 0);
    }

    #[test]
    fn order_survives_compaction_and_retain() {
        let mut lru = Lru::with_capacity(8);
        for key in 0..8 {
            lru.insert(key, ());
        }
        // Plenty of touches to force the queue to be compacted several times.
        for round in 0..100u64 {
            lru.get_mut(round % 4);
        }
        lru.retain(|key, _| key != 5);

        let order: Vec<u64> = std::iter::from_fn(|| lru.pop_lru().map(|(key, _)| key)).collect();
        assert_eq!(order, vec![4, 6, 7, 0, 1, 2, 3]);
    }
}
