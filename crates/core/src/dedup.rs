use crate::message::MessageId;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

pub const DEFAULT_MAX_CACHE_SIZE: usize = 1000;
pub const DEFAULT_EVICT_BATCH: usize = 100;

/// Bounded record of message ids that have already been processed.
///
/// Once the cache grows past `max_size`, the `evict_batch` oldest ids (in
/// insertion order) are forgotten together.
#[derive(Debug)]
pub struct DedupCache {
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    max_size: usize,
    evict_batch: usize,
    evictions: u64,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_CACHE_SIZE, DEFAULT_EVICT_BATCH)
    }
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache bounded at `max_size` ids. `evict_batch` is clamped to
    /// `1..=max_size`.
    pub fn with_capacity(max_size: usize, evict_batch: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            seen: HashSet::with_capacity(max_size + 1),
            order: VecDeque::with_capacity(max_size + 1),
            max_size,
            evict_batch: evict_batch.clamp(1, max_size),
            evictions: 0,
        }
    }

    /// Returns `true` if `id` was already recorded. Otherwise records it and
    /// returns `false`.
    pub fn seen(&mut self, id: &MessageId) -> bool {
        if self.seen.contains(id) {
            return true;
        }
        self.seen.insert(id.clone());
        self.order.push_back(id.clone());
        if self.seen.len() > self.max_size {
            self.evict_oldest();
        }
        false
    }

    fn evict_oldest(&mut self) {
        let mut evicted = 0;
        while evicted < self.evict_batch {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.seen.remove(&oldest);
            evicted += 1;
        }
        self.evictions += evicted as u64;
        debug!(evicted, remaining = self.seen.len(), "Evicted oldest message ids");
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Total number of ids forgotten through eviction.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}
