// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Performance counters incremented by queue operations.

use dashmap::DashMap;

/// Collaborator receiving counter increments.
pub trait Counters: Send + Sync {
    fn increment_one(&self, name: &str);
}

/// Discards all increments.
#[derive(Debug, Clone, Default)]
pub struct NullCounters;

impl Counters for NullCounters {
    fn increment_one(&self, _name: &str) {}
}

/// Keeps counter values in memory.
#[derive(Debug, Default)]
pub struct CachedCounters {
    values: DashMap<String, u64>,
}

impl CachedCounters {
    pub fn new() -> CachedCounters {
        CachedCounters::default()
    }

    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).map(|v| *v).unwrap_or_default()
    }

    pub fn clear(&self) {
        self.values.clear();
    }
}

impl Counters for CachedCounters {
    fn increment_one(&self, name: &str) {
        *self.values.entry(name.to_owned()).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_counters_accumulate() {
        let counters = CachedCounters::new();
        counters.increment_one("queue.orders.sent_messages");
        counters.increment_one("queue.orders.sent_messages");

        assert_eq!(counters.get("queue.orders.sent_messages"), 2);
        assert_eq!(counters.get("queue.orders.received_messages"), 0);

        counters.clear();
        assert_eq!(counters.get("queue.orders.sent_messages"), 0);
    }
}
