//! Time-boxed cache entries.
//!
//! Caches in gantry are advisory: every mutation invalidates, every
//! miss falls back to storage. This module only provides the TTL
//! bookkeeping; the maps themselves live with their owners.

use std::time::{Duration, Instant};

/// A cached value stamped with its insertion time.
#[derive(Debug, Clone)]
pub struct TimedEntry<T> {
    value: T,
    inserted_at: Instant,
    ttl: Duration,
}

impl<T> TimedEntry<T> {
    /// Wrap a value with the given time-to-live.
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            ttl,
        }
    }

    /// Whether the entry has outlived its TTL.
    pub fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }

    /// The value, if still fresh.
    pub fn get(&self) -> Option<&T> {
        if self.is_expired() {
            None
        } else {
            Some(&self.value)
        }
    }

    /// Unconditional access, freshness aside.
    pub fn value(&self) -> &T {
        &self.value
    }
}
