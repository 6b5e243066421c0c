// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Keyed token buckets for command and connection rate limiting.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

/// Token-bucket limiter keyed by client identity (UUID for commands,
/// IP for connections). Entries idle for ten minutes are pruned on the
/// next access.
pub struct RateLimiter<K: Eq + Hash + Clone> {
    burst: f64,
    per_sec: f64,
    buckets: Mutex<HashMap<K, Bucket>>,
}

const PRUNE_IDLE_SECS: u64 = 600;

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(burst: u32, per_sec: f64) -> Self {
        Self {
            burst: burst as f64,
            per_sec,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `key`. Returns false when the bucket is empty.
    pub fn try_acquire(&self, key: &K) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");

        if buckets.len() > 64 {
            buckets.retain(|_, b| now.duration_since(b.last_used).as_secs() < PRUNE_IDLE_SECS);
        }

        let bucket = buckets.entry(key.clone()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
            last_used: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_sec).min(self.burst);
        bucket.last_refill = now;
        bucket.last_used = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop the bucket for `key` (e.g. when its session is destroyed).
    pub fn forget(&self, key: &K) {
        self.buckets
            .lock()
            .expect("rate limiter mutex poisoned")
            .remove(key);
    }
}
