//! TTL seen-sets backing the anti-replay and idempotency checks.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};

/// First-writer-wins set of string keys with a fixed TTL.
///
/// Expired entries are claimable again and are additionally swept by
/// [`purge_expired`](TtlSeenStore::purge_expired) so the map does not grow
/// without bound between expiries.
pub struct TtlSeenStore {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl TtlSeenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Record `key`; returns false when a live entry already exists
    /// (duplicate within the TTL window).
    pub fn insert_if_absent(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() <= now {
                    occupied.insert(now + self.ttl);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(now + self.ttl);
                true
            }
        }
    }

    /// Live membership check without recording.
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|expiry| *expiry > Instant::now())
            .unwrap_or(false)
    }

    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
