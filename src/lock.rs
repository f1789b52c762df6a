//! TTL-bounded exclusive locks with owner fencing.
//!
//! Coarse pessimistic guard around the optimistic version checks in the
//! inventory engine and the payment settle path. Entries carry a unique
//! owner token; release is compare-and-delete so a holder that outlived
//! its TTL cannot release a lock re-acquired by another worker.
//!
//! Correctness never rests on these locks alone: the database version
//! column is the guarantee that survives TTL expiry.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default TTL: long enough for a DB transaction plus one provider
/// round-trip.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Retry pacing for [`LockManager::acquire_with_retry`].
const RETRY_PAUSE: Duration = Duration::from_millis(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock busy: {key}")]
    Busy { key: String },
}

/// Proof of lock ownership. Must be passed back to [`LockManager::release`];
/// a token for an expired (and possibly re-acquired) lock releases nothing.
#[derive(Debug, Clone)]
pub struct LockToken {
    pub key: String,
    token: String,
}

struct LockEntry {
    token: String,
    expires_at: Instant,
}

/// Named-lock table. Keys follow the `inventory:product:<id>` /
/// `inventory:sku:<id>` / `payment:settle:<payment_no>` vocabulary.
pub struct LockManager {
    entries: DashMap<String, LockEntry>,
}

pub fn product_key(product_id: i64) -> String {
    format!("inventory:product:{}", product_id)
}

pub fn sku_key(sku_id: i64) -> String {
    format!("inventory:sku:{}", sku_id)
}

pub fn settle_key(payment_no: &str) -> String {
    format!("payment:settle:{}", payment_no)
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Try once to take the lock. An expired entry is claimable by any
    /// caller; a live entry yields `Busy`.
    pub fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let token = uuid::Uuid::new_v4().to_string();
        let now = Instant::now();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(LockEntry {
                        token: token.clone(),
                        expires_at: now + ttl,
                    });
                    Ok(LockToken {
                        key: key.to_string(),
                        token,
                    })
                } else {
                    Err(LockError::Busy {
                        key: key.to_string(),
                    })
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    token: token.clone(),
                    expires_at: now + ttl,
                });
                Ok(LockToken {
                    key: key.to_string(),
                    token,
                })
            }
        }
    }

    /// Acquire with bounded waiting. Gives up once `deadline` has elapsed
    /// and surfaces the retryable `Busy` error.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        ttl: Duration,
        deadline: Duration,
    ) -> Result<LockToken, LockError> {
        let started = Instant::now();
        loop {
            match self.acquire(key, ttl) {
                Ok(token) => return Ok(token),
                Err(busy) => {
                    if started.elapsed() >= deadline {
                        return Err(busy);
                    }
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
            }
        }
    }

    /// Compare-and-delete. Returns true only when the stored token matches
    /// the caller's, i.e. the caller still owned the lock.
    pub fn release(&self, token: &LockToken) -> bool {
        self.entries
            .remove_if(&token.key, |_, entry| entry.token == token.token)
            .is_some()
    }

    /// Drop expired entries. Acquisition already treats them as claimable;
    /// this just bounds table growth under churn.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let locks = LockManager::new();
        let token = locks.acquire("inventory:product:1", DEFAULT_LOCK_TTL).unwrap();
        assert!(matches!(
            locks.acquire("inventory:product:1", DEFAULT_LOCK_TTL),
            Err(LockError::Busy { .. })
        ));
        assert!(locks.release(&token));
        assert!(locks.acquire("inventory:product:1", DEFAULT_LOCK_TTL).is_ok());
    }

    #[test]
    fn test_independent_keys_do_not_contend() {
        let locks = LockManager::new();
        let _a = locks.acquire(&product_key(1), DEFAULT_LOCK_TTL).unwrap();
        assert!(locks.acquire(&product_key(2), DEFAULT_LOCK_TTL).is_ok());
    }

    #[test]
    fn test_expired_lock_is_claimable() {
        let locks = LockManager::new();
        let stale = locks
            .acquire("payment:settle:PAY1", Duration::from_millis(0))
            .unwrap();
        // TTL elapsed, a new owner may claim the key
        let fresh = locks
            .acquire("payment:settle:PAY1", DEFAULT_LOCK_TTL)
            .unwrap();
        // The stale holder's token no longer releases anything
        assert!(!locks.release(&stale));
        assert!(locks.release(&fresh));
    }

    #[test]
    fn test_release_requires_matching_token() {
        let locks = LockManager::new();
        let token = locks.acquire("k", DEFAULT_LOCK_TTL).unwrap();
        let forged = LockToken {
            key: "k".to_string(),
            token: "not-the-owner".to_string(),
        };
        assert!(!locks.release(&forged));
        assert!(locks.release(&token));
    }

    #[test]
    fn test_purge_expired() {
        let locks = LockManager::new();
        let _stale = locks.acquire("a", Duration::from_millis(0)).unwrap();
        let _live = locks.acquire("b", DEFAULT_LOCK_TTL).unwrap();
        locks.purge_expired();
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_with_retry_times_out() {
        let locks = LockManager::new();
        let _held = locks.acquire("hot", DEFAULT_LOCK_TTL).unwrap();
        let result = locks
            .acquire_with_retry("hot", DEFAULT_LOCK_TTL, Duration::from_millis(30))
            .await;
        assert!(matches!(result, Err(LockError::Busy { .. })));
    }

    #[tokio::test]
    async fn test_acquire_with_retry_succeeds_after_release() {
        let locks = std::sync::Arc::new(LockManager::new());
        let held = locks.acquire("hot", DEFAULT_LOCK_TTL).unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2
                .acquire_with_retry("hot", DEFAULT_LOCK_TTL, Duration::from_secs(1))
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release(&held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[test]
    fn test_key_vocabulary() {
        assert_eq!(product_key(7), "inventory:product:7");
        assert_eq!(sku_key(9), "inventory:sku:9");
        assert_eq!(settle_key("PAYX"), "payment:settle:PAYX");
    }
}
