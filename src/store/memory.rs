//! In-memory cache backend.
//! USER_SUBMITTED and PRIORITY live in plain maps; GENERAL lives in an LRU
//! list so capacity eviction can pop from the cold end.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;

use super::CacheBackend;
use crate::error::StoreError;
use crate::translate::{Tier, TranslationEntry, TranslationKey};

struct Tiers {
    user_submitted: HashMap<TranslationKey, TranslationEntry>,
    priority: HashMap<TranslationKey, TranslationEntry>,
    /// Capacity is enforced by `CacheStore`, so the list itself is unbounded.
    general: LruCache<TranslationKey, TranslationEntry>,
}

impl Tiers {
    fn take(&mut self, key: &TranslationKey) -> Option<TranslationEntry> {
        self.user_submitted
            .remove(key)
            .or_else(|| self.priority.remove(key))
            .or_else(|| self.general.pop(key))
    }
}

pub struct MemoryBackend {
    inner: Mutex<Tiers>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Tiers {
                user_submitted: HashMap::new(),
                priority: HashMap::new(),
                general: LruCache::unbounded(),
            }),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for MemoryBackend {
    fn load(&self, key: &TranslationKey) -> Result<Option<TranslationEntry>, StoreError> {
        let tiers = self.inner.lock();
        if let Some(entry) = tiers.user_submitted.get(key) {
            return Ok(Some(entry.clone()));
        }
        if let Some(entry) = tiers.priority.get(key) {
            return Ok(Some(entry.clone()));
        }
        Ok(tiers.general.peek(key).cloned())
    }

    fn save(&self, key: &TranslationKey, entry: &TranslationEntry) -> Result<(), StoreError> {
        let mut tiers = self.inner.lock();
        tiers.take(key);
        let key = key.clone();
        let entry = entry.clone();
        match entry.tier {
            Tier::UserSubmitted => {
                tiers.user_submitted.insert(key, entry);
            }
            Tier::Priority => {
                tiers.priority.insert(key, entry);
            }
            Tier::General => {
                tiers.general.put(key, entry);
            }
        }
        Ok(())
    }

    fn remove(&self, key: &TranslationKey) -> Result<bool, StoreError> {
        Ok(self.inner.lock().take(key).is_some())
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut tiers = self.inner.lock();
        let before = tiers.priority.len();
        tiers.priority.retain(|_, e| !e.is_expired(now));
        let mut removed = before - tiers.priority.len();

        let general = &mut tiers.general;
        let expired: Vec<TranslationKey> = general
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            general.pop(key);
        }
        removed += expired.len();
        Ok(removed)
    }

    fn least_recent(&self, tier: Tier) -> Result<Option<TranslationKey>, StoreError> {
        let tiers = self.inner.lock();
        let victim = match tier {
            Tier::General => {
                let general = &tiers.general;
                // Cold end first; among equal `last_used`, lowest `use_count`.
                let mut cold = general.iter().rev();
                let Some((first_key, first)) = cold.next() else {
                    return Ok(None);
                };
                let oldest = first.last_used;
                let mut best = (first_key, first.use_count);
                for (k, e) in cold.take_while(|(_, e)| e.last_used == oldest) {
                    if e.use_count < best.1 {
                        best = (k, e.use_count);
                    }
                }
                best.0.clone()
            }
            Tier::Priority => {
                let Some(key) = tiers
                    .priority
                    .iter()
                    .min_by_key(|(_, e)| (e.last_used, e.use_count))
                    .map(|(k, _)| k.clone())
                else {
                    return Ok(None);
                };
                key
            }
            Tier::UserSubmitted => return Ok(None),
        };
        Ok(Some(victim))
    }

    fn count(&self, tier: Tier) -> Result<usize, StoreError> {
        let tiers = self.inner.lock();
        Ok(match tier {
            Tier::UserSubmitted => tiers.user_submitted.len(),
            Tier::Priority => tiers.priority.len(),
            Tier::General => tiers.general.len(),
        })
    }
}
