//! Tiered translation cache.
//! `CacheStore` enforces the tier hierarchy (USER_SUBMITTED > PRIORITY >
//! GENERAL), TTLs, usage counters and GENERAL capacity on top of a
//! `CacheBackend`. A key lives in exactly one tier at a time; every
//! read-modify-write for a key runs under that key's stripe lock.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::analyzer::{DailyUsage, PhraseUsageStats, UserSighting};
use crate::error::StoreError;
use crate::translate::{PhraseId, Tier, TranslationEntry, TranslationKey};

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Physical storage for cache entries. Keys are unique across tiers.
pub trait CacheBackend: Send + Sync {
    /// Entry for `key` in whichever tier holds it, expired or not.
    fn load(&self, key: &TranslationKey) -> Result<Option<TranslationEntry>, StoreError>;
    /// Insert or replace the entry for `key`; `entry.tier` decides placement.
    fn save(&self, key: &TranslationKey, entry: &TranslationEntry) -> Result<(), StoreError>;
    fn remove(&self, key: &TranslationKey) -> Result<bool, StoreError>;
    /// Drop TTL-honoring entries with `expires_at <= now`.
    fn purge_expired(&self, now: chrono::DateTime<Utc>) -> Result<usize, StoreError>;
    /// Key of the least recently used entry of `tier`, ties broken by lowest
    /// `use_count`. Nothing is removed.
    fn least_recent(&self, tier: Tier) -> Result<Option<TranslationKey>, StoreError>;
    fn count(&self, tier: Tier) -> Result<usize, StoreError>;
}

/// Persistence for analyzer state.
pub trait UsageRepository: Send + Sync {
    fn save_stats(&self, stats: &[PhraseUsageStats]) -> Result<(), StoreError>;
    fn save_daily(&self, rows: &[DailyUsage]) -> Result<(), StoreError>;
    fn load_stats(&self) -> Result<Vec<PhraseUsageStats>, StoreError>;
    fn load_daily_since(&self, since: NaiveDate) -> Result<Vec<DailyUsage>, StoreError>;
    /// Idempotent: a sighting already stored is ignored.
    fn save_users(&self, sightings: &[UserSighting]) -> Result<(), StoreError>;
    /// Lifetime sightings plus per-day sightings from `since` on.
    fn load_users_since(&self, since: NaiveDate) -> Result<Vec<UserSighting>, StoreError>;
    /// Drop stats and sightings for phrases the analyzer stopped tracking.
    fn forget_phrases(&self, ids: &[PhraseId]) -> Result<usize, StoreError>;
    /// Drop daily rows and daily sightings older than `before`.
    fn prune_daily_before(&self, before: NaiveDate) -> Result<usize, StoreError>;
}

/// What a `put` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// No previous entry.
    Inserted,
    /// Replaced an entry of the same or a lower tier.
    Replaced { previous: Tier },
    /// A higher tier already holds the key; only its counter moved.
    Shadowed { existing: Tier },
}

/// Entry counts per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierSizes {
    pub user_submitted: usize,
    pub priority: usize,
    pub general: usize,
}

/// Striped mutexes keyed on hash(phrase_id, target).
struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    fn new(count: usize) -> Self {
        Self {
            stripes: (0..count.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, key: &TranslationKey) -> &Mutex<()> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(key.phrase_id.as_bytes());
        hasher.update(b"|");
        hasher.update(key.target.code.as_bytes());
        let hash = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        let idx = (u64::from_le_bytes(head) % self.stripes.len() as u64) as usize;
        &self.stripes[idx]
    }
}

/// The cache service shared by the orchestrator, warmer and pipeline.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    locks: KeyLocks,
    general_capacity: usize,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, general_capacity: usize, lock_stripes: usize) -> Self {
        Self {
            backend,
            locks: KeyLocks::new(lock_stripes),
            general_capacity: general_capacity.max(1),
        }
    }

    /// Run `op` on the blocking pool. Backends may wait on disk and stripe
    /// locks, so async callers go through here.
    pub async fn run_blocking<T, F>(store: Arc<Self>, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&CacheStore) -> Result<T, StoreError> + Send + 'static,
    {
        tokio::task::spawn_blocking(move || op(&store)).await?
    }

    /// In-memory store with default striping.
    pub fn in_memory(general_capacity: usize) -> Self {
        Self::new(Arc::new(MemoryBackend::new()), general_capacity, 256)
    }

    /// Entry for `key` if it currently lives in `tier` and has not expired.
    /// A hit bumps `use_count` and `last_used`.
    pub fn get(&self, key: &TranslationKey, tier: Tier) -> Result<Option<TranslationEntry>, StoreError> {
        let _guard = self.locks.stripe(key).lock();
        self.get_locked(key, |t| t == tier)
    }

    /// Walk `tiers` in order and return the first live hit.
    pub fn multi_get(
        &self,
        key: &TranslationKey,
        tiers: &[Tier],
    ) -> Result<Option<(TranslationEntry, Tier)>, StoreError> {
        let _guard = self.locks.stripe(key).lock();
        // A key lives in one tier only, so order matters only for filtering.
        Ok(self
            .get_locked(key, |t| tiers.contains(&t))?
            .map(|entry| {
                let tier = entry.tier;
                (entry, tier)
            }))
    }

    fn get_locked(
        &self,
        key: &TranslationKey,
        accept: impl Fn(Tier) -> bool,
    ) -> Result<Option<TranslationEntry>, StoreError> {
        let Some(mut entry) = self.backend.load(key)? else {
            return Ok(None);
        };
        if !accept(entry.tier) {
            return Ok(None);
        }
        let now = Utc::now();
        if entry.is_expired(now) {
            self.backend.remove(key)?;
            debug!(%key, tier = %entry.tier, "expired entry dropped on read");
            return Ok(None);
        }
        entry.use_count += 1;
        entry.last_used = now;
        self.backend.save(key, &entry)?;
        Ok(Some(entry))
    }

    /// Write `entry` under `key` honoring the tier hierarchy.
    pub fn put(&self, key: &TranslationKey, mut entry: TranslationEntry) -> Result<PutOutcome, StoreError> {
        let outcome = {
            let _guard = self.locks.stripe(key).lock();
            let now = Utc::now();
            match self.backend.load(key)?.filter(|e| !e.is_expired(now)) {
                Some(mut existing) if existing.tier > entry.tier => {
                    existing.use_count += 1;
                    self.backend.save(key, &existing)?;
                    PutOutcome::Shadowed {
                        existing: existing.tier,
                    }
                }
                Some(existing) => {
                    entry.use_count = entry.use_count.max(existing.use_count);
                    self.backend.save(key, &entry)?;
                    PutOutcome::Replaced {
                        previous: existing.tier,
                    }
                }
                None => {
                    self.backend.save(key, &entry)?;
                    PutOutcome::Inserted
                }
            }
        };

        if entry.tier == Tier::General && !matches!(outcome, PutOutcome::Shadowed { .. }) {
            self.enforce_general_capacity()?;
        }
        Ok(outcome)
    }

    /// Move an existing GENERAL entry to PRIORITY (or refresh a PRIORITY
    /// entry's expiry), keeping its text. Returns the tier the key ends up
    /// in, or `None` when the key is absent or expired.
    pub fn promote_to_priority(&self, key: &TranslationKey, ttl: Duration) -> Result<Option<Tier>, StoreError> {
        let _guard = self.locks.stripe(key).lock();
        let Some(mut entry) = self.backend.load(key)? else {
            return Ok(None);
        };
        let now = Utc::now();
        if entry.is_expired(now) {
            self.backend.remove(key)?;
            return Ok(None);
        }
        if entry.tier == Tier::UserSubmitted {
            return Ok(Some(Tier::UserSubmitted));
        }
        let fresh = TranslationEntry::expiring(
            Tier::Priority,
            entry.source_text.clone(),
            std::mem::take(&mut entry.translated_text),
            entry.source_language_detected.take(),
            now,
            ttl,
        );
        let promoted = TranslationEntry {
            created_at: entry.created_at.min(now),
            use_count: entry.use_count,
            last_used: entry.last_used,
            ..fresh
        };
        self.backend.save(key, &promoted)?;
        Ok(Some(Tier::Priority))
    }

    /// Replace whatever is stored for `key` with a user-submitted entry.
    /// Counters are not bumped.
    pub fn put_user_submitted(&self, key: &TranslationKey, entry: TranslationEntry) -> Result<(), StoreError> {
        let _guard = self.locks.stripe(key).lock();
        self.backend.save(key, &entry)
    }

    /// Remove every expired GENERAL/PRIORITY entry.
    pub fn evict_expired(&self) -> Result<usize, StoreError> {
        let removed = self.backend.purge_expired(Utc::now())?;
        if removed > 0 {
            info!(removed, "cache expiry sweep");
        }
        Ok(removed)
    }

    /// Evict GENERAL entries until the tier fits. Each victim is re-read
    /// under its own stripe lock and skipped if it left the tier meanwhile.
    fn enforce_general_capacity(&self) -> Result<(), StoreError> {
        while self.backend.count(Tier::General)? > self.general_capacity {
            let Some(victim) = self.backend.least_recent(Tier::General)? else {
                break;
            };
            let _guard = self.locks.stripe(&victim).lock();
            match self.backend.load(&victim)? {
                Some(entry) if entry.tier == Tier::General => {
                    self.backend.remove(&victim)?;
                    debug!(key = %victim, "general tier at capacity, evicted");
                }
                _ => debug!(key = %victim, "eviction candidate changed tier, skipped"),
            }
        }
        Ok(())
    }

    pub fn sizes(&self) -> Result<TierSizes, StoreError> {
        Ok(TierSizes {
            user_submitted: self.backend.count(Tier::UserSubmitted)?,
            priority: self.backend.count(Tier::Priority)?,
            general: self.backend.count(Tier::General)?,
        })
    }
}
