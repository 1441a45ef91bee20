//! Persistent cache backend and analyzer state backed by SQLite.
//! One table holds all three tiers (`tier` column); usage statistics and the
//! per-day rollup live alongside so learning survives restarts.

use std::path::Path;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::{CacheBackend, UsageRepository};
use crate::analyzer::{DailyUsage, PhraseUsageStats, UserSighting};
use crate::error::StoreError;
use crate::languages;
use crate::translate::{PhraseId, Tier, TranslationEntry, TranslationKey};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS translation_cache (
    key_hash TEXT NOT NULL,
    target_lang TEXT NOT NULL,
    phrase TEXT NOT NULL,
    translation TEXT NOT NULL,
    tier INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER,
    last_used INTEGER NOT NULL,
    uses INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL,
    detected_lang TEXT,
    PRIMARY KEY (key_hash, target_lang)
);
CREATE INDEX IF NOT EXISTS idx_cache_tier_recency
    ON translation_cache(tier, last_used, uses);
CREATE INDEX IF NOT EXISTS idx_cache_expires
    ON translation_cache(expires_at);

CREATE TABLE IF NOT EXISTS phrase_usage_stats (
    phrase_hash TEXT PRIMARY KEY,
    phrase TEXT NOT NULL,
    total_uses INTEGER NOT NULL,
    distinct_users INTEGER NOT NULL,
    first_seen INTEGER NOT NULL,
    last_used INTEGER NOT NULL,
    priority_score REAL NOT NULL DEFAULT 0,
    is_priority_cached INTEGER NOT NULL DEFAULT 0,
    below_threshold_since INTEGER,
    languages TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS daily_usage (
    day TEXT NOT NULL,
    phrase_hash TEXT NOT NULL,
    count INTEGER NOT NULL,
    distinct_users INTEGER NOT NULL,
    PRIMARY KEY (day, phrase_hash)
);

-- day is '' for lifetime sightings
CREATE TABLE IF NOT EXISTS usage_users (
    phrase_hash TEXT NOT NULL,
    day TEXT NOT NULL,
    user_hash TEXT NOT NULL,
    PRIMARY KEY (phrase_hash, day, user_hash)
);
";

/// SQLite-backed cache tiers plus usage persistence.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
}

impl SqliteBackend {
    /// Open (or create) the database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        // WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %db_path.display(), "sqlite cache opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64, table: &'static str) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| StoreError::Corrupt {
        table,
        detail: format!("bad timestamp {ms}"),
    })
}

fn phrase_id(hex: &str, table: &'static str) -> Result<PhraseId, StoreError> {
    PhraseId::from_hex(hex).ok_or_else(|| StoreError::Corrupt {
        table,
        detail: format!("bad phrase hash {hex}"),
    })
}

/// Raw `translation_cache` row before validation.
struct CacheRow {
    key_hash: String,
    target_lang: String,
    phrase: String,
    translation: String,
    tier: i64,
    created_at: i64,
    expires_at: Option<i64>,
    last_used: i64,
    uses: i64,
    confidence: f64,
    detected_lang: Option<String>,
}

const CACHE_COLUMNS: &str = "key_hash, target_lang, phrase, translation, tier, created_at, \
                             expires_at, last_used, uses, confidence, detected_lang";

impl CacheRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key_hash: row.get(0)?,
            target_lang: row.get(1)?,
            phrase: row.get(2)?,
            translation: row.get(3)?,
            tier: row.get(4)?,
            created_at: row.get(5)?,
            expires_at: row.get(6)?,
            last_used: row.get(7)?,
            uses: row.get(8)?,
            confidence: row.get(9)?,
            detected_lang: row.get(10)?,
        })
    }

    fn key(&self) -> Result<TranslationKey, StoreError> {
        let target = languages::lookup(&self.target_lang).ok_or_else(|| StoreError::Corrupt {
            table: "translation_cache",
            detail: format!("unknown language {}", self.target_lang),
        })?;
        Ok(TranslationKey::new(phrase_id(&self.key_hash, "translation_cache")?, target))
    }

    fn into_entry(self) -> Result<TranslationEntry, StoreError> {
        let tier = Tier::from_i64(self.tier).ok_or_else(|| StoreError::Corrupt {
            table: "translation_cache",
            detail: format!("unknown tier {}", self.tier),
        })?;
        Ok(TranslationEntry {
            translated_text: self.translation,
            source_text: self.phrase,
            tier,
            created_at: from_millis(self.created_at, "translation_cache")?,
            expires_at: self
                .expires_at
                .map(|ms| from_millis(ms, "translation_cache"))
                .transpose()?,
            last_used: from_millis(self.last_used, "translation_cache")?,
            use_count: self.uses.max(0) as u64,
            confidence: self.confidence as f32,
            source_language_detected: self.detected_lang,
        })
    }
}

impl CacheBackend for SqliteBackend {
    fn load(&self, key: &TranslationKey) -> Result<Option<TranslationEntry>, StoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {CACHE_COLUMNS} FROM translation_cache
                     WHERE key_hash = ?1 AND target_lang = ?2"
                ),
                params![key.phrase_id.to_hex(), key.target.code],
                CacheRow::from_row,
            )
            .optional()?;
        row.map(CacheRow::into_entry).transpose()
    }

    fn save(&self, key: &TranslationKey, entry: &TranslationEntry) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO translation_cache
             (key_hash, target_lang, phrase, translation, tier, created_at,
              expires_at, last_used, uses, confidence, detected_lang)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                key.phrase_id.to_hex(),
                key.target.code,
                entry.source_text,
                entry.translated_text,
                entry.tier.as_i64(),
                millis(entry.created_at),
                entry.expires_at.map(millis),
                millis(entry.last_used),
                entry.use_count as i64,
                entry.confidence as f64,
                entry.source_language_detected,
            ],
        )?;
        Ok(())
    }

    fn remove(&self, key: &TranslationKey) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM translation_cache WHERE key_hash = ?1 AND target_lang = ?2",
            params![key.phrase_id.to_hex(), key.target.code],
        )?;
        Ok(n > 0)
    }

    fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM translation_cache
             WHERE tier IN (?1, ?2) AND expires_at IS NOT NULL AND expires_at <= ?3",
            params![Tier::General.as_i64(), Tier::Priority.as_i64(), millis(now)],
        )?;
        Ok(n)
    }

    fn least_recent(&self, tier: Tier) -> Result<Option<TranslationKey>, StoreError> {
        if tier == Tier::UserSubmitted {
            return Ok(None);
        }
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {CACHE_COLUMNS} FROM translation_cache WHERE tier = ?1
                     ORDER BY last_used ASC, uses ASC LIMIT 1"
                ),
                params![tier.as_i64()],
                CacheRow::from_row,
            )
            .optional()?;
        row.map(|row| row.key()).transpose()
    }

    fn count(&self, tier: Tier) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM translation_cache WHERE tier = ?1",
            params![tier.as_i64()],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as usize)
    }
}

impl UsageRepository for SqliteBackend {
    fn save_stats(&self, stats: &[PhraseUsageStats]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO phrase_usage_stats
                 (phrase_hash, phrase, total_uses, distinct_users, first_seen, last_used,
                  priority_score, is_priority_cached, below_threshold_since, languages)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for s in stats {
                stmt.execute(params![
                    s.phrase_id.to_hex(),
                    s.phrase,
                    s.total_uses as i64,
                    s.distinct_users as i64,
                    millis(s.first_seen),
                    millis(s.last_used),
                    s.priority_score,
                    s.is_priority_cached,
                    s.below_threshold_since.map(millis),
                    s.languages.join(","),
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = stats.len(), "usage stats flushed");
        Ok(())
    }

    fn save_daily(&self, rows: &[DailyUsage]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO daily_usage (day, phrase_hash, count, distinct_users)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for r in rows {
                stmt.execute(params![
                    r.day.to_string(),
                    r.phrase_id.to_hex(),
                    r.count as i64,
                    r.distinct_users as i64,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_stats(&self) -> Result<Vec<PhraseUsageStats>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT phrase_hash, phrase, total_uses, distinct_users, first_seen, last_used,
                    priority_score, is_priority_cached, below_threshold_since, languages
             FROM phrase_usage_stats",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, Option<i64>>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(hash, phrase, total, users, first, last, score, cached, below, langs)| {
                Ok(PhraseUsageStats {
                    phrase_id: phrase_id(&hash, "phrase_usage_stats")?,
                    phrase,
                    total_uses: total.max(0) as u64,
                    distinct_users: users.max(0) as u64,
                    first_seen: from_millis(first, "phrase_usage_stats")?,
                    last_used: from_millis(last, "phrase_usage_stats")?,
                    priority_score: score,
                    is_priority_cached: cached,
                    below_threshold_since: below
                        .map(|ms| from_millis(ms, "phrase_usage_stats"))
                        .transpose()?,
                    languages: langs
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                })
            })
            .collect()
    }

    fn load_daily_since(&self, since: NaiveDate) -> Result<Vec<DailyUsage>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT day, phrase_hash, count, distinct_users FROM daily_usage WHERE day >= ?1",
        )?;
        let raw = stmt
            .query_map(params![since.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(day, hash, count, users)| {
                let day = day.parse::<NaiveDate>().map_err(|e| StoreError::Corrupt {
                    table: "daily_usage",
                    detail: format!("bad day {day}: {e}"),
                })?;
                Ok(DailyUsage {
                    day,
                    phrase_id: phrase_id(&hash, "daily_usage")?,
                    count: count.max(0) as u64,
                    distinct_users: users.max(0) as u64,
                })
            })
            .collect()
    }

    fn save_users(&self, sightings: &[UserSighting]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO usage_users (phrase_hash, day, user_hash) VALUES (?1, ?2, ?3)",
            )?;
            for s in sightings {
                stmt.execute(params![
                    s.phrase_id.to_hex(),
                    s.day.map(|d| d.to_string()).unwrap_or_default(),
                    s.user,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_users_since(&self, since: NaiveDate) -> Result<Vec<UserSighting>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT phrase_hash, day, user_hash FROM usage_users WHERE day = '' OR day >= ?1",
        )?;
        let raw = stmt
            .query_map(params![since.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raw.into_iter()
            .map(|(hash, day, user)| {
                let day = if day.is_empty() {
                    None
                } else {
                    Some(day.parse::<NaiveDate>().map_err(|e| StoreError::Corrupt {
                        table: "usage_users",
                        detail: format!("bad day {day}: {e}"),
                    })?)
                };
                Ok(UserSighting {
                    phrase_id: phrase_id(&hash, "usage_users")?,
                    day,
                    user,
                })
            })
            .collect()
    }

    fn forget_phrases(&self, ids: &[PhraseId]) -> Result<usize, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stats = tx.prepare_cached("DELETE FROM phrase_usage_stats WHERE phrase_hash = ?1")?;
            let mut users = tx.prepare_cached("DELETE FROM usage_users WHERE phrase_hash = ?1")?;
            for id in ids {
                let hash = id.to_hex();
                removed += stats.execute(params![hash])?;
                users.execute(params![hash])?;
            }
        }
        tx.commit()?;
        if removed > 0 {
            debug!(removed, "idle phrase stats deleted");
        }
        Ok(removed)
    }

    fn prune_daily_before(&self, before: NaiveDate) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let before = before.to_string();
        let n = conn.execute("DELETE FROM daily_usage WHERE day < ?1", params![before])?;
        conn.execute(
            "DELETE FROM usage_users WHERE day <> '' AND day < ?1",
            params![before],
        )?;
        if n > 0 {
            debug!(removed = n, "daily usage pruned");
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CacheStore;
    use crate::translate::normalize_phrase;
    use std::sync::Arc;
    use std::time::Duration;

    fn key(text: &str, lang: &str) -> TranslationKey {
        TranslationKey::new(normalize_phrase(text).id, languages::lookup(lang).unwrap())
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let k = key("hello world", "es");
        {
            let store = CacheStore::new(Arc::new(SqliteBackend::open(&path).unwrap()), 100, 16);
            let entry = TranslationEntry::expiring(
                Tier::General,
                "hello world",
                "hola mundo",
                Some("en".into()),
                Utc::now(),
                Duration::from_secs(3600),
            );
            store.put(&k, entry).unwrap();
        }
        let store = CacheStore::new(Arc::new(SqliteBackend::open(&path).unwrap()), 100, 16);
        let (entry, tier) = store.multi_get(&k, &Tier::LOOKUP_ORDER).unwrap().unwrap();
        assert_eq!(tier, Tier::General);
        assert_eq!(entry.translated_text, "hola mundo");
        assert_eq!(entry.source_language_detected.as_deref(), Some("en"));
        assert_eq!(entry.use_count, 1);
    }

    #[test]
    fn user_submitted_rows_have_no_expiry() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let k = key("good night", "ja");
        let entry = TranslationEntry::user_submitted("good night", "おやすみ", Utc::now() - chrono::Duration::days(400));
        backend.save(&k, &entry).unwrap();
        assert_eq!(backend.purge_expired(Utc::now()).unwrap(), 0);
        let loaded = backend.load(&k).unwrap().unwrap();
        assert_eq!(loaded.expires_at, None);
        assert_eq!(loaded.tier, Tier::UserSubmitted);
    }

    #[test]
    fn victim_orders_by_recency_then_uses() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let now = Utc::now();
        let mut busy = TranslationEntry::expiring(Tier::General, "a", "A", None, now, Duration::from_secs(60));
        busy.use_count = 9;
        let idle = TranslationEntry::expiring(Tier::General, "b", "B", None, now, Duration::from_secs(60));
        backend.save(&key("a", "es"), &busy).unwrap();
        backend.save(&key("b", "es"), &idle).unwrap();
        assert_eq!(backend.least_recent(Tier::General).unwrap(), Some(key("b", "es")));
        assert_eq!(backend.count(Tier::General).unwrap(), 2);
    }

    #[test]
    fn usage_stats_round_trip() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let phrase = normalize_phrase("see you later");
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap();
        let stats = PhraseUsageStats {
            phrase_id: phrase.id,
            phrase: phrase.text.clone(),
            total_uses: 42,
            distinct_users: 7,
            first_seen: now,
            last_used: now,
            priority_score: 0.55,
            is_priority_cached: true,
            below_threshold_since: None,
            languages: vec!["es".into(), "fr".into()],
        };
        backend.save_stats(std::slice::from_ref(&stats)).unwrap();
        assert_eq!(backend.load_stats().unwrap(), vec![stats]);

        let day = now.date_naive();
        let row = DailyUsage {
            day,
            phrase_id: phrase.id,
            count: 12,
            distinct_users: 3,
        };
        backend.save_daily(std::slice::from_ref(&row)).unwrap();
        assert_eq!(backend.load_daily_since(day).unwrap(), vec![row]);
        assert_eq!(backend.prune_daily_before(day.succ_opt().unwrap()).unwrap(), 1);
    }

    #[test]
    fn user_sightings_are_deduplicated_and_pruned() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let phrase = normalize_phrase("thanks a lot");
        let day = Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap().date_naive();
        let lifetime = UserSighting {
            phrase_id: phrase.id,
            day: None,
            user: "a1".into(),
        };
        let daily = UserSighting {
            day: Some(day),
            ..lifetime.clone()
        };
        backend.save_users(&[lifetime.clone(), daily.clone()]).unwrap();
        backend.save_users(&[lifetime.clone()]).unwrap();
        assert_eq!(backend.load_users_since(day).unwrap().len(), 2);

        backend.prune_daily_before(day.succ_opt().unwrap()).unwrap();
        assert_eq!(backend.load_users_since(day).unwrap(), vec![lifetime]);

        assert_eq!(backend.forget_phrases(&[phrase.id]).unwrap(), 0);
        assert!(backend.load_users_since(day).unwrap().is_empty());
    }
}
