//! Behavior analyzer: learns which phrases deserve the priority tier.
//!
//! Every translation request pushes an observation (phrase, requester,
//! target) through a bounded channel; a consumer task folds it into
//! per-phrase stats and a per-day rollup. A periodic recompute scores every
//! phrase active in the learning window:
//!
//! ```text
//! frequency   = min(total_uses / 1000, 1)
//! popularity  = min(distinct_users / 100, 1)
//! consistency = active_days_in_window / window_days
//! recency     = min(avg_daily_count_in_window / 50, 1)
//! score       = 0.4 f + 0.3 p + 0.2 c + 0.1 r
//! ```
//!
//! and swaps in a fresh priority set as a whole.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AnalyzerConfig;
use crate::error::StoreError;
use crate::languages::{self, Language};
use crate::store::UsageRepository;
use crate::translate::{Phrase, PhraseId};

/// Aggregate usage for one phrase. `priority_score` is derived.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhraseUsageStats {
    pub phrase_id: PhraseId,
    pub phrase: String,
    pub total_uses: u64,
    pub distinct_users: u64,
    pub first_seen: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub priority_score: f64,
    pub is_priority_cached: bool,
    /// When the score last dropped under the threshold while still cached.
    pub below_threshold_since: Option<DateTime<Utc>>,
    /// Target languages this phrase has been requested in.
    pub languages: Vec<String>,
}

/// Per-day usage for one phrase.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyUsage {
    pub day: NaiveDate,
    pub phrase_id: PhraseId,
    pub count: u64,
    pub distinct_users: u64,
}

/// A requester seen for a phrase, over its lifetime (`day == None`) or on
/// one day. Requesters are kept as digests, never raw ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserSighting {
    pub phrase_id: PhraseId,
    pub day: Option<NaiveDate>,
    pub user: String,
}

/// Truncated blake3 digest of a requester id.
pub fn user_digest(requester_id: &str) -> String {
    let hash = blake3::hash(requester_id.as_bytes());
    hex::encode(&hash.as_bytes()[..16])
}

/// One request's worth of evidence.
#[derive(Debug, Clone)]
pub struct Observation {
    pub phrase: Phrase,
    pub requester_id: String,
    pub target: &'static Language,
    pub at: DateTime<Utc>,
}

/// A member of the priority set.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityPhrase {
    pub phrase: Phrase,
    pub languages: Vec<&'static Language>,
    pub score: f64,
    pub total_uses: u64,
    pub first_seen: DateTime<Utc>,
}

/// Immutable snapshot of the priority set.
#[derive(Debug, Default)]
pub struct PrioritySet {
    members: HashMap<PhraseId, PriorityPhrase>,
}

impl PrioritySet {
    pub fn contains(&self, id: &PhraseId) -> bool {
        self.members.contains_key(id)
    }

    pub fn get(&self, id: &PhraseId) -> Option<&PriorityPhrase> {
        self.members.get(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members in promotion order: total uses desc, then first seen asc.
    pub fn ordered(&self) -> Vec<&PriorityPhrase> {
        let mut out: Vec<_> = self.members.values().collect();
        out.sort_by(|a, b| {
            b.total_uses
                .cmp(&a.total_uses)
                .then(a.first_seen.cmp(&b.first_seen))
        });
        out
    }
}

/// Transitions produced by one recompute.
#[derive(Debug, Default)]
pub struct PriorityUpdate {
    /// In promotion order.
    pub promoted: Vec<PriorityPhrase>,
    pub demoted: Vec<PhraseId>,
    pub scored: usize,
    pub priority_size: usize,
}

/// Inputs to the score, all measured at recompute time.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub total_uses: u64,
    pub distinct_users: u64,
    pub active_days: u32,
    pub window_uses: u64,
    pub window_days: u32,
}

/// Weighted priority score in [0, 1].
pub fn priority_score(inputs: ScoreInputs) -> f64 {
    let window_days = f64::from(inputs.window_days.max(1));
    let frequency = (inputs.total_uses as f64 / 1000.0).min(1.0);
    let popularity = (inputs.distinct_users as f64 / 100.0).min(1.0);
    let consistency = (f64::from(inputs.active_days) / window_days).min(1.0);
    let recency = ((inputs.window_uses as f64 / window_days) / 50.0).min(1.0);
    0.4 * frequency + 0.3 * popularity + 0.2 * consistency + 0.1 * recency
}

struct PhraseState {
    stats: PhraseUsageStats,
    /// Requester digests.
    users: HashSet<String>,
    languages: BTreeSet<&'static str>,
}

impl PhraseState {
    fn distinct_users(&self) -> u64 {
        self.users.len() as u64
    }
}

struct DayState {
    count: u64,
    users: HashSet<String>,
}

pub struct BehaviorAnalyzer {
    config: AnalyzerConfig,
    phrases: DashMap<PhraseId, PhraseState>,
    daily: DashMap<(NaiveDate, PhraseId), DayState>,
    priority: RwLock<Arc<PrioritySet>>,
    tx: mpsc::Sender<Observation>,
    rx: Mutex<Option<mpsc::Receiver<Observation>>>,
    dropped: AtomicU64,
    repository: Option<Arc<dyn UsageRepository>>,
    dirty_phrases: Mutex<HashSet<PhraseId>>,
    dirty_days: Mutex<HashSet<(NaiveDate, PhraseId)>>,
    dirty_users: Mutex<Vec<UserSighting>>,
}

impl BehaviorAnalyzer {
    pub fn new(config: AnalyzerConfig, repository: Option<Arc<dyn UsageRepository>>) -> Self {
        let (tx, rx) = mpsc::channel(config.observation_capacity.max(1));
        Self {
            config,
            phrases: DashMap::new(),
            daily: DashMap::new(),
            priority: RwLock::new(Arc::new(PrioritySet::default())),
            tx,
            rx: Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
            repository,
            dirty_phrases: Mutex::new(HashSet::new()),
            dirty_days: Mutex::new(HashSet::new()),
            dirty_users: Mutex::new(Vec::new()),
        }
    }

    fn window_days(&self) -> u32 {
        self.config.learning_window_days.max(1)
    }

    fn window_start(&self, now: DateTime<Utc>) -> NaiveDate {
        now.date_naive() - ChronoDuration::days(i64::from(self.window_days()) - 1)
    }

    /// Restore persisted stats, the in-window daily rollup and the
    /// requester digests behind both distinct-user counts.
    pub fn load(&self) -> Result<usize, StoreError> {
        let Some(repo) = &self.repository else {
            return Ok(0);
        };
        let stats = repo.load_stats()?;
        let count = stats.len();
        for s in stats {
            let languages = s
                .languages
                .iter()
                .filter_map(|code| languages::lookup(code).map(|l| l.code))
                .collect();
            self.phrases.insert(
                s.phrase_id,
                PhraseState {
                    users: HashSet::new(),
                    languages,
                    stats: s,
                },
            );
        }
        let window_start = self.window_start(Utc::now());
        for row in repo.load_daily_since(window_start)? {
            self.daily.insert(
                (row.day, row.phrase_id),
                DayState {
                    count: row.count,
                    users: HashSet::new(),
                },
            );
        }
        for sighting in repo.load_users_since(window_start)? {
            match sighting.day {
                None => {
                    if let Some(mut state) = self.phrases.get_mut(&sighting.phrase_id) {
                        state.users.insert(sighting.user);
                        state.stats.distinct_users = state.distinct_users();
                    }
                }
                Some(day) => {
                    if let Some(mut day_state) = self.daily.get_mut(&(day, sighting.phrase_id)) {
                        day_state.users.insert(sighting.user);
                    }
                }
            }
        }
        // Rebuild the priority view from persisted flags.
        self.swap_priority_set();
        info!(phrases = count, "analyzer state restored");
        Ok(count)
    }

    /// Fire-and-forget: queue an observation, dropping it if the channel is full.
    pub fn observe(&self, obs: Observation) {
        if let Err(e) = self.tx.try_send(obs) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, error = %e, "observation channel saturated, dropping");
            }
        }
    }

    pub fn dropped_observations(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Take the observation receiver (once) to run the consumer loop.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<Observation>> {
        self.rx.lock().take()
    }

    /// Consume observations until cancelled or the channel closes.
    pub async fn run_observation_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Observation>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(obs) => self.record(obs),
                    None => break,
                },
                _ = cancel.cancelled() => {
                    // Apply what is already queued so shutdown flushes it.
                    while let Ok(obs) = rx.try_recv() {
                        self.record(obs);
                    }
                    break;
                }
            }
        }
        debug!("observation loop exiting");
    }

    /// Fold one observation into stats and the daily rollup.
    pub fn record(&self, obs: Observation) {
        let id = obs.phrase.id;
        let day = obs.at.date_naive();
        let user = user_digest(&obs.requester_id);
        let mut sightings = Vec::new();
        {
            let mut state = self.phrases.entry(id).or_insert_with(|| PhraseState {
                stats: PhraseUsageStats {
                    phrase_id: id,
                    phrase: obs.phrase.text.clone(),
                    total_uses: 0,
                    distinct_users: 0,
                    first_seen: obs.at,
                    last_used: obs.at,
                    priority_score: 0.0,
                    is_priority_cached: false,
                    below_threshold_since: None,
                    languages: Vec::new(),
                },
                users: HashSet::new(),
                languages: BTreeSet::new(),
            });
            state.stats.total_uses += 1;
            state.stats.first_seen = state.stats.first_seen.min(obs.at);
            state.stats.last_used = state.stats.last_used.max(obs.at);
            if state.users.insert(user.clone()) {
                sightings.push(UserSighting {
                    phrase_id: id,
                    day: None,
                    user: user.clone(),
                });
            }
            state.stats.distinct_users = state.distinct_users();
            if state.languages.insert(obs.target.code) {
                state.stats.languages = state.languages.iter().map(|c| c.to_string()).collect();
            }
        }

        {
            let mut day_state = self.daily.entry((day, id)).or_insert_with(|| DayState {
                count: 0,
                users: HashSet::new(),
            });
            day_state.count += 1;
            if day_state.users.insert(user.clone()) {
                sightings.push(UserSighting {
                    phrase_id: id,
                    day: Some(day),
                    user,
                });
            }
        }

        if self.repository.is_some() {
            self.dirty_phrases.lock().insert(id);
            self.dirty_days.lock().insert((day, id));
            self.dirty_users.lock().extend(sightings);
        }
    }

    /// Recompute scores as of now.
    pub fn recompute(&self) -> PriorityUpdate {
        self.recompute_at(Utc::now())
    }

    /// Recompute scores, apply promote/demote transitions and swap the
    /// priority set.
    pub fn recompute_at(&self, now: DateTime<Utc>) -> PriorityUpdate {
        let window_days = self.window_days();
        let window_start = self.window_start(now);
        let today = now.date_naive();
        let demote_after = ChronoDuration::days(i64::from(window_days));

        let mut update = PriorityUpdate::default();
        let mut touched = Vec::new();
        let mut idle = Vec::new();

        for mut entry in self.phrases.iter_mut() {
            let id = *entry.key();
            let state = entry.value_mut();

            let mut window_uses = 0u64;
            let mut active_days = 0u32;
            let mut day = window_start;
            while day <= today {
                if let Some(d) = self.daily.get(&(day, id)) {
                    if d.count > 0 {
                        window_uses += d.count;
                        active_days += 1;
                    }
                }
                day = match day.succ_opt() {
                    Some(next) => next,
                    None => break,
                };
            }

            let eligible = window_uses >= self.config.min_usage_threshold;
            let score = if eligible {
                update.scored += 1;
                priority_score(ScoreInputs {
                    total_uses: state.stats.total_uses,
                    distinct_users: state.distinct_users(),
                    active_days,
                    window_uses,
                    window_days,
                })
            } else {
                0.0
            };
            let qualifies = eligible && score >= self.config.promotion_threshold;
            let stats = &mut state.stats;
            let before = (stats.is_priority_cached, stats.below_threshold_since, stats.priority_score);
            stats.priority_score = score;

            match (qualifies, stats.is_priority_cached) {
                (true, false) => {
                    stats.is_priority_cached = true;
                    stats.below_threshold_since = None;
                    update.promoted.push(PriorityPhrase {
                        phrase: Phrase {
                            id,
                            text: stats.phrase.clone(),
                        },
                        languages: state
                            .languages
                            .iter()
                            .filter_map(|code| languages::lookup(code))
                            .collect(),
                        score,
                        total_uses: stats.total_uses,
                        first_seen: stats.first_seen,
                    });
                }
                (true, true) => stats.below_threshold_since = None,
                (false, true) => match stats.below_threshold_since {
                    None => stats.below_threshold_since = Some(now),
                    Some(since) if now - since >= demote_after => {
                        stats.is_priority_cached = false;
                        stats.below_threshold_since = None;
                        update.demoted.push(id);
                    }
                    Some(_) => {}
                },
                (false, false) => {}
            }

            if !stats.is_priority_cached && window_uses == 0 {
                idle.push(id);
            } else if before != (stats.is_priority_cached, stats.below_threshold_since, stats.priority_score) {
                touched.push(id);
            }
        }

        // Nothing in the window and not cached: stop tracking it.
        for id in &idle {
            self.phrases.remove(id);
        }

        update.promoted.sort_by(|a, b| {
            b.total_uses
                .cmp(&a.total_uses)
                .then(a.first_seen.cmp(&b.first_seen))
        });

        self.daily.retain(|(day, _), _| *day >= window_start);
        update.priority_size = self.swap_priority_set();

        if self.repository.is_some() {
            self.dirty_phrases.lock().extend(touched);
        }
        if let Err(e) = self.flush(window_start, &idle) {
            warn!(error = %e, "analyzer flush failed");
        }
        if !idle.is_empty() {
            debug!(forgotten = idle.len(), tracked = self.phrases.len(), "idle phrases dropped");
        }

        if !update.promoted.is_empty() || !update.demoted.is_empty() {
            info!(
                promoted = update.promoted.len(),
                demoted = update.demoted.len(),
                priority_size = update.priority_size,
                "priority set updated"
            );
        }
        update
    }

    /// Build a new snapshot from the cached flags and swap it in whole.
    fn swap_priority_set(&self) -> usize {
        let members: HashMap<PhraseId, PriorityPhrase> = self
            .phrases
            .iter()
            .filter(|e| e.stats.is_priority_cached)
            .map(|e| {
                let s = &e.stats;
                (
                    s.phrase_id,
                    PriorityPhrase {
                        phrase: Phrase {
                            id: s.phrase_id,
                            text: s.phrase.clone(),
                        },
                        languages: e
                            .languages
                            .iter()
                            .filter_map(|code| languages::lookup(code))
                            .collect(),
                        score: s.priority_score,
                        total_uses: s.total_uses,
                        first_seen: s.first_seen,
                    },
                )
            })
            .collect();
        let size = members.len();
        *self.priority.write() = Arc::new(PrioritySet { members });
        size
    }

    /// Current priority set snapshot.
    pub fn priority_set(&self) -> Arc<PrioritySet> {
        Arc::clone(&self.priority.read())
    }

    /// Phrases currently held in memory.
    pub fn tracked_phrases(&self) -> usize {
        self.phrases.len()
    }

    pub fn stats(&self, id: &PhraseId) -> Option<PhraseUsageStats> {
        self.phrases.get(id).map(|s| s.stats.clone())
    }

    pub fn daily_usage(&self, day: NaiveDate, id: &PhraseId) -> Option<DailyUsage> {
        self.daily.get(&(day, *id)).map(|d| DailyUsage {
            day,
            phrase_id: *id,
            count: d.count,
            distinct_users: d.users.len() as u64,
        })
    }

    /// Persist changed stats and daily rows; prune days outside the window.
    pub fn flush_now(&self) -> Result<(), StoreError> {
        self.flush(self.window_start(Utc::now()), &[])
    }

    fn flush(&self, window_start: NaiveDate, forgotten: &[PhraseId]) -> Result<(), StoreError> {
        let Some(repo) = &self.repository else {
            return Ok(());
        };
        let phrase_ids: Vec<PhraseId> = self.dirty_phrases.lock().drain().collect();
        let day_keys: Vec<(NaiveDate, PhraseId)> = self.dirty_days.lock().drain().collect();
        let sightings: Vec<UserSighting> = std::mem::take(&mut *self.dirty_users.lock());

        let stats: Vec<PhraseUsageStats> = phrase_ids.iter().filter_map(|id| self.stats(id)).collect();
        let days: Vec<DailyUsage> = day_keys
            .iter()
            .filter_map(|(day, id)| self.daily_usage(*day, id))
            .collect();

        if !stats.is_empty() {
            repo.save_stats(&stats)?;
        }
        if !days.is_empty() {
            repo.save_daily(&days)?;
        }
        if !sightings.is_empty() {
            repo.save_users(&sightings)?;
        }
        if !forgotten.is_empty() {
            repo.forget_phrases(forgotten)?;
        }
        repo.prune_daily_before(window_start)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::normalize_phrase;

    fn analyzer() -> BehaviorAnalyzer {
        BehaviorAnalyzer::new(AnalyzerConfig::default(), None)
    }

    fn obs(text: &str, user: &str, lang: &str, at: DateTime<Utc>) -> Observation {
        Observation {
            phrase: normalize_phrase(text),
            requester_id: user.to_string(),
            target: languages::lookup(lang).unwrap(),
            at,
        }
    }

    #[test]
    fn score_formula_weights() {
        let full = priority_score(ScoreInputs {
            total_uses: 5000,
            distinct_users: 500,
            active_days: 7,
            window_uses: 5000,
            window_days: 7,
        });
        assert!((full - 1.0).abs() < 1e-9);

        let partial = priority_score(ScoreInputs {
            total_uses: 500,
            distinct_users: 50,
            active_days: 7,
            window_uses: 175,
            window_days: 7,
        });
        // 0.4*0.5 + 0.3*0.5 + 0.2*1 + 0.1*0.5
        assert!((partial - 0.6).abs() < 1e-9);
    }

    #[test]
    fn record_tracks_users_days_and_languages() {
        let a = analyzer();
        let now = Utc::now();
        a.record(obs("hello", "u1", "es", now));
        a.record(obs("hello", "u1", "fr", now));
        a.record(obs("hello", "u2", "es", now));
        let id = normalize_phrase("hello").id;
        let stats = a.stats(&id).unwrap();
        assert_eq!(stats.total_uses, 3);
        assert_eq!(stats.distinct_users, 2);
        assert_eq!(stats.languages, vec!["es".to_string(), "fr".to_string()]);
        let day = a.daily_usage(now.date_naive(), &id).unwrap();
        assert_eq!(day.count, 3);
        assert_eq!(day.distinct_users, 2);
    }

    #[test]
    fn popular_phrase_is_promoted_with_its_languages() {
        let a = analyzer();
        let now = Utc::now();
        for i in 0..1000u32 {
            let at = now - ChronoDuration::days(i64::from(i % 7));
            a.record(obs("see you tomorrow", &format!("user-{}", i % 150), "de", at));
        }
        a.record(obs("rare phrase", "u1", "de", now));

        let update = a.recompute_at(now);
        assert_eq!(update.promoted.len(), 1);
        let promoted = &update.promoted[0];
        assert_eq!(promoted.phrase.text, "see you tomorrow");
        assert_eq!(promoted.languages.iter().map(|l| l.code).collect::<Vec<_>>(), vec!["de"]);
        assert!(promoted.score >= 0.99);

        let id = normalize_phrase("see you tomorrow").id;
        assert!(a.stats(&id).unwrap().is_priority_cached);
        assert!(a.priority_set().contains(&id));
        assert!(!a.priority_set().contains(&normalize_phrase("rare phrase").id));

        // Second pass is not a new promotion.
        assert!(a.recompute_at(now).promoted.is_empty());
    }

    #[test]
    fn below_usage_threshold_is_not_scored() {
        let a = analyzer();
        let now = Utc::now();
        for i in 0..9 {
            a.record(obs("almost", &format!("u{i}"), "es", now));
        }
        let update = a.recompute_at(now);
        assert_eq!(update.scored, 0);
        assert!(update.promoted.is_empty());
    }

    #[test]
    fn demotion_waits_one_full_window() {
        let a = analyzer();
        let start = Utc::now() - ChronoDuration::days(30);
        for i in 0..700u32 {
            let at = start - ChronoDuration::days(i64::from(i % 7));
            a.record(obs("fading", &format!("u{}", i % 120), "it", at));
        }
        assert_eq!(a.recompute_at(start).promoted.len(), 1);

        // Usage stops: a day later the phrase is out of favor but still cached.
        let later = start + ChronoDuration::days(8);
        let update = a.recompute_at(later);
        assert!(update.demoted.is_empty());
        let id = normalize_phrase("fading").id;
        assert!(a.stats(&id).unwrap().is_priority_cached);

        let update = a.recompute_at(later + ChronoDuration::days(7));
        assert_eq!(update.demoted, vec![id]);
        // Demoted with no usage left in the window, so it is no longer tracked.
        assert!(a.stats(&id).is_none());
        assert!(a.priority_set().is_empty());
    }

    #[test]
    fn idle_phrases_are_dropped_on_recompute() {
        let a = analyzer();
        let now = Utc::now();
        let year_ago = now - ChronoDuration::days(365);
        for i in 0..5000 {
            a.record(obs(&format!("one-off {i}"), "u1", "es", year_ago));
        }
        a.record(obs("still talking", "u1", "es", now));
        assert_eq!(a.tracked_phrases(), 5001);

        a.recompute_at(now);
        assert_eq!(a.tracked_phrases(), 1);
        assert!(a.stats(&normalize_phrase("one-off 0").id).is_none());
        assert!(a.stats(&normalize_phrase("still talking").id).is_some());
    }

    #[test]
    fn distinct_users_are_not_recounted_after_restart() {
        use crate::store::SqliteBackend;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.db");
        let id = normalize_phrase("hello").id;
        let now = Utc::now();
        {
            let repo: Arc<dyn UsageRepository> = Arc::new(SqliteBackend::open(&path).unwrap());
            let a = BehaviorAnalyzer::new(AnalyzerConfig::default(), Some(repo));
            a.record(obs("hello", "u1", "es", now));
            a.flush_now().unwrap();
        }

        let repo: Arc<dyn UsageRepository> = Arc::new(SqliteBackend::open(&path).unwrap());
        let a = BehaviorAnalyzer::new(AnalyzerConfig::default(), Some(repo));
        assert_eq!(a.load().unwrap(), 1);
        assert_eq!(a.stats(&id).unwrap().distinct_users, 1);
        a.record(obs("hello", "u1", "es", now));
        a.record(obs("hello", "u1", "fr", now));

        let stats = a.stats(&id).unwrap();
        assert_eq!(stats.total_uses, 3);
        assert_eq!(stats.distinct_users, 1);
        assert_eq!(a.daily_usage(now.date_naive(), &id).unwrap().distinct_users, 1);

        a.record(obs("hello", "u2", "es", now));
        assert_eq!(a.stats(&id).unwrap().distinct_users, 2);
    }

    #[test]
    fn promotion_order_prefers_usage_then_age() {
        let a = analyzer();
        let now = Utc::now();
        // One day earlier than anything else; its oldest day falls out of the window.
        let older = now - ChronoDuration::days(7);
        for i in 0..700u32 {
            let day = ChronoDuration::days(i64::from(i % 7));
            a.record(obs("busy", &format!("u{}", i % 120), "es", now - day));
            a.record(obs("old timer", &format!("u{}", i % 120), "es", older + day));
            if i < 600 {
                a.record(obs("quiet", &format!("u{}", i % 120), "es", now - day));
            }
        }
        let update = a.recompute_at(now);
        let order: Vec<_> = update.promoted.iter().map(|p| p.phrase.text.as_str()).collect();
        assert_eq!(order, vec!["old timer", "busy", "quiet"]);
    }

    #[tokio::test]
    async fn observe_is_lossy_when_channel_is_full() {
        let config = AnalyzerConfig {
            observation_capacity: 2,
            ..AnalyzerConfig::default()
        };
        let a = BehaviorAnalyzer::new(config, None);
        let now = Utc::now();
        for _ in 0..5 {
            a.observe(obs("spam", "u1", "es", now));
        }
        assert_eq!(a.dropped_observations(), 3);

        let a = Arc::new(a);
        let rx = a.take_receiver().unwrap();
        assert!(a.take_receiver().is_none());
        let cancel = CancellationToken::new();
        cancel.cancel();
        Arc::clone(&a).run_observation_loop(rx, cancel).await;
        assert_eq!(a.stats(&normalize_phrase("spam").id).unwrap().total_uses, 2);
    }
}
