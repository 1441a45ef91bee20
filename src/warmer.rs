//! Cache warmer: seats priority phrases in the PRIORITY tier ahead of demand.
//! Provider calls are bounded by a semaphore and paced per target language.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::WarmerConfig;
use crate::error::ProviderError;
use crate::languages::{Language, SourceLanguage};
use crate::provider::{ProviderHealth, TranslationProvider};
use crate::store::{CacheStore, PutOutcome};
use crate::translate::{Phrase, Tier, TranslationEntry, TranslationKey};

/// One (phrase, language) to warm.
#[derive(Debug, Clone)]
pub struct WarmJob {
    pub phrase: Phrase,
    pub target: &'static Language,
}

/// How a successful warm ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmOutcome {
    /// An existing cached translation was lifted to PRIORITY.
    Promoted,
    /// The provider produced a fresh PRIORITY entry.
    Fetched,
    /// A user-submitted translation already owns the key.
    UserSubmitted,
}

/// Result of a bulk warm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmReport {
    pub warmed: usize,
    pub failed: usize,
}

/// Running totals since startup.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WarmerStats {
    pub warmed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dropped: u64,
}

pub struct CacheWarmer {
    cache: Arc<CacheStore>,
    provider: Arc<dyn TranslationProvider>,
    health: Arc<ProviderHealth>,
    config: WarmerConfig,
    priority_ttl: Duration,
    permits: Semaphore,
    /// Next allowed provider call per target language.
    pacing: DashMap<&'static str, Arc<tokio::sync::Mutex<Instant>>>,
    tx: mpsc::Sender<WarmJob>,
    rx: Mutex<Option<mpsc::Receiver<WarmJob>>>,
    warmed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

impl CacheWarmer {
    pub fn new(
        cache: Arc<CacheStore>,
        provider: Arc<dyn TranslationProvider>,
        health: Arc<ProviderHealth>,
        config: WarmerConfig,
        priority_ttl: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            cache,
            provider,
            health,
            permits: Semaphore::new(config.max_concurrent.max(1)),
            config,
            priority_ttl,
            pacing: DashMap::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            warmed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a warm for the background worker. Returns false if the queue is full.
    pub fn enqueue(&self, job: WarmJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(key = %TranslationKey::new(job.phrase.id, job.target), "warm queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Take the job receiver (call once to start the worker loop).
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<WarmJob>> {
        self.rx.lock().take()
    }

    /// Drain queued jobs until cancelled. Each job runs in its own task;
    /// the semaphore bounds how many reach the provider at once.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<WarmJob>, cancel: CancellationToken) {
        info!(max_concurrent = self.config.max_concurrent, "warm worker started");
        loop {
            let job = tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };
            let warmer = Arc::clone(&self);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let _ = warmer.warm_with_retry(&job.phrase, job.target, &cancel).await;
            });
        }
        info!("warm worker stopped");
    }

    /// Warm every phrase for one language and wait for the outcome.
    pub async fn warm_all(&self, phrases: &[Phrase], target: &'static Language, cancel: &CancellationToken) -> WarmReport {
        let outcomes = join_all(phrases.iter().map(|p| self.warm_with_retry(p, target, cancel))).await;
        let warmed = outcomes.iter().filter(|o| o.is_some()).count();
        WarmReport {
            warmed,
            failed: outcomes.len() - warmed,
        }
    }

    /// `warm`, re-attempted after each configured backoff. Gives up silently
    /// once the backoff list is exhausted or the error cannot improve.
    pub async fn warm_with_retry(
        &self,
        phrase: &Phrase,
        target: &'static Language,
        cancel: &CancellationToken,
    ) -> Option<WarmOutcome> {
        let key = TranslationKey::new(phrase.id, target);
        let mut attempt = 0usize;
        loop {
            let result = tokio::select! {
                r = self.warm(phrase, target) => r,
                _ = cancel.cancelled() => return None,
            };
            let err = match result {
                Ok(outcome) => {
                    self.warmed.fetch_add(1, Ordering::Relaxed);
                    return Some(outcome);
                }
                Err(e) => e,
            };
            let backoff = self.config.retry_backoff.get(attempt).copied();
            match backoff {
                Some(wait) if err.kind().is_retryable() => {
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(%key, attempt, wait_ms = wait.as_millis() as u64, error = %err, "warm failed, re-queueing");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancel.cancelled() => return None,
                    }
                    attempt += 1;
                }
                _ => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    debug!(%key, attempt, error_kind = %err.kind(), "warm dropped");
                    return None;
                }
            }
        }
    }

    /// Seat `phrase` in PRIORITY for `target`: lift an existing entry or
    /// fetch a fresh one.
    pub async fn warm(&self, phrase: &Phrase, target: &'static Language) -> Result<WarmOutcome, ProviderError> {
        let key = TranslationKey::new(phrase.id, target);
        let (lift, ttl) = (key.clone(), self.priority_ttl);
        match CacheStore::run_blocking(Arc::clone(&self.cache), move |c| c.promote_to_priority(&lift, ttl)).await {
            Ok(Some(Tier::UserSubmitted)) => return Ok(WarmOutcome::UserSubmitted),
            Ok(Some(_)) => {
                debug!(%key, "existing entry promoted");
                return Ok(WarmOutcome::Promoted);
            }
            Ok(None) => {}
            Err(e) => warn!(%key, error = %e, "cache read failed during warm, fetching"),
        }

        // Pacing waits hold no permit.
        self.pace(target).await;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Transport("warmer closed".into()))?;

        let result = self.provider.translate(&phrase.text, target, SourceLanguage::Auto).await;
        self.health.record(&result);
        let translation = result?;

        let entry = TranslationEntry::expiring(
            Tier::Priority,
            phrase.text.clone(),
            translation.text,
            translation.detected_source.map(|l| l.code.to_string()),
            Utc::now(),
            self.priority_ttl,
        );
        let seat = key.clone();
        match CacheStore::run_blocking(Arc::clone(&self.cache), move |c| c.put(&seat, entry)).await {
            Ok(PutOutcome::Shadowed { .. }) => Ok(WarmOutcome::UserSubmitted),
            Ok(_) => {
                debug!(%key, "priority entry fetched");
                Ok(WarmOutcome::Fetched)
            }
            Err(e) => {
                // Still counted as warmed: the provider answered.
                warn!(%key, error = %e, "warm write-back failed");
                Ok(WarmOutcome::Fetched)
            }
        }
    }

    /// Wait until the per-language limiter allows another call.
    async fn pace(&self, target: &'static Language) {
        let slot = Arc::clone(
            self.pacing
                .entry(target.code)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Instant::now())))
                .value(),
        );
        let mut next = slot.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.config.per_language_interval;
    }

    pub fn stats(&self) -> WarmerStats {
        WarmerStats {
            warmed: self.warmed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
