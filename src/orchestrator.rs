//! The hot path: one request through lookup, dedup, provider and write-back.
//!
//! ```text
//! START     normalize, observe, honor opt-out
//! LOOKUP    USER_SUBMITTED > PRIORITY > GENERAL
//! DEDUP     join an in-flight call for the same key, or lead a new one
//! PROVIDER  retry RATE_LIMITED x2 (jittered), TIMEOUT/TRANSPORT x1
//! WRITE     GENERAL entry on success
//! EMIT      telemetry, then return
//! ```
//!
//! `translate` never fails: every error becomes a `TranslationResult`
//! carrying the original text.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::{BoxFuture, Shared, WeakShared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::analyzer::{BehaviorAnalyzer, Observation};
use crate::config::OrchestratorConfig;
use crate::error::{ErrorKind, ProviderError};
use crate::languages::{self, SourceLanguage};
use crate::provider::{ProviderHealth, ProviderTranslation, TranslationProvider};
use crate::store::CacheStore;
use crate::telemetry::{TelemetryQueue, TranslationEvent};
use crate::translate::normalize::detect_language;
use crate::translate::{
    normalize_phrase, PhraseId, Tier, TierHit, TranslationEntry, TranslationKey, TranslationRequest,
    TranslationResult, CONFIDENCE_FRESH,
};

const TRANSIENT_BACKOFF: Duration = Duration::from_millis(500);
const MAX_RATE_LIMIT_RETRIES: u32 = 2;

/// Jittered wait before rate-limit retry `attempt` (0-based).
fn rate_limit_backoff(attempt: u32) -> Duration {
    let (lo, hi) = if attempt == 0 { (250, 750) } else { (500, 1500) };
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

/// What a single-flight produced; shared by every waiter.
#[derive(Debug, Clone)]
enum FlightOutcome {
    /// Another request seated the key between our lookup and the flight.
    Cached { entry: TranslationEntry, tier: Tier },
    Fresh { text: String, detected: Option<String> },
    Failed(ErrorKind),
}

type Flight = BoxFuture<'static, FlightOutcome>;

struct InFlight {
    id: u64,
    flight: WeakShared<Flight>,
}

type FlightMap = Arc<Mutex<HashMap<TranslationKey, InFlight>>>;

/// Clears the flight's map entry when the flight completes or is dropped.
struct FlightGuard {
    flights: FlightMap,
    key: TranslationKey,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut flights = self.flights.lock();
        if flights.get(&self.key).is_some_and(|f| f.id == self.id) {
            flights.remove(&self.key);
        }
    }
}

/// Everything a flight needs, owned so it can outlive its leader.
struct FlightContext {
    cache: Arc<CacheStore>,
    provider: Arc<dyn TranslationProvider>,
    health: Arc<ProviderHealth>,
    provider_calls: Arc<AtomicU64>,
    key: TranslationKey,
    text: String,
    source: SourceLanguage,
    deadline: Instant,
    general_ttl: Duration,
}

impl FlightContext {
    async fn run(self, _guard: FlightGuard) -> FlightOutcome {
        let key = self.key.clone();
        match CacheStore::run_blocking(Arc::clone(&self.cache), move |c| c.multi_get(&key, &Tier::LOOKUP_ORDER)).await {
            Ok(Some((entry, tier))) => return FlightOutcome::Cached { entry, tier },
            Ok(None) => {}
            Err(e) => warn!(key = %self.key, error = %e, "cache read failed, calling provider"),
        }

        let translation = match tokio::time::timeout_at(self.deadline, self.call_with_retry()).await {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => return FlightOutcome::Failed(e.kind()),
            Err(_) => {
                warn!(key = %self.key, "deadline exceeded, provider call cancelled");
                return FlightOutcome::Failed(ErrorKind::Timeout);
            }
        };

        let detected = translation
            .detected_source
            .or_else(|| detect_language(&self.text))
            .map(|l| l.code.to_string());
        let entry = TranslationEntry::expiring(
            Tier::General,
            self.text.clone(),
            translation.text.clone(),
            detected.clone(),
            Utc::now(),
            self.general_ttl,
        );
        let key = self.key.clone();
        if let Err(e) = CacheStore::run_blocking(Arc::clone(&self.cache), move |c| c.put(&key, entry)).await {
            warn!(key = %self.key, error = %e, "write-back failed");
        }
        FlightOutcome::Fresh {
            text: translation.text,
            detected,
        }
    }

    async fn call_with_retry(&self) -> Result<ProviderTranslation, ProviderError> {
        let target = self.key.target;
        let mut rate_limited = 0u32;
        let mut transient_retried = false;
        loop {
            self.provider_calls.fetch_add(1, Ordering::Relaxed);
            let result = self.provider.translate(&self.text, target, self.source).await;
            self.health.record(&result);
            let err = match result {
                Ok(t) => return Ok(t),
                Err(e) => e,
            };
            let wait = match &err {
                ProviderError::RateLimited { .. } if rate_limited < MAX_RATE_LIMIT_RETRIES => {
                    let wait = rate_limit_backoff(rate_limited);
                    rate_limited += 1;
                    wait
                }
                ProviderError::Timeout | ProviderError::Transport(_) if !transient_retried => {
                    transient_retried = true;
                    TRANSIENT_BACKOFF
                }
                e if e.kind().is_fatal() => {
                    error!(key = %self.key, error_kind = %e.kind(), error = %e, "provider refused request");
                    return Err(err);
                }
                _ => return Err(err),
            };
            warn!(
                key = %self.key,
                error_kind = %err.kind(),
                attempt = rate_limited + u32::from(transient_retried),
                wait_ms = wait.as_millis() as u64,
                "provider call failed, retrying"
            );
            tokio::time::sleep(wait).await;
        }
    }
}

/// Per-request facts needed to finish a result.
struct RequestScope<'a> {
    request: &'a TranslationRequest,
    phrase_id: Option<PhraseId>,
    started: Instant,
}

pub struct Orchestrator {
    cache: Arc<CacheStore>,
    provider: Arc<dyn TranslationProvider>,
    health: Arc<ProviderHealth>,
    analyzer: Arc<BehaviorAnalyzer>,
    telemetry: Arc<TelemetryQueue>,
    config: OrchestratorConfig,
    general_ttl: Duration,
    flights: FlightMap,
    next_flight: AtomicU64,
    provider_calls: Arc<AtomicU64>,
}

impl Orchestrator {
    pub fn new(
        cache: Arc<CacheStore>,
        provider: Arc<dyn TranslationProvider>,
        health: Arc<ProviderHealth>,
        analyzer: Arc<BehaviorAnalyzer>,
        telemetry: Arc<TelemetryQueue>,
        config: OrchestratorConfig,
        general_ttl: Duration,
    ) -> Self {
        Self {
            cache,
            provider,
            health,
            analyzer,
            telemetry,
            config,
            general_ttl,
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_flight: AtomicU64::new(0),
            provider_calls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Translate without an external cancellation signal.
    pub async fn translate(&self, request: &TranslationRequest) -> TranslationResult {
        self.translate_with_cancel(request, &CancellationToken::new()).await
    }

    /// Translate, abandoning the request when `cancel` fires. A cancelled
    /// request writes nothing to the cache or telemetry and leaves any
    /// shared provider call to its remaining waiters.
    pub async fn translate_with_cancel(
        &self,
        request: &TranslationRequest,
        cancel: &CancellationToken,
    ) -> TranslationResult {
        let started = Instant::now();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(request_id = %request.request_id, "request cancelled");
                TranslationResult {
                    latency_ms: elapsed_ms(started),
                    ..TranslationResult::original(&request.request_id, &request.text, Some(ErrorKind::Cancelled))
                }
            }
            result = self.translate_guarded(request, started) => result,
        }
    }

    async fn translate_guarded(&self, request: &TranslationRequest, started: Instant) -> TranslationResult {
        match AssertUnwindSafe(self.run(request, started)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(request_id = %request.request_id, "translation panicked");
                let scope = RequestScope {
                    request,
                    phrase_id: None,
                    started,
                };
                self.finish(
                    &scope,
                    TranslationResult::original(&request.request_id, &request.text, Some(ErrorKind::Internal)),
                )
            }
        }
    }

    async fn run(&self, request: &TranslationRequest, started: Instant) -> TranslationResult {
        let mut scope = RequestScope {
            request,
            phrase_id: None,
            started,
        };
        let fail = |kind| TranslationResult::original(&request.request_id, &request.text, Some(kind));

        // S0
        if request.text.len() > self.config.max_text_bytes {
            debug!(request_id = %request.request_id, bytes = request.text.len(), "text too large");
            return self.finish(&scope, fail(ErrorKind::BadRequest));
        }
        let phrase = normalize_phrase(&request.text);
        scope.phrase_id = Some(phrase.id);
        let Some(target) = languages::normalize(&request.target_language).language() else {
            debug!(request_id = %request.request_id, lang = %request.target_language, "unsupported target");
            return self.finish(&scope, fail(ErrorKind::UnsupportedLanguage));
        };
        let Ok(source) = SourceLanguage::parse(request.source_language.as_deref()) else {
            return self.finish(&scope, fail(ErrorKind::UnsupportedLanguage));
        };
        if phrase.is_empty() {
            return self.finish(&scope, fail(ErrorKind::BadRequest));
        }

        self.analyzer.observe(Observation {
            phrase: phrase.clone(),
            requester_id: request.requester_id.clone(),
            target,
            at: Utc::now(),
        });

        if request.skips_translation() {
            return self.finish(&scope, TranslationResult::original(&request.request_id, &request.text, None));
        }

        // S1
        let key = TranslationKey::new(phrase.id, target);
        let lookup = key.clone();
        match CacheStore::run_blocking(Arc::clone(&self.cache), move |c| c.multi_get(&lookup, &Tier::LOOKUP_ORDER)).await {
            Ok(Some((entry, tier))) => {
                debug!(request_id = %request.request_id, %key, %tier, "cache hit");
                return self.finish(&scope, cache_hit(request, entry, tier, false));
            }
            Ok(None) => {}
            Err(e) => warn!(request_id = %request.request_id, %key, error = %e, "cache lookup failed"),
        }

        // S2-S4
        let deadline = started + request.deadline.unwrap_or(self.config.deadline);
        let (flight, leader) = self.join_or_lead(&key, &phrase.text, source, deadline);
        if !leader {
            debug!(request_id = %request.request_id, %key, "joined in-flight translation");
        }
        let outcome = match tokio::time::timeout_at(deadline, flight).await {
            Ok(outcome) => outcome,
            Err(_) => FlightOutcome::Failed(ErrorKind::Timeout),
        };

        let result = match outcome {
            FlightOutcome::Cached { entry, tier } => cache_hit(request, entry, tier, !leader),
            FlightOutcome::Fresh { text, detected } => TranslationResult {
                request_id: request.request_id.clone(),
                success: true,
                translated_text: text,
                tier_hit: TierHit::Miss,
                cached: false,
                deduped: !leader,
                latency_ms: 0.0,
                confidence: CONFIDENCE_FRESH,
                detected_source_language: detected,
                error_kind: None,
            },
            FlightOutcome::Failed(kind) => TranslationResult {
                deduped: !leader,
                ..fail(kind)
            },
        };
        // S5
        self.finish(&scope, result)
    }

    /// Await an existing flight for `key`, or install a new one.
    fn join_or_lead(
        &self,
        key: &TranslationKey,
        text: &str,
        source: SourceLanguage,
        deadline: Instant,
    ) -> (Shared<Flight>, bool) {
        let mut flights = self.flights.lock();
        if let Some(existing) = flights.get(key).and_then(|f| f.flight.upgrade()) {
            return (existing, false);
        }
        let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
        let guard = FlightGuard {
            flights: Arc::clone(&self.flights),
            key: key.clone(),
            id,
        };
        let context = FlightContext {
            cache: Arc::clone(&self.cache),
            provider: Arc::clone(&self.provider),
            health: Arc::clone(&self.health),
            provider_calls: Arc::clone(&self.provider_calls),
            key: key.clone(),
            text: text.to_string(),
            source,
            deadline,
            general_ttl: self.general_ttl,
        };
        let flight: Shared<Flight> = context.run(guard).boxed().shared();
        if let Some(weak) = flight.downgrade() {
            flights.insert(key.clone(), InFlight { id, flight: weak });
        }
        (flight, true)
    }

    /// Stamp latency, enqueue the telemetry event, hand the result back.
    fn finish(&self, scope: &RequestScope<'_>, mut result: TranslationResult) -> TranslationResult {
        result.latency_ms = elapsed_ms(scope.started);
        let request = scope.request;
        self.telemetry.push(TranslationEvent {
            request_id: request.request_id.clone(),
            requester_id: request.requester_id.clone(),
            phrase_id: scope.phrase_id,
            target_language: request.target_language.clone(),
            tier_hit: result.tier_hit,
            success: result.success,
            cached: result.cached,
            deduped: result.deduped,
            latency_ms: result.latency_ms,
            confidence: result.confidence,
            error_kind: result.error_kind,
            priority: request.priority,
            metadata: request.metadata.clone(),
            at: Utc::now(),
        });
        result
    }

    /// Provider invocations so far, retries included.
    pub fn provider_calls(&self) -> u64 {
        self.provider_calls.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.flights.lock().len()
    }
}

fn cache_hit(request: &TranslationRequest, entry: TranslationEntry, tier: Tier, deduped: bool) -> TranslationResult {
    TranslationResult {
        request_id: request.request_id.clone(),
        success: true,
        translated_text: entry.translated_text,
        tier_hit: tier.into(),
        cached: true,
        deduped,
        latency_ms: 0.0,
        confidence: tier.hit_confidence(),
        detected_source_language: entry.source_language_detected,
        error_kind: None,
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
