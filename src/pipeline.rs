//! `TranslationPipeline`: the inbound API and the owner of every
//! long-lived service and background task.
//!
//! Background tasks, all stopped by one root cancellation token:
//! - observation consumer (analyzer)
//! - analyzer cycle: recompute scores, warm newly promoted phrases
//! - priority re-warm: refresh PRIORITY expiry before it lapses
//! - warm queue worker
//! - telemetry consumer (supervised)
//! - cache expiry sweeper

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analyzer::{BehaviorAnalyzer, PriorityUpdate};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::fanout::{FanOutMessage, FanOutPlanner, FanOutResult, RecipientDirectory, StaticDirectory};
use crate::languages::{self, Language};
use crate::metrics::{MetricsRegistry, MetricsSink, MetricsSummary};
use crate::orchestrator::Orchestrator;
use crate::provider::{DeepLClient, ProviderHealth, TranslationProvider};
use crate::store::{CacheBackend, CacheStore, MemoryBackend, SqliteBackend, TierSizes, UsageRepository};
use crate::telemetry::{self, TelemetryQueue, TelemetrySink, TracingSink};
use crate::translate::{normalize_phrase, Phrase, TranslationEntry, TranslationKey, TranslationRequest, TranslationResult};
use crate::warmer::{CacheWarmer, WarmJob, WarmReport, WarmerStats};

/// Operator-facing health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub provider_reachable: bool,
    /// Raised by AUTH_FAILED / QUOTA_EXCEEDED until the next success.
    pub degraded: bool,
    pub degraded_reason: Option<String>,
    pub cache_sizes_by_tier: TierSizes,
    pub priority_set_size: usize,
    /// Telemetry events waiting for the consumer.
    pub queue_depth: usize,
    pub dropped_events: u64,
    pub dropped_observations: u64,
    pub in_flight: usize,
    pub warmer: WarmerStats,
}

/// Assembles a pipeline. The provider defaults to the HTTP adapter built
/// from `config.provider`; the directory defaults to an empty in-memory one.
pub struct PipelineBuilder {
    config: PipelineConfig,
    provider: Option<Arc<dyn TranslationProvider>>,
    directory: Option<Arc<dyn RecipientDirectory>>,
    sinks: Vec<Arc<dyn TelemetrySink>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            provider: None,
            directory: None,
            sinks: Vec::new(),
        }
    }

    pub fn provider(mut self, provider: Arc<dyn TranslationProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn RecipientDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Extra telemetry sink, in addition to the tracing and metrics sinks.
    pub fn sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Build every service, restore analyzer state and spawn background
    /// tasks. Must be called inside a Tokio runtime.
    pub fn start(self) -> Result<Arc<TranslationPipeline>, PipelineError> {
        let config = self.config;
        config.validate()?;

        let provider: Arc<dyn TranslationProvider> = match self.provider {
            Some(p) => p,
            None => Arc::new(DeepLClient::new(&config.provider)?),
        };

        let (backend, repository): (Arc<dyn CacheBackend>, Option<Arc<dyn UsageRepository>>) =
            match &config.cache.database_path {
                Some(path) => {
                    let sqlite = Arc::new(SqliteBackend::open(path)?);
                    info!(path = %path.display(), "using sqlite cache");
                    let backend: Arc<dyn CacheBackend> = sqlite.clone();
                    let repository: Arc<dyn UsageRepository> = sqlite;
                    (backend, Some(repository))
                }
                None => {
                    let backend: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
                    (backend, None)
                }
            };
        let cache = Arc::new(CacheStore::new(
            backend,
            config.cache.general_capacity,
            config.cache.lock_stripes,
        ));

        let analyzer = Arc::new(BehaviorAnalyzer::new(config.analyzer.clone(), repository));
        if let Err(e) = analyzer.load() {
            warn!(error = %e, "analyzer state not restored, starting empty");
        }

        let health = Arc::new(ProviderHealth::default());
        let telemetry_queue = Arc::new(TelemetryQueue::new(config.telemetry.capacity));
        let metrics = Arc::new(MetricsRegistry::new());
        let warmer = Arc::new(CacheWarmer::new(
            Arc::clone(&cache),
            Arc::clone(&provider),
            Arc::clone(&health),
            config.warmer.clone(),
            config.cache.priority_ttl,
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&cache),
            Arc::clone(&provider),
            Arc::clone(&health),
            Arc::clone(&analyzer),
            Arc::clone(&telemetry_queue),
            config.orchestrator.clone(),
            config.cache.general_ttl,
        ));
        let directory: Arc<dyn RecipientDirectory> = match self.directory {
            Some(d) => d,
            None => Arc::new(StaticDirectory::new()),
        };
        let planner = FanOutPlanner::new(Arc::clone(&orchestrator), directory);

        let mut sinks: Vec<Arc<dyn TelemetrySink>> = vec![
            Arc::new(TracingSink),
            Arc::new(MetricsSink::new(Arc::clone(&metrics))),
        ];
        sinks.extend(self.sinks);

        let pipeline = Arc::new(TranslationPipeline {
            config,
            cache,
            provider,
            health,
            analyzer,
            warmer,
            orchestrator,
            planner,
            telemetry: telemetry_queue,
            sinks,
            metrics,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        pipeline.spawn_background();
        info!("translation pipeline started");
        Ok(pipeline)
    }
}

pub struct TranslationPipeline {
    config: PipelineConfig,
    cache: Arc<CacheStore>,
    provider: Arc<dyn TranslationProvider>,
    health: Arc<ProviderHealth>,
    analyzer: Arc<BehaviorAnalyzer>,
    warmer: Arc<CacheWarmer>,
    orchestrator: Arc<Orchestrator>,
    planner: FanOutPlanner,
    telemetry: Arc<TelemetryQueue>,
    sinks: Vec<Arc<dyn TelemetrySink>>,
    metrics: Arc<MetricsRegistry>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TranslationPipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Configuration from the environment, HTTP provider, in-memory directory.
    pub fn from_env() -> Result<Arc<Self>, PipelineError> {
        PipelineBuilder::new(PipelineConfig::from_env()?).start()
    }

    fn spawn_background(&self) {
        let mut tasks = self.tasks.lock();
        let cancel = &self.shutdown;

        if let Some(rx) = self.analyzer.take_receiver() {
            tasks.push(tokio::spawn(
                Arc::clone(&self.analyzer).run_observation_loop(rx, cancel.child_token()),
            ));
        }
        if let Some(rx) = self.warmer.take_receiver() {
            tasks.push(tokio::spawn(Arc::clone(&self.warmer).run(rx, cancel.child_token())));
        }
        tasks.push(telemetry::spawn_consumer(
            Arc::clone(&self.telemetry),
            self.sinks.clone(),
            self.config.telemetry.batch_size,
            cancel.child_token(),
        ));

        {
            let analyzer = Arc::clone(&self.analyzer);
            let warmer = Arc::clone(&self.warmer);
            let cancel = cancel.child_token();
            let period = self.config.analyzer.interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            analyzer_cycle(&analyzer, &warmer, Utc::now(), &cancel).await;
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            }));
        }

        {
            // Refresh PRIORITY entries at half their TTL so they never lapse
            // while the phrase stays popular.
            let analyzer = Arc::clone(&self.analyzer);
            let warmer = Arc::clone(&self.warmer);
            let cancel = cancel.child_token();
            let period = (self.config.cache.priority_ttl / 2).max(Duration::from_secs(1));
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let set = analyzer.priority_set();
                            let mut queued = 0usize;
                            for member in set.ordered() {
                                for &target in &member.languages {
                                    queued += usize::from(warmer.enqueue(WarmJob {
                                        phrase: member.phrase.clone(),
                                        target,
                                    }));
                                }
                            }
                            info!(queued, "priority re-warm queued");
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            }));
        }

        {
            let cache = Arc::clone(&self.cache);
            let cancel = cancel.child_token();
            let period = self.config.cache.expiry_sweep_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = CacheStore::run_blocking(Arc::clone(&cache), |c| c.evict_expired()).await {
                                warn!(error = %e, "expiry sweep failed");
                            }
                        }
                        _ = cancel.cancelled() => break,
                    }
                }
            }));
        }
    }

    /// Translate one request. Never fails; see `TranslationResult::error_kind`.
    pub async fn translate(&self, request: &TranslationRequest) -> TranslationResult {
        self.orchestrator.translate_with_cancel(request, &self.shutdown).await
    }

    /// Translate, abandoning the request when `cancel` fires.
    pub async fn translate_with_cancel(
        &self,
        request: &TranslationRequest,
        cancel: &CancellationToken,
    ) -> TranslationResult {
        self.orchestrator.translate_with_cancel(request, cancel).await
    }

    /// Deliver `text` from `sender_id` to everyone in `recipient_ids`.
    pub async fn fan_out(
        &self,
        sender_id: &str,
        room_id: &str,
        text: &str,
        recipient_ids: &[String],
    ) -> FanOutResult {
        let message = FanOutMessage {
            sender_id: sender_id.to_string(),
            room_id: room_id.to_string(),
            text: text.to_string(),
            recipients: recipient_ids.to_vec(),
        };
        self.planner.fan_out(&message, &self.shutdown).await
    }

    /// Install a user-submitted translation, replacing whatever is cached
    /// for the key. Counters are not bumped.
    pub fn submit_user_translation(
        &self,
        phrase: &str,
        target_language: &str,
        translated_text: &str,
        submitter_id: &str,
    ) -> Result<(), PipelineError> {
        let target = resolve_target(target_language)?;
        let normalized = normalize_phrase(phrase);
        if normalized.is_empty() || translated_text.trim().is_empty() {
            return Err(PipelineError::EmptyPhrase);
        }
        let key = TranslationKey::new(normalized.id, target);
        let entry = TranslationEntry::user_submitted(normalized.text, translated_text, Utc::now());
        self.cache.put_user_submitted(&key, entry)?;
        info!(%key, submitter = submitter_id, "user translation installed");
        Ok(())
    }

    /// Warm the whole current priority set for one language.
    pub async fn warm_language(&self, target_language: &str) -> Result<WarmReport, PipelineError> {
        let target = resolve_target(target_language)?;
        let phrases: Vec<Phrase> = self
            .analyzer
            .priority_set()
            .ordered()
            .into_iter()
            .map(|m| m.phrase.clone())
            .collect();
        let report = self.warmer.warm_all(&phrases, target, &self.shutdown).await;
        info!(lang = target.code, warmed = report.warmed, failed = report.failed, "language warmed");
        Ok(report)
    }

    /// One analyzer cycle as of `now`: recompute, then warm every newly
    /// promoted phrase in each language it has been requested in.
    pub async fn run_analyzer_cycle_at(&self, now: DateTime<Utc>) -> PriorityUpdate {
        analyzer_cycle(&self.analyzer, &self.warmer, now, &self.shutdown).await
    }

    pub async fn health(&self) -> HealthReport {
        let provider_reachable = self.provider.probe().await;
        let cache_sizes_by_tier = self.cache.sizes().unwrap_or_else(|e| {
            warn!(error = %e, "cache size query failed");
            TierSizes::default()
        });
        HealthReport {
            provider_reachable,
            degraded: self.health.is_degraded(),
            degraded_reason: self.health.reason().map(|k| k.to_string()),
            cache_sizes_by_tier,
            priority_set_size: self.analyzer.priority_set().len(),
            queue_depth: self.telemetry.len(),
            dropped_events: self.telemetry.dropped(),
            dropped_observations: self.analyzer.dropped_observations(),
            in_flight: self.orchestrator.in_flight(),
            warmer: self.warmer.stats(),
        }
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    pub fn analyzer(&self) -> &Arc<BehaviorAnalyzer> {
        &self.analyzer
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Provider invocations made by the hot path, retries included.
    pub fn provider_calls(&self) -> u64 {
        self.orchestrator.provider_calls()
    }

    /// Stop background tasks, hand remaining telemetry to the sinks and
    /// persist analyzer state. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("translation pipeline shutting down");
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        let drained = telemetry::drain_once(&self.telemetry, &self.sinks, self.config.telemetry.batch_size);
        let analyzer = Arc::clone(&self.analyzer);
        match tokio::task::spawn_blocking(move || analyzer.flush_now()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "analyzer flush failed"),
            Err(e) => warn!(error = %e, "analyzer flush task failed"),
        }
        info!(drained, "translation pipeline stopped");
    }
}

fn resolve_target(code: &str) -> Result<&'static Language, PipelineError> {
    languages::normalize(code)
        .language()
        .ok_or_else(|| PipelineError::UnsupportedLanguage(code.to_string()))
}

async fn analyzer_cycle(
    analyzer: &Arc<BehaviorAnalyzer>,
    warmer: &CacheWarmer,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> PriorityUpdate {
    let task = {
        let analyzer = Arc::clone(analyzer);
        tokio::task::spawn_blocking(move || analyzer.recompute_at(now))
    };
    let update = match task.await {
        Ok(update) => update,
        Err(e) => {
            warn!(error = %e, "analyzer cycle failed");
            return PriorityUpdate::default();
        }
    };

    let mut by_language: BTreeMap<&'static str, (&'static Language, Vec<Phrase>)> = BTreeMap::new();
    for promoted in &update.promoted {
        for &target in &promoted.languages {
            by_language
                .entry(target.code)
                .or_insert_with(|| (target, Vec::new()))
                .1
                .push(promoted.phrase.clone());
        }
    }
    for (target, phrases) in by_language.into_values() {
        let report = warmer.warm_all(&phrases, target, cancel).await;
        info!(lang = target.code, warmed = report.warmed, failed = report.failed, "promoted phrases warmed");
    }
    update
}
