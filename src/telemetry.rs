//! Per-translation telemetry.
//!
//! Producers push into a bounded queue that never blocks: when full, the
//! oldest event is discarded and counted. A supervised consumer task drains
//! batches into sinks; if a sink panics the consumer is restarted and
//! producers are unaffected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ErrorKind;
use crate::translate::{PhraseId, RequestPriority, TierHit};

/// One completed translation.
#[derive(Debug, Clone, Serialize)]
pub struct TranslationEvent {
    pub request_id: String,
    pub requester_id: String,
    /// `None` when the text was rejected before normalization.
    pub phrase_id: Option<PhraseId>,
    pub target_language: String,
    pub tier_hit: TierHit,
    pub success: bool,
    pub cached: bool,
    pub deduped: bool,
    pub latency_ms: f64,
    pub confidence: f32,
    pub error_kind: Option<ErrorKind>,
    pub priority: RequestPriority,
    pub metadata: HashMap<String, String>,
    pub at: DateTime<Utc>,
}

/// Out-of-band consumer of telemetry batches.
pub trait TelemetrySink: Send + Sync {
    fn name(&self) -> &'static str;
    fn consume(&self, batch: &[TranslationEvent]);
}

/// Writes each event as a structured `debug` line.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn consume(&self, batch: &[TranslationEvent]) {
        for e in batch {
            debug!(
                request_id = %e.request_id,
                phrase = e.phrase_id.map(|p| p.short()).as_deref(),
                lang = %e.target_language,
                tier = ?e.tier_hit,
                success = e.success,
                cached = e.cached,
                deduped = e.deduped,
                latency_ms = e.latency_ms,
                error_kind = e.error_kind.map(|k| k.as_str()),
                "translation event"
            );
        }
    }
}

/// Bounded drop-oldest MPMC queue.
pub struct TelemetryQueue {
    events: ArrayQueue<TranslationEvent>,
    notify: Notify,
    dropped: AtomicU64,
}

impl TelemetryQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: ArrayQueue::new(capacity.max(1)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Never blocks. Evicts the oldest event when full.
    pub fn push(&self, event: TranslationEvent) {
        if self.events.force_push(event).is_some() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                warn!(dropped, capacity = self.events.capacity(), "telemetry queue full, dropping oldest");
            }
        }
        self.notify.notify_one();
    }

    /// Up to `max` events in arrival order.
    pub fn pop_batch(&self, max: usize) -> Vec<TranslationEvent> {
        let max = max.max(1);
        let mut batch = Vec::with_capacity(max.min(self.events.len()));
        while batch.len() < max {
            match self.events.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }

    /// Wait for at least one event, or `None` once cancelled.
    pub async fn next_batch(&self, max: usize, cancel: &CancellationToken) -> Option<Vec<TranslationEvent>> {
        loop {
            let batch = self.pop_batch(max);
            if !batch.is_empty() {
                return Some(batch);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Hand every queued event to the sinks once.
pub fn drain_once(queue: &TelemetryQueue, sinks: &[Arc<dyn TelemetrySink>], batch_size: usize) -> usize {
    let mut total = 0;
    loop {
        let batch = queue.pop_batch(batch_size);
        if batch.is_empty() {
            return total;
        }
        total += batch.len();
        for sink in sinks {
            sink.consume(&batch);
        }
    }
}

/// Spawn the consumer under a supervisor that restarts it after a panic.
pub fn spawn_consumer(
    queue: Arc<TelemetryQueue>,
    sinks: Vec<Arc<dyn TelemetrySink>>,
    batch_size: usize,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let sinks: Arc<[Arc<dyn TelemetrySink>]> = sinks.into();
    tokio::spawn(async move {
        let mut restarts = 0u64;
        loop {
            let worker = tokio::spawn(consume(
                Arc::clone(&queue),
                Arc::clone(&sinks),
                batch_size,
                cancel.clone(),
            ));
            match worker.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    restarts += 1;
                    error!(restarts, "telemetry consumer panicked, restarting");
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        info!(restarts, "telemetry consumer stopped");
    })
}

async fn consume(
    queue: Arc<TelemetryQueue>,
    sinks: Arc<[Arc<dyn TelemetrySink>]>,
    batch_size: usize,
    cancel: CancellationToken,
) {
    while let Some(batch) = queue.next_batch(batch_size, &cancel).await {
        for sink in sinks.iter() {
            sink.consume(&batch);
        }
    }
}
