mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{ids, pipeline, pipeline_with, ScriptedProvider};
use parley::analyzer::Observation;
use parley::config::PipelineConfig;
use parley::languages;
use parley::translate::{normalize_phrase, Tier, TranslationKey};
use parley::{ErrorKind, ProviderError, RecipientDirectory, StaticDirectory, TierHit, TranslationRequest};

#[tokio::test]
async fn cold_miss_is_translated_and_cached() {
    let provider = Arc::new(ScriptedProvider::new().respond("hello world", "es", "hola mundo"));
    let p = pipeline(&provider);

    let result = p
        .translate(&TranslationRequest::new("hello world", "es", "u1").with_source("en"))
        .await;
    assert!(result.success);
    assert_eq!(result.translated_text, "hola mundo");
    assert_eq!(result.tier_hit, TierHit::Miss);
    assert!(!result.cached);
    assert_eq!(result.confidence, 0.8);
    assert!(result.error_kind.is_none());
    assert_eq!(provider.call_count(), 1);

    let key = TranslationKey::new(normalize_phrase("hello world").id, languages::lookup("es").unwrap());
    let entry = p.cache().get(&key, Tier::General).unwrap().expect("general entry");
    assert_eq!(entry.translated_text, "hola mundo");

    let again = p.translate(&TranslationRequest::new("  hello world\n", "es", "u2")).await;
    assert_eq!(again.tier_hit, TierHit::General);
    assert!(again.cached);
    assert_eq!(again.confidence, 0.9);
    assert_eq!(again.translated_text, "hola mundo");
    assert_eq!(provider.call_count(), 1);
    p.shutdown().await;
}

#[tokio::test]
async fn popular_phrase_is_promoted_and_served_from_priority() {
    let provider = Arc::new(ScriptedProvider::new().respond("good morning", "ja", "おはよう"));
    let p = pipeline(&provider);
    let phrase = normalize_phrase("good morning");
    let ja = languages::lookup("ja").unwrap();

    let now = Utc::now();
    for i in 0..1000u32 {
        p.analyzer().record(Observation {
            phrase: phrase.clone(),
            requester_id: format!("user-{}", i % 150),
            target: ja,
            at: now - chrono::Duration::days(i64::from(i % 7)),
        });
    }

    let update = p.run_analyzer_cycle_at(now).await;
    assert_eq!(update.promoted.len(), 1);
    assert!(p.analyzer().priority_set().contains(&phrase.id));
    let stats = p.analyzer().stats(&phrase.id).unwrap();
    assert!(stats.is_priority_cached);
    assert!(stats.priority_score >= 0.4);
    assert_eq!(stats.distinct_users, 150);
    assert_eq!(provider.call_count(), 1);

    let result = p.translate(&TranslationRequest::new("good morning", "ja", "u9")).await;
    assert_eq!(result.tier_hit, TierHit::Priority);
    assert_eq!(result.confidence, 1.0);
    assert_eq!(result.translated_text, "おはよう");
    assert_eq!(provider.call_count(), 1);
    p.shutdown().await;
}

#[tokio::test]
async fn user_submission_overrides_everything() {
    let provider = Arc::new(ScriptedProvider::new());
    let p = pipeline(&provider);

    p.submit_user_translation("good night", "ja", "おやすみ", "u7").unwrap();
    let result = p.translate(&TranslationRequest::new("good night", "ja", "u1")).await;
    assert_eq!(result.tier_hit, TierHit::UserSubmitted);
    assert_eq!(result.translated_text, "おやすみ");
    assert_eq!(result.confidence, 1.0);
    assert_eq!(provider.call_count(), 0);
    p.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rate_limited_call_is_retried_once_with_jitter() {
    let provider = Arc::new(ScriptedProvider::with_errors(vec![ProviderError::RateLimited {
        retry_after_ms: None,
    }]));
    let p = pipeline(&provider);

    let result = p.translate(&TranslationRequest::new("see you", "it", "u1")).await;
    assert!(result.success);
    assert!(!result.cached);
    assert_eq!(result.translated_text, "[it] see you");

    let calls = provider.calls();
    assert_eq!(calls.len(), 2);
    let gap = calls[1].at - calls[0].at;
    assert!(gap >= Duration::from_millis(250), "gap {gap:?}");
    assert!(gap <= Duration::from_millis(750), "gap {gap:?}");
    assert_eq!(p.cache().sizes().unwrap().general, 1);
    p.shutdown().await;
}

#[tokio::test]
async fn quota_exhaustion_returns_original_and_degrades() {
    let provider = Arc::new(ScriptedProvider::with_errors(vec![ProviderError::QuotaExceeded]));
    let p = pipeline(&provider);

    let result = p.translate(&TranslationRequest::new("thank you", "de", "u1")).await;
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::QuotaExceeded));
    assert_eq!(result.translated_text, "thank you");
    assert_eq!(provider.call_count(), 1);

    let health = p.health().await;
    assert!(health.degraded);
    assert_eq!(health.degraded_reason.as_deref(), Some("QUOTA_EXCEEDED"));
    assert_eq!(health.cache_sizes_by_tier.general, 0);
    p.shutdown().await;
}

#[tokio::test]
async fn fan_out_calls_provider_once_per_language() {
    let provider = Arc::new(ScriptedProvider::new());
    let directory: Arc<dyn RecipientDirectory> = Arc::new(StaticDirectory::from_iter([
        ("r1", "es"),
        ("r2", "es"),
        ("r3", "fr"),
        ("r4", "fr"),
        ("r5", "es"),
    ]));
    let p = pipeline_with(&provider, PipelineConfig::default(), Some(directory));

    let out = p
        .fan_out("alice", "room-1", "welcome everyone", &ids(&["r1", "r2", "r3", "r4", "r5"]))
        .await;
    assert_eq!(provider.call_count(), 2);
    assert_eq!(out.per_language.len(), 2);
    for r in ["r1", "r2", "r5"] {
        assert_eq!(out.per_recipient[r].translated_text, "[es] welcome everyone");
    }
    for r in ["r3", "r4"] {
        assert_eq!(out.per_recipient[r].translated_text, "[fr] welcome everyone");
    }
    assert_eq!(out.per_recipient["alice"].translated_text, "welcome everyone");
    p.shutdown().await;
}
