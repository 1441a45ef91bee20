mod common;

use std::sync::Arc;

use chrono::Utc;

use common::{pipeline_with, ScriptedProvider};
use parley::analyzer::Observation;
use parley::config::PipelineConfig;
use parley::languages;
use parley::translate::normalize_phrase;
use parley::{TierHit, TranslationRequest};

#[tokio::test]
async fn cache_and_usage_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PipelineConfig::default();
    config.cache.database_path = Some(dir.path().join("parley.db"));
    let greeting = normalize_phrase("good morning");
    let hello = normalize_phrase("hello");

    {
        let provider = Arc::new(ScriptedProvider::new());
        let p = pipeline_with(&provider, config.clone(), None);
        p.translate(&TranslationRequest::new("hello", "de", "u1")).await;
        p.submit_user_translation("bye", "de", "tschüss", "u2").unwrap();

        let ja = languages::lookup("ja").unwrap();
        let now = Utc::now();
        for i in 0..500u32 {
            p.analyzer().record(Observation {
                phrase: greeting.clone(),
                requester_id: format!("user-{}", i % 120),
                target: ja,
                at: now - chrono::Duration::days(i64::from(i % 7)),
            });
        }
        let update = p.run_analyzer_cycle_at(now).await;
        assert_eq!(update.promoted.len(), 1);
        assert_eq!(provider.call_count(), 2);
        p.shutdown().await;
    }

    let provider = Arc::new(ScriptedProvider::new());
    let p = pipeline_with(&provider, config, None);
    assert!(p.analyzer().priority_set().contains(&greeting.id));
    let stats = p.analyzer().stats(&greeting.id).unwrap();
    assert_eq!(stats.total_uses, 500);
    assert_eq!(stats.distinct_users, 120);
    assert!(p.analyzer().stats(&hello.id).is_some_and(|s| s.total_uses >= 1));

    let r = p.translate(&TranslationRequest::new("hello", "de", "u3")).await;
    assert_eq!(r.tier_hit, TierHit::General);
    let r = p.translate(&TranslationRequest::new("bye", "de", "u3")).await;
    assert_eq!(r.tier_hit, TierHit::UserSubmitted);
    assert_eq!(r.translated_text, "tschüss");
    let r = p.translate(&TranslationRequest::new("good morning", "ja", "u3")).await;
    assert_eq!(r.tier_hit, TierHit::Priority);
    assert_eq!(provider.call_count(), 0);
    p.shutdown().await;
}
