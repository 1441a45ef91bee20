//! Fan-out planner: one orchestrator call per distinct recipient language.
//! Messages from the same sender in the same room are planned strictly in
//! arrival order; unrelated (room, sender) pairs never wait on each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ErrorKind;
use crate::languages::{self, LanguageCode};
use crate::orchestrator::Orchestrator;
use crate::translate::{TranslationRequest, TranslationResult};

/// Metadata key carrying the room on fanned-out requests.
pub const ROOM_METADATA_KEY: &str = "room_id";

/// Where recipients' preferred languages come from.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn preferred_language(&self, user_id: &str) -> Option<String>;
}

/// In-memory directory.
#[derive(Default)]
pub struct StaticDirectory {
    preferences: RwLock<HashMap<String, String>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: impl Into<String>, language: impl Into<String>) {
        self.preferences.write().insert(user_id.into(), language.into());
    }

    pub fn remove(&self, user_id: &str) {
        self.preferences.write().remove(user_id);
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StaticDirectory {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(entries: I) -> Self {
        let directory = Self::new();
        for (user, lang) in entries {
            directory.set(user, lang);
        }
        directory
    }
}

#[async_trait]
impl RecipientDirectory for StaticDirectory {
    async fn preferred_language(&self, user_id: &str) -> Option<String> {
        self.preferences.read().get(user_id).cloned()
    }
}

/// One chat message to deliver.
#[derive(Debug, Clone)]
pub struct FanOutMessage {
    pub sender_id: String,
    pub room_id: String,
    pub text: String,
    pub recipients: Vec<String>,
}

/// Per-recipient payloads plus the per-language results they were cut from.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanOutResult {
    pub per_recipient: HashMap<String, TranslationResult>,
    pub per_language: BTreeMap<String, TranslationResult>,
}

pub struct FanOutPlanner {
    orchestrator: Arc<Orchestrator>,
    directory: Arc<dyn RecipientDirectory>,
    /// One FIFO lane per (room, sender).
    lanes: DashMap<(String, String), Arc<tokio::sync::Mutex<()>>>,
}

impl FanOutPlanner {
    pub fn new(orchestrator: Arc<Orchestrator>, directory: Arc<dyn RecipientDirectory>) -> Self {
        Self {
            orchestrator,
            directory,
            lanes: DashMap::new(),
        }
    }

    pub async fn fan_out(&self, message: &FanOutMessage, cancel: &CancellationToken) -> FanOutResult {
        let lane_key = (message.room_id.clone(), message.sender_id.clone());
        let lane = Arc::clone(self.lanes.entry(lane_key.clone()).or_default().value());
        let result = {
            let _turn = lane.lock().await;
            self.plan_and_dispatch(message, cancel).await
        };
        drop(lane);
        self.lanes.remove_if(&lane_key, |_, lane| Arc::strong_count(lane) == 1);
        result
    }

    async fn plan_and_dispatch(&self, message: &FanOutMessage, cancel: &CancellationToken) -> FanOutResult {
        // recipient -> language group; `None` means no preference on file.
        let mut assignments: Vec<(&str, Option<Group>)> = Vec::with_capacity(message.recipients.len());
        for recipient in &message.recipients {
            if *recipient == message.sender_id {
                continue;
            }
            let group = self
                .directory
                .preferred_language(recipient)
                .await
                .map(|code| group_of(&code));
            assignments.push((recipient.as_str(), group));
        }

        let mut targets: Vec<&'static str> = assignments
            .iter()
            .filter_map(|(_, g)| match g {
                Some(Group::Language(code)) => Some(*code),
                _ => None,
            })
            .collect();
        targets.sort_unstable();
        targets.dedup();
        debug!(
            room = %message.room_id,
            sender = %message.sender_id,
            recipients = assignments.len(),
            languages = targets.len(),
            unknown = assignments
                .iter()
                .filter(|(_, g)| matches!(g, Some(Group::Unknown(_))))
                .count(),
            "fan-out planned"
        );

        let requests: Vec<TranslationRequest> = targets
            .iter()
            .map(|lang| {
                TranslationRequest::new(message.text.clone(), *lang, message.sender_id.clone())
                    .with_metadata(ROOM_METADATA_KEY, message.room_id.clone())
            })
            .collect();
        let results = join_all(
            requests
                .iter()
                .map(|req| self.orchestrator.translate_with_cancel(req, cancel)),
        )
        .await;
        let per_language: BTreeMap<String, TranslationResult> = targets
            .iter()
            .map(|l| l.to_string())
            .zip(results)
            .collect();

        let passthrough = |recipient: &str| {
            TranslationResult::passthrough(format!("{}:{recipient}", message.room_id), message.text.clone())
        };
        let mut per_recipient: HashMap<String, TranslationResult> = assignments
            .iter()
            .map(|(recipient, group)| {
                let recipient: &str = recipient;
                let payload = match group {
                    Some(Group::Language(code)) => per_language
                        .get(*code)
                        .cloned()
                        .unwrap_or_else(|| passthrough(recipient)),
                    Some(Group::Unknown(raw)) => {
                        debug!(recipient, code = %raw, "recipient language not recognized");
                        TranslationResult::original(
                            format!("{}:{recipient}", message.room_id),
                            message.text.clone(),
                            Some(ErrorKind::BadRequest),
                        )
                    }
                    None => passthrough(recipient),
                };
                (recipient.to_string(), payload)
            })
            .collect();
        per_recipient.insert(message.sender_id.clone(), passthrough(&message.sender_id));

        FanOutResult {
            per_recipient,
            per_language,
        }
    }

    /// Lanes currently held or awaited.
    pub fn active_lanes(&self) -> usize {
        self.lanes.len()
    }
}

/// A recipient's preferred language as the planner sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Group {
    /// Recipients whose codes normalize to the same language share a group.
    Language(&'static str),
    /// Not in the language table; answered with BAD_REQUEST, never translated.
    Unknown(String),
}

fn group_of(code: &str) -> Group {
    match languages::normalize(code) {
        LanguageCode::Supported(lang) => Group::Language(lang.code),
        LanguageCode::Unsupported => Group::Unknown(code.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::BehaviorAnalyzer;
    use crate::config::{AnalyzerConfig, OrchestratorConfig};
    use crate::error::ProviderError;
    use crate::languages::{Language, SourceLanguage};
    use crate::provider::{ProviderHealth, ProviderTranslation, TranslationProvider};
    use crate::store::CacheStore;
    use crate::telemetry::TelemetryQueue;
    use crate::translate::TierHit;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl TranslationProvider for Recording {
        async fn translate(
            &self,
            text: &str,
            target: &'static Language,
            _source: SourceLanguage,
        ) -> Result<ProviderTranslation, ProviderError> {
            self.calls.lock().push((text.to_string(), target.code.to_string()));
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(ProviderTranslation {
                text: format!("{}:{text}", target.code),
                detected_source: None,
            })
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    fn planner(provider: Arc<Recording>, directory: StaticDirectory) -> FanOutPlanner {
        let orchestrator = Orchestrator::new(
            Arc::new(CacheStore::in_memory(100)),
            provider,
            Arc::new(ProviderHealth::default()),
            Arc::new(BehaviorAnalyzer::new(AnalyzerConfig::default(), None)),
            Arc::new(TelemetryQueue::new(100)),
            OrchestratorConfig::default(),
            Duration::from_secs(3600),
        );
        FanOutPlanner::new(Arc::new(orchestrator), Arc::new(directory))
    }

    fn message(text: &str, recipients: &[&str]) -> FanOutMessage {
        FanOutMessage {
            sender_id: "alice".into(),
            room_id: "lobby".into(),
            text: text.into(),
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn one_call_per_distinct_language() {
        let provider = Arc::new(Recording::default());
        let directory = StaticDirectory::from_iter([
            ("u1", "es"),
            ("u2", "ES"),
            ("u3", "fr"),
            ("u4", "fr_FR"),
            ("u5", "es"),
        ]);
        // fr_FR is not a registered variant, so u4 is rejected without a call.
        let p = planner(Arc::clone(&provider), directory);
        let out = p
            .fan_out(&message("hi all", &["alice", "u1", "u2", "u3", "u4", "u5"]), &CancellationToken::new())
            .await;

        let mut calls = provider.calls.lock().clone();
        calls.sort();
        assert_eq!(calls, vec![("hi all".into(), "es".into()), ("hi all".into(), "fr".into())]);
        assert_eq!(out.per_recipient.len(), 6);
        assert_eq!(out.per_recipient["u2"].translated_text, "es:hi all");
        assert_eq!(out.per_recipient["u3"].translated_text, "fr:hi all");
        let rejected = &out.per_recipient["u4"];
        assert_eq!(rejected.error_kind, Some(ErrorKind::BadRequest));
        assert!(!rejected.success);
        assert_eq!(rejected.translated_text, "hi all");
        assert_eq!(out.per_language.keys().collect::<Vec<_>>(), vec!["es", "fr"]);
        let sender = &out.per_recipient["alice"];
        assert_eq!(sender.tier_hit, TierHit::NotApplicable);
        assert_eq!(sender.translated_text, "hi all");
        assert_eq!(p.active_lanes(), 0);
    }

    #[tokio::test]
    async fn recipient_without_preference_gets_original() {
        let provider = Arc::new(Recording::default());
        let p = planner(Arc::clone(&provider), StaticDirectory::from_iter([("u1", "de")]));
        let out = p.fan_out(&message("moin", &["u1", "ghost"]), &CancellationToken::new()).await;
        assert_eq!(out.per_recipient["ghost"].translated_text, "moin");
        assert_eq!(out.per_recipient["ghost"].tier_hit, TierHit::NotApplicable);
        assert_eq!(provider.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn same_sender_messages_are_sequenced() {
        let provider = Arc::new(Recording::default());
        let p = Arc::new(planner(Arc::clone(&provider), StaticDirectory::from_iter([("u1", "it")])));
        let mut handles = Vec::new();
        for i in 0..5 {
            let p = Arc::clone(&p);
            handles.push(tokio::spawn(async move {
                p.fan_out(&message(&format!("msg {i}"), &["u1"]), &CancellationToken::new())
                    .await
            }));
            // Spawned tasks start in order on the current-thread runtime.
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap();
        }
        let texts: Vec<String> = provider.calls.lock().iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(texts, (0..5).map(|i| format!("msg {i}")).collect::<Vec<_>>());
    }
}
