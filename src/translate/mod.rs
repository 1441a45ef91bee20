//! Translation data model shared by the cache, orchestrator and fan-out.

pub mod normalize;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::languages::Language;

pub use normalize::{normalize_phrase, Phrase, PhraseId};

/// Confidence ladder. Fixed per tier because the provider exposes none.
pub const CONFIDENCE_USER_SUBMITTED: f32 = 1.0;
pub const CONFIDENCE_PRIORITY: f32 = 1.0;
pub const CONFIDENCE_GENERAL_HIT: f32 = 0.9;
pub const CONFIDENCE_FRESH: f32 = 0.8;
pub const CONFIDENCE_FAILED: f32 = 0.0;

/// Cache band. Ordered so that `UserSubmitted > Priority > General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    General,
    Priority,
    UserSubmitted,
}

impl Tier {
    /// Lookup order used by the orchestrator.
    pub const LOOKUP_ORDER: [Tier; 3] = [Tier::UserSubmitted, Tier::Priority, Tier::General];

    /// Whether entries in this tier expire on their own.
    pub fn honors_ttl(self) -> bool {
        !matches!(self, Tier::UserSubmitted)
    }

    /// Confidence reported when a request is served from this tier.
    pub fn hit_confidence(self) -> f32 {
        match self {
            Tier::UserSubmitted => CONFIDENCE_USER_SUBMITTED,
            Tier::Priority => CONFIDENCE_PRIORITY,
            Tier::General => CONFIDENCE_GENERAL_HIT,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Tier::General => 0,
            Tier::Priority => 1,
            Tier::UserSubmitted => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Tier::General),
            1 => Some(Tier::Priority),
            2 => Some(Tier::UserSubmitted),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::General => "general",
            Tier::Priority => "priority",
            Tier::UserSubmitted => "user_submitted",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TierHit {
    UserSubmitted,
    Priority,
    General,
    Miss,
    /// The sender's own copy in a fan-out; nothing was looked up.
    NotApplicable,
}

impl From<Tier> for TierHit {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::UserSubmitted => TierHit::UserSubmitted,
            Tier::Priority => TierHit::Priority,
            Tier::General => TierHit::General,
        }
    }
}

/// (phrase, target language). Unique across all tiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TranslationKey {
    pub phrase_id: PhraseId,
    pub target: &'static Language,
}

impl TranslationKey {
    pub fn new(phrase_id: PhraseId, target: &'static Language) -> Self {
        Self { phrase_id, target }
    }
}

impl std::fmt::Display for TranslationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.phrase_id.short(), self.target.code)
    }
}

/// A cached translation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationEntry {
    pub translated_text: String,
    /// Normalized source phrase, kept so warmers can re-translate it.
    pub source_text: String,
    pub tier: Tier,
    pub created_at: DateTime<Utc>,
    /// `None` means never expires (user-submitted entries).
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
    pub confidence: f32,
    pub source_language_detected: Option<String>,
}

impl TranslationEntry {
    /// Entry for a TTL-honoring tier.
    pub fn expiring(
        tier: Tier,
        source_text: impl Into<String>,
        translated_text: impl Into<String>,
        source_language_detected: Option<String>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl)
            .unwrap_or_else(|_| chrono::Duration::days(1))
            .max(chrono::Duration::milliseconds(1));
        let confidence = match tier {
            Tier::General => CONFIDENCE_FRESH,
            _ => tier.hit_confidence(),
        };
        Self {
            translated_text: translated_text.into(),
            source_text: source_text.into(),
            tier,
            created_at: now,
            expires_at: Some(now + ttl),
            last_used: now,
            use_count: 0,
            confidence,
            source_language_detected,
        }
    }

    /// Entry for the user-submitted tier: never expires, full confidence.
    pub fn user_submitted(
        source_text: impl Into<String>,
        translated_text: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            translated_text: translated_text.into(),
            source_text: source_text.into(),
            tier: Tier::UserSubmitted,
            created_at: now,
            expires_at: None,
            last_used: now,
            use_count: 0,
            confidence: CONFIDENCE_USER_SUBMITTED,
            source_language_detected: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.tier.honors_ttl() && self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Caller-declared urgency; carried to telemetry and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Metadata key that routes a request straight back to the caller untranslated.
pub const SKIP_TRANSLATION_KEY: &str = "skip_translation";

/// One translation call.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub text: String,
    pub target_language: String,
    /// `None` or `"auto"` asks the provider to detect.
    pub source_language: Option<String>,
    pub requester_id: String,
    pub request_id: String,
    /// Opaque; forwarded to telemetry only.
    pub metadata: HashMap<String, String>,
    pub priority: RequestPriority,
    /// Overrides the pipeline's overall deadline for this request.
    pub deadline: Option<Duration>,
}

impl TranslationRequest {
    pub fn new(
        text: impl Into<String>,
        target_language: impl Into<String>,
        requester_id: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            target_language: target_language.into(),
            source_language: None,
            requester_id: requester_id.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            metadata: HashMap::new(),
            priority: RequestPriority::default(),
            deadline: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_language = Some(source.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn skips_translation(&self) -> bool {
        self.metadata
            .get(SKIP_TRANSLATION_KEY)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

/// Outcome of one translation call. `translated_text` is always populated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationResult {
    pub request_id: String,
    pub success: bool,
    pub translated_text: String,
    pub tier_hit: TierHit,
    pub cached: bool,
    /// Served from another request's in-flight provider call.
    pub deduped: bool,
    pub latency_ms: f64,
    pub confidence: f32,
    pub detected_source_language: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl TranslationResult {
    /// Failed result carrying the caller's original text.
    pub fn original(request_id: impl Into<String>, text: impl Into<String>, error_kind: Option<ErrorKind>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            translated_text: text.into(),
            tier_hit: TierHit::Miss,
            cached: false,
            deduped: false,
            latency_ms: 0.0,
            confidence: CONFIDENCE_FAILED,
            detected_source_language: None,
            error_kind,
        }
    }

    /// The sender's own copy of a fanned-out message.
    pub fn passthrough(request_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tier_hit: TierHit::NotApplicable,
            ..Self::original(request_id, text, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages;

    #[test]
    fn tier_order_puts_user_submitted_on_top() {
        assert!(Tier::UserSubmitted > Tier::Priority);
        assert!(Tier::Priority > Tier::General);
        for tier in [Tier::General, Tier::Priority, Tier::UserSubmitted] {
            assert_eq!(Tier::from_i64(tier.as_i64()), Some(tier));
        }
    }

    #[test]
    fn user_submitted_entries_never_expire() {
        let created = Utc::now() - chrono::Duration::days(3650);
        let entry = TranslationEntry::user_submitted("good night", "おやすみ", created);
        assert!(!entry.is_expired(Utc::now()));
        assert_eq!(entry.confidence, 1.0);
    }

    #[test]
    fn expiring_entry_expires_at_boundary() {
        let now = Utc::now();
        let entry = TranslationEntry::expiring(
            Tier::General,
            "hello",
            "hola",
            None,
            now,
            Duration::from_secs(60),
        );
        assert!(entry.expires_at.unwrap() > entry.created_at);
        assert!(!entry.is_expired(now + chrono::Duration::seconds(59)));
        assert!(entry.is_expired(now + chrono::Duration::seconds(60)));
        assert_eq!(entry.confidence, CONFIDENCE_FRESH);
    }

    #[test]
    fn skip_translation_metadata() {
        let req = TranslationRequest::new("hi", "es", "u1").with_metadata(SKIP_TRANSLATION_KEY, "TRUE");
        assert!(req.skips_translation());
        assert!(!TranslationRequest::new("hi", "es", "u1").skips_translation());
    }

    #[test]
    fn key_display_is_short() {
        let phrase = normalize_phrase("hello world");
        let key = TranslationKey::new(phrase.id, languages::lookup("es").unwrap());
        assert_eq!(key.to_string(), format!("{}:es", phrase.id.short()));
    }
}
