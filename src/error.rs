//! Error taxonomy shared by every pipeline stage.
//! Layer errors (`ProviderError`, `StoreError`, `ConfigError`) each collapse
//! into the closed `ErrorKind` set that callers see on a `TranslationResult`.

use serde::{Deserialize, Serialize};

/// Closed set of failure kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthFailed,
    QuotaExceeded,
    RateLimited,
    BadRequest,
    Timeout,
    Transport,
    UnsupportedLanguage,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Transient failures the orchestrator may retry.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Timeout | ErrorKind::Transport
        )
    }

    /// Failures that flag the pipeline as degraded until the provider recovers.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::AuthFailed | ErrorKind::QuotaExceeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AuthFailed => "AUTH_FAILED",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::UnsupportedLanguage => "UNSUPPORTED_LANGUAGE",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a translation provider adapter.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider rejected credentials (status {status})")]
    AuthFailed { status: u16 },
    #[error("provider quota exhausted for the billing period")]
    QuotaExceeded,
    #[error("provider rate limited the request")]
    RateLimited { retry_after_ms: Option<u64> },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("provider request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::AuthFailed { .. } => ErrorKind::AuthFailed,
            ProviderError::QuotaExceeded => ErrorKind::QuotaExceeded,
            ProviderError::RateLimited { .. } => ErrorKind::RateLimited,
            ProviderError::BadRequest(_) => ErrorKind::BadRequest,
            ProviderError::Timeout => ErrorKind::Timeout,
            ProviderError::Transport(_) => ErrorKind::Transport,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Transport(format!("malformed provider response: {e}"))
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

/// Errors raised by a cache or usage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("blocking store task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Errors returned by the non-translating inbound operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("empty phrase")]
    EmptyPhrase,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::UnsupportedLanguage(_) => ErrorKind::UnsupportedLanguage,
            PipelineError::EmptyPhrase => ErrorKind::BadRequest,
            PipelineError::Store(e) => e.kind(),
            PipelineError::Provider(e) => e.kind(),
            PipelineError::Config(_) => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_and_fatal_classes_are_disjoint() {
        let all = [
            ErrorKind::AuthFailed,
            ErrorKind::QuotaExceeded,
            ErrorKind::RateLimited,
            ErrorKind::BadRequest,
            ErrorKind::Timeout,
            ErrorKind::Transport,
            ErrorKind::UnsupportedLanguage,
            ErrorKind::Cancelled,
            ErrorKind::Internal,
        ];
        for kind in all {
            assert!(!(kind.is_retryable() && kind.is_fatal()), "{kind}");
        }
        assert!(ErrorKind::RateLimited.is_retryable());
        assert!(ErrorKind::QuotaExceeded.is_fatal());
        assert!(!ErrorKind::BadRequest.is_retryable());
    }

    #[test]
    fn kind_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorKind::QuotaExceeded).unwrap();
        assert_eq!(json, "\"QUOTA_EXCEEDED\"");
        assert_eq!(ErrorKind::UnsupportedLanguage.to_string(), "UNSUPPORTED_LANGUAGE");
    }
}
