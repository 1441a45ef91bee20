//! Machine-translation provider adapter.
//! Owns HTTP transport, auth header composition, the per-request timeout and
//! status classification. Never retries: retry policy lives in the orchestrator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::ProviderConfig;
use crate::error::{ErrorKind, ProviderError};
use crate::languages::{self, Language, SourceLanguage};

/// A successful provider translation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTranslation {
    pub text: String,
    pub detected_source: Option<&'static Language>,
}

/// Backend seam for machine translation.
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// Translate `text` into `target`. `SourceLanguage::Auto` asks the
    /// provider to detect the source.
    async fn translate(
        &self,
        text: &str,
        target: &'static Language,
        source: SourceLanguage,
    ) -> Result<ProviderTranslation, ProviderError>;

    /// Cheap reachability check used by health reporting.
    async fn probe(&self) -> bool;

    /// Same as [`translate`](Self::translate) but takes raw internal codes.
    /// Unsupported codes fail with `BadRequest` without touching the network.
    async fn translate_code(
        &self,
        text: &str,
        target: &str,
        source: Option<&str>,
    ) -> Result<ProviderTranslation, ProviderError> {
        let target_lang = languages::lookup(target)
            .ok_or_else(|| ProviderError::BadRequest(format!("unsupported target language: {target}")))?;
        let source_lang = SourceLanguage::parse(source)
            .map_err(|code| ProviderError::BadRequest(format!("unsupported source language: {code}")))?;
        self.translate(text, target_lang, source_lang).await
    }
}

/// Map a non-success HTTP status to the provider error taxonomy.
pub fn classify_status(status: u16, retry_after_secs: Option<u64>, body: &str) -> ProviderError {
    match status {
        401 | 403 => ProviderError::AuthFailed { status },
        429 => ProviderError::RateLimited {
            retry_after_ms: retry_after_secs.map(|s| s * 1000),
        },
        456 => ProviderError::QuotaExceeded,
        400 | 413 | 414 | 415 | 422 => ProviderError::BadRequest(snippet(status, body)),
        _ => ProviderError::Transport(snippet(status, body)),
    }
}

fn snippet(status: u16, body: &str) -> String {
    let body: String = body.chars().take(200).collect();
    if body.is_empty() {
        format!("status {status}")
    } else {
        format!("status {status}: {body}")
    }
}

/// DeepL-compatible REST client.
pub struct DeepLClient {
    http: reqwest::Client,
    base_url: String,
    authorization: String,
}

impl DeepLClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::AuthFailed { status: 0 });
        }

        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            authorization: format!("{} {}", config.auth_scheme, config.api_key),
        })
    }

    async fn error_from_response(resp: reqwest::Response) -> ProviderError {
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let body = resp.text().await.unwrap_or_default();
        classify_status(status, retry_after, &body)
    }
}

#[async_trait]
impl TranslationProvider for DeepLClient {
    async fn translate(
        &self,
        text: &str,
        target: &'static Language,
        source: SourceLanguage,
    ) -> Result<ProviderTranslation, ProviderError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("text", text),
            ("target_lang", target.provider_target),
            ("preserve_formatting", "1"),
            ("formality", "default"),
        ];
        if let SourceLanguage::Known(lang) = source {
            form.push(("source_lang", lang.provider_source));
        }

        let resp = self
            .http
            .post(format!("{}/v2/translate", self.base_url))
            .header("Authorization", &self.authorization)
            .form(&form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let err = Self::error_from_response(resp).await;
            warn!(target_lang = target.code, error = %err, "provider call failed");
            return Err(err);
        }

        let body: TranslateResponse = resp.json().await?;
        let first = body
            .translations
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Transport("provider returned no translations".into()))?;

        let detected_source = first
            .detected_source_language
            .as_deref()
            .and_then(languages::from_provider);
        debug!(
            target_lang = target.code,
            detected = detected_source.map(|l| l.code),
            "provider translation ok"
        );

        Ok(ProviderTranslation {
            text: first.text,
            detected_source,
        })
    }

    async fn probe(&self) -> bool {
        match self
            .http
            .get(format!("{}/v2/usage", self.base_url))
            .header("Authorization", &self.authorization)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "provider probe failed");
                false
            }
        }
    }
}

/// Degraded flag shared by everything that calls the provider. Raised by
/// credential or quota failures, cleared by the next success.
#[derive(Debug, Default)]
pub struct ProviderHealth {
    degraded: AtomicBool,
    last_fatal: Mutex<Option<ErrorKind>>,
}

impl ProviderHealth {
    pub fn record<T>(&self, result: &Result<T, ProviderError>) {
        match result {
            Ok(_) => {
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!("provider recovered, clearing degraded flag");
                    *self.last_fatal.lock() = None;
                }
            }
            Err(e) if e.kind().is_fatal() => {
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    error!(error_kind = %e.kind(), error = %e, "provider degraded");
                }
                *self.last_fatal.lock() = Some(e.kind());
            }
            Err(_) => {}
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Kind of the failure that raised the flag, while it is raised.
    pub fn reason(&self) -> Option<ErrorKind> {
        *self.last_fatal.lock()
    }
}

// --- Response types ---

#[derive(Deserialize)]
struct TranslateResponse {
    translations: Vec<TranslationItem>,
}

#[derive(Deserialize)]
struct TranslationItem {
    text: String,
    detected_source_language: Option<String>,
}
