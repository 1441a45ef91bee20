#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use parley::config::PipelineConfig;
use parley::error::ProviderError;
use parley::languages::{Language, SourceLanguage};
use parley::{ProviderTranslation, RecipientDirectory, TranslationPipeline, TranslationProvider};

#[derive(Debug, Clone)]
pub struct Call {
    pub text: String,
    pub target: &'static str,
    pub at: Instant,
}

/// In-process provider. Pops scripted errors first, then answers with a
/// canned translation or `[<code>] <text>`.
#[derive(Default)]
pub struct ScriptedProvider {
    errors: Mutex<VecDeque<ProviderError>>,
    canned: Mutex<HashMap<(String, &'static str), String>>,
    calls: Mutex<Vec<Call>>,
    delay: Duration,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_errors(errors: Vec<ProviderError>) -> Self {
        Self {
            errors: Mutex::new(errors.into()),
            ..Self::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn respond(self, text: &str, target: &'static str, translated: &str) -> Self {
        self.canned
            .lock()
            .insert((text.to_string(), target), translated.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl TranslationProvider for ScriptedProvider {
    async fn translate(
        &self,
        text: &str,
        target: &'static Language,
        _source: SourceLanguage,
    ) -> Result<ProviderTranslation, ProviderError> {
        self.calls.lock().push(Call {
            text: text.to_string(),
            target: target.code,
            at: Instant::now(),
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = self.errors.lock().pop_front() {
            return Err(err);
        }
        let canned = self.canned.lock().get(&(text.to_string(), target.code)).cloned();
        Ok(ProviderTranslation {
            text: canned.unwrap_or_else(|| format!("[{}] {text}", target.code)),
            detected_source: None,
        })
    }

    async fn probe(&self) -> bool {
        true
    }
}

pub fn pipeline(provider: &Arc<ScriptedProvider>) -> Arc<TranslationPipeline> {
    pipeline_with(provider, PipelineConfig::default(), None)
}

pub fn pipeline_with(
    provider: &Arc<ScriptedProvider>,
    config: PipelineConfig,
    directory: Option<Arc<dyn RecipientDirectory>>,
) -> Arc<TranslationPipeline> {
    let mut builder = TranslationPipeline::builder(config).provider(provider.clone());
    if let Some(directory) = directory {
        builder = builder.directory(directory);
    }
    builder.start().expect("pipeline starts")
}

pub fn ids(ids: &[&str]) -> Vec<String> {
    ids.iter().map(|s| s.to_string()).collect()
}
