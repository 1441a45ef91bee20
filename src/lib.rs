//! Parley: real-time multilingual chat translation.
//! Tiered translation cache, usage-driven priority warming, single-flight
//! provider calls and per-room fan-out behind one `TranslationPipeline`.

pub mod analyzer;
pub mod config;
pub mod error;
pub mod fanout;
pub mod languages;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod provider;
pub mod store;
pub mod telemetry;
pub mod translate;
pub mod warmer;

pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError, ProviderError};
pub use fanout::{FanOutResult, RecipientDirectory, StaticDirectory};
pub use pipeline::{HealthReport, PipelineBuilder, TranslationPipeline};
pub use provider::{DeepLClient, ProviderTranslation, TranslationProvider};
pub use translate::{TierHit, TranslationRequest, TranslationResult};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `parley=info` filter; `PARLEY_LOG_FORMAT=json` switches to JSON lines.
/// Later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("parley=info"));
    let json = std::env::var("PARLEY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if installed.is_ok() {
        tracing::info!(json, "tracing initialized");
    }
}
