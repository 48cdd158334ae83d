//! Logging initialization.
//!
//! Builds a `tracing-subscriber` stack from [`TelemetryConfig`]: an
//! `EnvFilter` seeded from the verbosity knob and overridable through the
//! `LOG` environment variable, plus one stderr format layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelemetryConfig {
    /// 0 = errors only, 1 = info, 2+ = debug.
    #[serde(default)]
    pub verbosity: u8,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Error)]
#[error("telemetry already initialized")]
pub struct TelemetryError(#[source] tracing_subscriber::util::TryInitError);

/// Installs the global subscriber. Fails if one is already set, so tests
/// and embedders can call it opportunistically.
pub fn init(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(config.verbosity).into())
        .with_env_var("LOG")
        .from_env_lossy();

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(build_stderr_layer(config.format));
    layers.push(Box::new(filter));

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(TelemetryError)
}

fn build_stderr_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Pretty => Box::new(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_thread_ids(true),
        ),
        LogFormat::Compact => Box::new(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_thread_ids(true),
        ),
        LogFormat::Json => Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_thread_ids(true)
                .with_current_span(true)
                .with_span_list(true),
        ),
    }
}

fn level_from_verbosity(verbosity: u8) -> tracing::metadata::LevelFilter {
    match verbosity {
        0 => tracing::metadata::LevelFilter::ERROR,
        1 => tracing::metadata::LevelFilter::INFO,
        _ => tracing::metadata::LevelFilter::DEBUG,
    }
}
