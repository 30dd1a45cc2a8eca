//! Logging system configuration and initialization
//!
//! This module provides the logging setup used by the harvester binary:
//! - Console output, plain or structured JSON
//! - Optional daily-rolling file output (non-blocking writer)
//! - Level from configuration, overridable through `RUST_LOG`
//! - Local-time timestamps

#![allow(clippy::uninlined_format_args)]

use std::sync::Mutex;

use anyhow::{Result, anyhow};
use once_cell::sync::Lazy;
use tracing::info;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

pub use crate::infrastructure::config::LoggingConfig;

// Keeps the non-blocking file writer alive for the lifetime of the process
static LOG_GUARDS: Lazy<Mutex<Vec<tracing_appender::non_blocking::WorkerGuard>>> =
    Lazy::new(|| Mutex::new(Vec::new()));

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Dependencies that are noisy at debug level
const QUIET_TARGETS: &[(&str, &str)] = &[
    ("reqwest", "info"),
    ("hyper", "warn"),
    ("hyper_util", "warn"),
    ("h2", "warn"),
    ("html5ever", "warn"),
    ("selectors", "warn"),
    ("tokio", "info"),
];

/// Initialize the logging system with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Build the env filter for `config`
///
/// `RUST_LOG` wins when set. Otherwise the configured level applies to the
/// harvester and noisy dependencies are capped unless the level is `trace`.
pub fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| anyhow!("Invalid log level '{}': {}", config.level, e))?;
    if !config.level.to_lowercase().contains("trace") {
        for (target, level) in QUIET_TARGETS {
            let directive = format!("{}={}", target, level)
                .parse()
                .map_err(|e| anyhow!("Invalid log directive for {}: {}", target, e))?;
            filter = filter.add_directive(directive);
        }
    }
    Ok(filter)
}

/// Initialize logging with custom configuration
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    let env_filter = build_env_filter(config)?;
    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.console_output {
        let console = if config.json_format {
            fmt::layer()
                .json()
                .with_timer(ChronoLocal::rfc_3339())
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_timer(ChronoLocal::new("%H:%M:%S%.3f".to_string()))
                .with_target(false)
                .boxed()
        };
        layers.push(console);
    }

    if config.file_output {
        std::fs::create_dir_all(&config.log_dir).map_err(|e| {
            anyhow!("Failed to create log directory {:?}: {}", config.log_dir, e)
        })?;
        let appender = rolling::daily(&config.log_dir, &config.file_prefix);
        let (writer, guard) = non_blocking(appender);
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("Log guard registry poisoned"))?
            .push(guard);
        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(ChronoLocal::rfc_3339())
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;

    info!(
        level = %config.level,
        console = config.console_output,
        file = config.file_output,
        "Logging initialized"
    );
    Ok(())
}
