//! Tracing/logging initialization.

use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: tracing_subscriber::filter::ParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// JSON lines when true, human-readable output otherwise.
    pub json: bool,
    /// Used when `RUST_LOG` is unset.
    pub default_filter: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            json: true,
            default_filter: "info".to_string(),
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Safe to call multiple times (subsequent calls are no-ops); only a bad
/// `default_filter` is reported.
pub fn init_with(config: &ObservabilityConfig) -> Result<(), ObservabilityError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.default_filter).map_err(|source| {
            ObservabilityError::InvalidFilter {
                filter: config.default_filter.clone(),
                source,
            }
        })?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    // Already-installed subscriber is fine.
    let _ = if config.json {
        builder.json().with_target(false).try_init()
    } else {
        builder.with_target(true).try_init()
    };
    Ok(())
}
