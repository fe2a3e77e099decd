//! Process-wide log output.
//!
//! The engine logs through the `log` facade; this installs a
//! `tracing-subscriber` formatter that also receives those records.

use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub directive: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directive: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

static INIT: Once = Once::new();

fn filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.directive))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls (or a subscriber installed
/// elsewhere) leave the existing one in place.
pub fn init(config: &LogConfig) {
    INIT.call_once(|| {
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter(config))
            .with_target(true);
        let installed = match config.format {
            LogFormat::Pretty => builder.finish().try_init(),
            LogFormat::Json => builder.json().finish().try_init(),
        };
        if installed.is_err() {
            tracing::debug!("log subscriber already installed; keeping it");
        }
    });
}
