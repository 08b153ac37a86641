//! Telemetry configuration for the snapshotter.
//!
//! This module defines logging settings.

use serde::Deserialize;

/// Telemetry settings for logging.
#[derive(Debug, Deserialize, Clone)]
pub struct TelemetrySettings {
    /// Default log filter when `RUST_LOG` is unset (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON lines instead of human-readable output (default: false)
    #[serde(default)]
    pub json: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
