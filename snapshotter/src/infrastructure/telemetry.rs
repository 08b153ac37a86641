use anyhow::{Context, Result};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use super::config::TelemetrySettings;

/// Builder for setting up structured logging.
pub struct TelemetryBuilder {
    service_name: String,
    log_level: String,
    json: bool,
}

impl TelemetryBuilder {
    /// Creates a builder logging at `info` in human-readable form.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_level: "info".to_string(),
            json: false,
        }
    }

    /// Applies the level and format from settings.
    #[must_use]
    pub fn with_settings(self, settings: &TelemetrySettings) -> Self {
        self.with_log_level(settings.log_level.clone())
            .with_json(settings.json)
    }

    /// Sets the default filter used when `RUST_LOG` is unset.
    #[must_use]
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Switches between JSON lines and human-readable output.
    #[must_use]
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Installs the global tracing subscriber.
    ///
    /// # Errors
    ///
    /// Returns an error if a global subscriber is already installed.
    pub fn init(self) -> Result<()> {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level));

        let fmt_layer = if self.json {
            fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .boxed()
        } else {
            fmt::layer().with_target(true).boxed()
        };

        Registry::default()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .context("Failed to init subscriber")?;

        tracing::debug!(service = %self.service_name, "Telemetry initialized");
        Ok(())
    }
}
