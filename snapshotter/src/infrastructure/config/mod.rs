//! Configuration management for the snapshotter.
//!
//! Settings are layered from built-in defaults and `SNAPSHOTTER__*`
//! environment variables (`__` separates nested keys).
//!
//! # Example
//!
//! ```
//! use snapshotter::infrastructure::config::Settings;
//!
//! let settings = Settings::new().expect("Failed to load configuration");
//! println!("store root: {}", settings.storage.root.display());
//! ```

pub mod storage;
pub mod telemetry;

pub use storage::StorageSettings;
pub use telemetry::TelemetrySettings;

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

/// Top-level configuration for the snapshotter.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Storage settings.
    #[serde(default)]
    pub storage: StorageSettings,
    /// Telemetry settings.
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl Settings {
    /// Creates a new settings instance from environment variables and defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be built or deserialized.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_environment(Environment::with_prefix("SNAPSHOTTER"))
    }

    fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
        let default_root = StorageSettings::default().root;

        let s = Config::builder()
            // Start with default values
            .set_default("storage.root", default_root.to_string_lossy().to_string())?
            .set_default("storage.sync_writes", true)?
            .set_default("telemetry.log_level", "info")?
            .set_default("telemetry.json", false)?
            // Merge in Environment variables
            .add_source(
                environment
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("storage.allowed_destinations"),
            )
            .build()?;

        s.try_deserialize()
    }
}
