//! Storage configuration for the snapshotter.
//!
//! This module defines where snapshots live and how checkouts are placed.

use serde::Deserialize;
use std::path::PathBuf;

/// Storage settings for the snapshot store.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Root directory of the store (default: `<tmp>/snapshotter`)
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Flush metadata, captured content and directories (default: true)
    #[serde(default = "default_true")]
    pub sync_writes: bool,

    /// Roots destinations must live under; empty allows any path outside the store.
    #[serde(default)]
    pub allowed_destinations: Vec<String>,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            sync_writes: default_true(),
            allowed_destinations: Vec::new(),
        }
    }
}

impl StorageSettings {
    /// Settings for a store rooted at `root`, with every other field defaulted.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }
}

fn default_root() -> PathBuf {
    std::env::temp_dir().join("snapshotter")
}

fn default_true() -> bool {
    true
}
