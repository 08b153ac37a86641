//! Destination policy for prepared checkouts.
//!
//! This module normalises caller-supplied destination paths and enforces
//! where checkouts may be placed: never overlapping the snapshot store and,
//! when configured, only inside a set of allowed roots.

use crate::infrastructure::config::StorageSettings;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid path '{path}': {source}")]
    InvalidPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Path '{0}' cannot be resolved")]
    Unresolvable(PathBuf),
    #[error("Path '{0}' exists and is not a directory")]
    NotADirectory(PathBuf),
    #[error("Security Violation: Path '{target:?}' is outside the allowed destination roots.")]
    SecurityViolation { target: PathBuf },
    #[error("Path '{target:?}' overlaps the snapshot store at '{root:?}'")]
    OverlapsStore { target: PathBuf, root: PathBuf },
    #[error("Invalid allowed path configuration '{path}': {source}")]
    InvalidConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Enforces placement rules on destination paths.
#[derive(Debug)]
pub struct DestinationPolicy {
    allowed_paths: Vec<PathBuf>,
    store_root: PathBuf,
}

impl DestinationPolicy {
    /// Creates a new policy from settings. `store_root` must already be canonical.
    ///
    /// # Errors
    ///
    /// Returns an error if any configured allowed path cannot be canonicalized.
    pub fn new(settings: &StorageSettings, store_root: &Path) -> Result<Self, PolicyError> {
        let mut allowed_paths = Vec::with_capacity(settings.allowed_destinations.len());

        for path_str in &settings.allowed_destinations {
            let path = PathBuf::from(path_str);
            let canonical = dunce::canonicalize(&path).map_err(|e| PolicyError::InvalidConfig {
                path: path.clone(),
                source: e,
            })?;
            allowed_paths.push(canonical);
        }

        Ok(Self {
            allowed_paths,
            store_root: store_root.to_path_buf(),
        })
    }

    /// Normalises `target` and checks it against the policy, returning the
    /// normalised path used as the transaction key.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The path cannot be resolved
    /// - The path exists and is not a directory
    /// - The path overlaps the snapshot store
    /// - The path is outside all allowed roots
    pub fn validate(&self, target: &Path) -> Result<PathBuf, PolicyError> {
        let normalized = normalize(target)?;

        if normalized.exists() && !normalized.is_dir() {
            return Err(PolicyError::NotADirectory(normalized));
        }

        if normalized.starts_with(&self.store_root) || self.store_root.starts_with(&normalized) {
            return Err(PolicyError::OverlapsStore {
                target: normalized,
                root: self.store_root.clone(),
            });
        }

        if self.allowed_paths.is_empty()
            || self
                .allowed_paths
                .iter()
                .any(|allowed| normalized.starts_with(allowed))
        {
            return Ok(normalized);
        }

        Err(PolicyError::SecurityViolation { target: normalized })
    }
}

/// Makes `target` absolute and resolves symlinks in its longest existing
/// prefix. The missing suffix is appended verbatim.
pub fn normalize(target: &Path) -> Result<PathBuf, PolicyError> {
    let absolute = std::path::absolute(target).map_err(|e| PolicyError::InvalidPath {
        path: target.to_path_buf(),
        source: e,
    })?;

    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    // A trailing `..` has no file name and cannot be resolved lexically.
    while !existing.exists() {
        let (Some(name), Some(parent)) = (existing.file_name(), existing.parent()) else {
            return Err(PolicyError::Unresolvable(absolute.clone()));
        };
        missing.push(name.to_os_string());
        existing = parent;
    }

    let mut resolved = dunce::canonicalize(existing).map_err(|e| PolicyError::InvalidPath {
        path: existing.to_path_buf(),
        source: e,
    })?;
    for name in missing.iter().rev() {
        resolved.push(name);
    }
    Ok(resolved)
}
