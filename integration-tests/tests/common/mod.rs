//! Shared test utilities for integration tests.
//!
//! Provides a throwaway snapshot store and helpers for building layers and
//! inspecting checkouts.

#![allow(dead_code)]

use anyhow::Result;
use snapshotter::infrastructure::config::StorageSettings;
use snapshotter::{DiffId, NaiveSnapshotter};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Integration test context providing shared resources.
pub struct IntegrationTestContext {
    /// Temporary directory holding the store and all checkouts
    pub temp_dir: TempDir,
    /// The store under test
    pub store: NaiveSnapshotter,
}

impl IntegrationTestContext {
    /// Creates a new context with a fresh store.
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let store = NaiveSnapshotter::new(&Self::settings(temp_dir.path()))?;
        Ok(Self { temp_dir, store })
    }

    fn settings(temp: &Path) -> StorageSettings {
        StorageSettings {
            sync_writes: false,
            ..StorageSettings::with_root(temp.join("store"))
        }
    }

    /// Drops the store and opens it again from disk, as after a restart.
    pub fn restart(self) -> Result<Self> {
        let Self { temp_dir, store } = self;
        drop(store);
        let store = NaiveSnapshotter::new(&Self::settings(temp_dir.path()))?;
        Ok(Self { temp_dir, store })
    }

    /// Root of the store.
    pub fn store_root(&self) -> &Path {
        self.store.root()
    }

    /// A checkout path outside the store; not created.
    pub fn checkout(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join("checkouts").join(name)
    }

    /// Number of transaction directories on disk.
    pub fn transaction_dirs(&self) -> Result<usize> {
        Ok(fs::read_dir(self.store_root().join("active"))?.count())
    }

    /// Prepares a checkout from `parent`, writes `files` into it and commits
    /// it as `name`.
    pub fn commit_layer(
        &self,
        name: &str,
        parent: Option<&str>,
        files: &[(&str, &str)],
    ) -> Result<DiffId> {
        let dst = self.checkout(&format!("build-{name}"));
        let parent = parent.map(DiffId::new).transpose()?;
        self.store.prepare(&dst, parent.as_ref())?;
        write_files(&dst, files)?;
        let diff = DiffId::new(name)?;
        self.store.commit(&diff, &dst)?;
        Ok(diff)
    }
}

/// Writes `files` (relative path, content) below `root`.
pub fn write_files(root: &Path, files: &[(&str, &str)]) -> Result<()> {
    for (path, content) in files {
        let file = root.join(path);
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(file, content)?;
    }
    Ok(())
}

/// Reads a file below `root` into a string.
pub fn read(root: &Path, path: &str) -> Result<String> {
    Ok(fs::read_to_string(root.join(path))?)
}
