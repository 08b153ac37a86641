//! Durable per-transaction metadata.
//!
//! Every transaction owns a directory under `<root>/active` holding the
//! destination path (`target`) and, for derived layers, the parent diff id
//! (`parent`). Committing renames that directory to `<root>/diffs/<diff>`,
//! so the same files become the diff's durable record. Files are written
//! to a temporary name, flushed, renamed into place, and the directory is
//! flushed afterwards.

use std::ffi::OsString;
use std::fs::{self, DirBuilder, File};
use std::io::{self, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::manager::DiffId;

/// File holding the destination path of a transaction.
pub const TARGET_FILE: &str = "target";
/// File holding the parent diff id; absent for base layers.
pub const PARENT_FILE: &str = "parent";
/// Captured layer content.
pub const DATA_DIR: &str = "data";

const ACTIVE_DIR: &str = "active";
const DIFFS_DIR: &str = "diffs";
const TMP_SUFFIX: &str = ".tmp";

/// Errors raised while reading or writing metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// A filesystem operation failed.
    #[error("Failed to {action} '{path}': {source}")]
    Io {
        /// What was being attempted.
        action: &'static str,
        /// Path the operation failed on.
        path: PathBuf,
        /// Source error.
        #[source]
        source: io::Error,
    },
    /// A metadata file is present but its contents are unusable.
    #[error("Malformed metadata file '{path}': {reason}")]
    Malformed {
        /// Path of the metadata file.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },
}

impl MetadataError {
    /// Converts into a plain I/O error, keeping the original kind when there is one.
    #[must_use]
    pub fn into_io_error(self) -> io::Error {
        match self {
            Self::Io { source, .. } => source,
            malformed @ Self::Malformed { .. } => {
                io::Error::new(io::ErrorKind::InvalidData, malformed.to_string())
            }
        }
    }
}

/// Metadata read back from a transaction or diff directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    /// Destination path, if the `target` file exists.
    pub target: Option<PathBuf>,
    /// Raw parent identifier, if the `parent` file exists.
    pub parent: Option<String>,
}

/// Directory layout of a snapshot store.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    /// Wraps an existing, canonical store root.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// The store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parent directory of all transaction-scoped directories.
    #[must_use]
    pub fn active_dir(&self) -> PathBuf {
        self.root.join(ACTIVE_DIR)
    }

    /// Parent directory of all committed diffs.
    #[must_use]
    pub fn diffs_dir(&self) -> PathBuf {
        self.root.join(DIFFS_DIR)
    }

    /// Final location of a committed diff.
    #[must_use]
    pub fn diff_dir(&self, diff: &DiffId) -> PathBuf {
        self.diffs_dir().join(diff.as_str())
    }

    /// A fresh, unused transaction directory path. The directory is not created.
    #[must_use]
    pub fn new_transaction_dir(&self) -> PathBuf {
        self.active_dir().join(Uuid::new_v4().to_string())
    }
}

/// Reads and writes metadata files with optional durability.
#[derive(Debug, Clone, Copy)]
pub struct MetadataStore {
    sync: bool,
}

impl MetadataStore {
    /// Creates a store; with `sync` every write is flushed to stable storage.
    #[must_use]
    pub fn new(sync: bool) -> Self {
        Self { sync }
    }

    /// Whether writes are flushed.
    #[must_use]
    pub fn sync(&self) -> bool {
        self.sync
    }

    /// Creates `path` and missing ancestors with mode 0700.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create_dir_all(&self, path: &Path) -> Result<(), MetadataError> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
            .map_err(io_error("create directory", path))
    }

    /// Creates a single new directory with mode 0700 and flushes its parent.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory already exists or cannot be created.
    pub fn create_transaction_dir(&self, path: &Path) -> Result<(), MetadataError> {
        DirBuilder::new()
            .mode(0o700)
            .create(path)
            .map_err(io_error("create transaction directory", path))?;
        if let Some(parent) = path.parent() {
            self.sync_dir(parent)?;
        }
        Ok(())
    }

    /// Records the destination path of a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written durably.
    pub fn write_target(&self, dir: &Path, target: &Path) -> Result<(), MetadataError> {
        self.write_file(dir, TARGET_FILE, target.as_os_str().as_bytes())
    }

    /// Records the parent diff of a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written durably.
    pub fn write_parent(&self, dir: &Path, parent: &DiffId) -> Result<(), MetadataError> {
        self.write_file(dir, PARENT_FILE, parent.as_str().as_bytes())
    }

    /// Reads `target` and `parent` back from a transaction or diff directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file cannot be read or the parent is
    /// not valid UTF-8.
    pub fn read_record(&self, dir: &Path) -> Result<TransactionRecord, MetadataError> {
        let target = read_optional(&dir.join(TARGET_FILE))?
            .filter(|bytes| !bytes.is_empty())
            .map(|bytes| PathBuf::from(OsString::from_vec(bytes)));

        let parent_path = dir.join(PARENT_FILE);
        let parent = read_optional(&parent_path)?
            .map(|bytes| {
                String::from_utf8(bytes).map_err(|_| MetadataError::Malformed {
                    path: parent_path.clone(),
                    reason: "parent id is not valid UTF-8".to_string(),
                })
            })
            .transpose()?;

        Ok(TransactionRecord { target, parent })
    }

    /// Lists the subdirectories of `dir` as `(name, path)` pairs. Entries
    /// whose name is not valid UTF-8 are returned with a lossy name.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn list_dirs(&self, dir: &Path) -> Result<Vec<(String, PathBuf)>, MetadataError> {
        let entries = fs::read_dir(dir).map_err(io_error("read directory", dir))?;
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error("read directory", dir))?;
            let path = entry.path();
            let is_dir = entry
                .file_type()
                .map_err(io_error("stat", &path))?
                .is_dir();
            if is_dir {
                dirs.push((entry.file_name().to_string_lossy().into_owned(), path));
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Flushes a directory's entries to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be opened or flushed.
    pub fn sync_dir(&self, dir: &Path) -> Result<(), MetadataError> {
        if !self.sync {
            return Ok(());
        }
        File::open(dir)
            .and_then(|handle| handle.sync_all())
            .map_err(io_error("sync directory", dir))
    }

    fn write_file(&self, dir: &Path, name: &str, contents: &[u8]) -> Result<(), MetadataError> {
        let final_path = dir.join(name);
        let tmp_path = dir.join(format!("{name}{TMP_SUFFIX}"));

        let mut file = File::create(&tmp_path).map_err(io_error("create", &tmp_path))?;
        file.write_all(contents)
            .map_err(io_error("write", &tmp_path))?;
        if self.sync {
            file.sync_all().map_err(io_error("sync", &tmp_path))?;
        }
        drop(file);

        fs::rename(&tmp_path, &final_path).map_err(io_error("rename", &final_path))?;
        self.sync_dir(dir)?;
        debug!("Wrote metadata file {:?}", final_path);
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, MetadataError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(MetadataError::Io {
            action: "read",
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

fn io_error<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> MetadataError + 'a {
    move |source| MetadataError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}
