//! Types for snapshot management.
//!
//! This module provides the diff identifier, error types and the data
//! structures describing active transactions.

use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::snapshot::copy::CopyError;
use crate::snapshot::metadata::MetadataError;

const MAX_DIFF_ID_LEN: usize = 255;

/// Identifier of a committed diff, chosen by the caller at commit time.
///
/// A diff id names a directory under the store's `diffs/` directory, so it
/// must be a single, non-empty path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct DiffId(String);

impl DiffId {
    /// Creates a diff id after validating it.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::InvalidDiffId`] if the id is empty, `.`,
    /// `..`, longer than 255 bytes, or contains `/` or NUL.
    pub fn new(id: impl Into<String>) -> Result<Self, SnapshotError> {
        let id = id.into();
        let reason = if id.is_empty() {
            Some("empty ID")
        } else if id == "." || id == ".." {
            Some("reserved name")
        } else if id.len() > MAX_DIFF_ID_LEN {
            Some("longer than 255 bytes")
        } else if id.contains('/') || id.contains('\0') {
            Some("contains '/' or NUL")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(SnapshotError::InvalidDiffId {
                id,
                reason: reason.to_string(),
            }),
            None => Ok(Self(id)),
        }
    }

    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DiffId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DiffId {
    type Error = SnapshotError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for DiffId {
    type Error = SnapshotError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// The step of an operation an I/O failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Creating the transaction-scoped directory.
    CreateTransaction,
    /// Writing `target` or `parent`.
    WriteMetadata,
    /// Creating the destination directory.
    CreateDestination,
    /// Materialising the parent's content into the destination.
    CopyParent,
    /// Copying the destination into the transaction's data area.
    CaptureContent,
    /// Renaming the transaction directory to its diff location.
    Rename,
    /// Removing a transaction directory.
    RemoveTransaction,
    /// Scanning the store during recovery.
    Scan,
    /// Hashing a diff's content.
    Digest,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::CreateTransaction => write!(f, "create transaction"),
            Phase::WriteMetadata => write!(f, "write metadata"),
            Phase::CreateDestination => write!(f, "create destination"),
            Phase::CopyParent => write!(f, "copy parent"),
            Phase::CaptureContent => write!(f, "capture content"),
            Phase::Rename => write!(f, "rename into diff"),
            Phase::RemoveTransaction => write!(f, "remove transaction"),
            Phase::Scan => write!(f, "scan store"),
            Phase::Digest => write!(f, "digest diff"),
        }
    }
}

/// Errors that can occur during snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A transaction is already active for this destination.
    #[error("Transaction already active for destination: {0}")]
    TransactionExists(PathBuf),
    /// The destination does not name an active transaction.
    #[error("{0} is not an active transaction")]
    UnknownTransaction(PathBuf),
    /// Another operation is in flight for this transaction.
    #[error("Transaction {path} is busy ({state})")]
    TransactionBusy {
        /// Destination of the transaction.
        path: PathBuf,
        /// State the transaction is in.
        state: TransactionState,
    },
    /// The parent given to prepare is not a committed diff.
    #[error("Specified parent does not exist: {0}")]
    UnknownParent(DiffId),
    /// The diff is not known to the store.
    #[error("Diff not found: {0}")]
    DiffNotFound(DiffId),
    /// A diff with this id already exists or is being committed.
    #[error("Diff already exists: {0}")]
    DiffAlreadyExists(DiffId),
    /// The diff id is not a valid single path component.
    #[error("Invalid diff id '{id}': {reason}")]
    InvalidDiffId {
        /// Rejected id.
        id: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The destination path cannot be used.
    #[error("Invalid destination '{path}': {reason}")]
    InvalidDestination {
        /// Rejected path.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },
    /// The destination lies outside the allowed roots.
    #[error("Destination policy violation: {0}")]
    PolicyViolation(String),
    /// The storage root cannot be created or used.
    #[error("Unusable storage root '{path}': {source}")]
    Storage {
        /// Storage root.
        path: PathBuf,
        /// Source error.
        #[source]
        source: std::io::Error,
    },
    /// An I/O operation failed.
    #[error("Failed to {phase} at '{path}': {source}")]
    Io {
        /// Which step failed.
        phase: Phase,
        /// Path the failure relates to.
        path: PathBuf,
        /// Source error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The operation was cancelled before it finished.
    #[error("Operation cancelled for {0}")]
    Cancelled(PathBuf),
    /// On-disk metadata contradicts the store's invariants.
    #[error("Corrupt metadata at '{path}': {reason}")]
    CorruptMetadata {
        /// Offending directory or file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },
    /// An operation failed and its cleanup failed as well.
    #[error("{error}; cleanup of '{path}' also failed: {cleanup}")]
    Incomplete {
        /// The original failure.
        error: Box<SnapshotError>,
        /// Directory that could not be removed.
        path: PathBuf,
        /// The cleanup failure.
        cleanup: std::io::Error,
    },
}

impl SnapshotError {
    pub(crate) fn io(
        phase: Phase,
        path: &Path,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Io {
            phase,
            path: path.to_path_buf(),
            source: source.into(),
        }
    }

    pub(crate) fn from_metadata(phase: Phase, path: &Path, error: MetadataError) -> Self {
        Self::io(phase, path, error)
    }

    pub(crate) fn from_copy(phase: Phase, destination: &Path, error: CopyError) -> Self {
        match error {
            CopyError::Cancelled => Self::Cancelled(destination.to_path_buf()),
            other => Self::io(phase, destination, other),
        }
    }
}

/// Lifecycle state of an active transaction.
///
/// Only [`TransactionState::Ready`] transactions accept commit or rollback;
/// the other states mark an operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    /// Prepare is materialising the checkout.
    Preparing,
    /// The checkout is available to the caller.
    Ready,
    /// Commit is capturing and renaming the transaction.
    Committing,
    /// Rollback is removing the transaction directory.
    RollingBack,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Preparing => write!(f, "preparing"),
            TransactionState::Ready => write!(f, "ready"),
            TransactionState::Committing => write!(f, "committing"),
            TransactionState::RollingBack => write!(f, "rolling back"),
        }
    }
}

/// A writable checkout in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSnapshot {
    /// The normalised destination path.
    pub(crate) destination: PathBuf,
    /// Diff the checkout was prepared from.
    pub(crate) parent: Option<DiffId>,
    /// Transaction-scoped directory under the store root.
    pub(crate) metadata_dir: PathBuf,
    /// Current lifecycle state.
    pub(crate) state: TransactionState,
}

impl ActiveSnapshot {
    /// Get the destination path.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Get the parent diff, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&DiffId> {
        self.parent.as_ref()
    }

    /// Get the transaction-scoped directory.
    #[must_use]
    pub fn metadata_dir(&self) -> &Path {
        &self.metadata_dir
    }

    /// Get the lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }
}

/// Outcome of the startup scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Committed diffs added to the parent index.
    pub diffs_indexed: usize,
    /// Transactions restored to the active set.
    pub transactions_restored: usize,
    /// Unusable transaction directories that were removed.
    pub orphans_removed: usize,
}
