//! Naive snapshot manager.
//!
//! Checkouts are materialised by copying the parent's content into the
//! destination, and commits capture the destination by copying it back
//! into the transaction directory before renaming that directory into its
//! final diff location. The rename is the commit point.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use super::recovery;
use super::types::{
    ActiveSnapshot, DiffId, Phase, RecoveryReport, SnapshotError, TransactionState,
};
use crate::infrastructure::audit::{self, AuditEvent};
use crate::infrastructure::config::StorageSettings;
use crate::snapshot::backend::{Mount, Snapshotter};
use crate::snapshot::copy::{self, CancelToken, CopyOptions};
use crate::snapshot::hashing;
use crate::snapshot::metadata::{MetadataStore, StoreLayout, DATA_DIR};
use crate::snapshot::policy::{self, DestinationPolicy, PolicyError};

/// In-memory mirror of the store: active transactions keyed by their
/// normalised destination, and the parent index of committed diffs.
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) active: HashMap<PathBuf, ActiveSnapshot>,
    pub(crate) parents: HashMap<DiffId, Option<DiffId>>,
    /// Diff ids reserved by commits that have not finished yet.
    pub(crate) pending_diffs: HashSet<DiffId>,
}

/// Snapshot manager backed by full directory copies.
pub struct NaiveSnapshotter {
    layout: StoreLayout,
    metadata: MetadataStore,
    policy: DestinationPolicy,
    state: Mutex<State>,
    recovery: RecoveryReport,
    #[cfg(test)]
    fail_removals: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for NaiveSnapshotter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("NaiveSnapshotter")
            .field("root", &self.layout.root())
            .field("active_count", &state.active.len())
            .field("diff_count", &state.parents.len())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl NaiveSnapshotter {
    /// Opens the store described by `settings`, creating the root with mode
    /// 0700 when absent and rebuilding state from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The root cannot be created or is not a directory
    /// - A configured allowed destination cannot be resolved
    /// - The recovery scan fails or finds corrupt diff metadata
    #[instrument(skip(settings), fields(root = ?settings.root))]
    pub fn new(settings: &StorageSettings) -> Result<Self, SnapshotError> {
        let metadata = MetadataStore::new(settings.sync_writes);
        let root = ensure_root(&settings.root, &metadata)?;
        let layout = StoreLayout::new(root);

        for dir in [layout.active_dir(), layout.diffs_dir()] {
            metadata
                .create_dir_all(&dir)
                .map_err(|e| SnapshotError::Storage {
                    path: dir.clone(),
                    source: e.into_io_error(),
                })?;
        }

        let policy = DestinationPolicy::new(settings, layout.root())
            .map_err(|e| SnapshotError::PolicyViolation(e.to_string()))?;

        let (state, report) = recovery::recover(&layout, &metadata)?;

        info!(
            diffs = report.diffs_indexed,
            active = report.transactions_restored,
            orphans = report.orphans_removed,
            "Opened snapshot store at {:?}",
            layout.root()
        );
        audit::log_audit(&AuditEvent::StoreOpened {
            root: layout.root().to_path_buf(),
            report,
        });

        Ok(Self {
            layout,
            metadata,
            policy,
            state: Mutex::new(state),
            recovery: report,
            #[cfg(test)]
            fail_removals: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Opens a store at `root` with default settings.
    ///
    /// # Errors
    ///
    /// See [`NaiveSnapshotter::new`].
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        Self::new(&StorageSettings::with_root(root))
    }

    /// Prepares a writable checkout at `dst`, copying the content of
    /// `parent` into it when given. No mounts are returned.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `dst` is rejected by the destination policy
    /// - `parent` is not a committed diff
    /// - A transaction is already active for `dst`
    /// - Metadata cannot be written or the parent cannot be copied
    #[instrument(skip(self))]
    pub fn prepare(&self, dst: &Path, parent: Option<&DiffId>) -> Result<Vec<Mount>, SnapshotError> {
        self.prepare_inner(dst, parent, None)
    }

    /// Like [`NaiveSnapshotter::prepare`], but stops as soon as `cancel` is
    /// triggered. A cancelled prepare leaves no transaction behind.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Cancelled`] when cancelled, and otherwise
    /// the same errors as [`NaiveSnapshotter::prepare`].
    #[instrument(skip(self, cancel))]
    pub fn prepare_with_cancel(
        &self,
        dst: &Path,
        parent: Option<&DiffId>,
        cancel: &CancelToken,
    ) -> Result<Vec<Mount>, SnapshotError> {
        self.prepare_inner(dst, parent, Some(cancel))
    }

    fn prepare_inner(
        &self,
        dst: &Path,
        parent: Option<&DiffId>,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<Mount>, SnapshotError> {
        let destination = self.validate_destination(dst)?;
        let metadata_dir = self.layout.new_transaction_dir();

        {
            let mut state = self.state.lock();
            if let Some(parent) = parent {
                if !state.parents.contains_key(parent) {
                    return Err(SnapshotError::UnknownParent(parent.clone()));
                }
            }
            if state.active.contains_key(&destination) {
                return Err(SnapshotError::TransactionExists(destination));
            }
            state.active.insert(
                destination.clone(),
                ActiveSnapshot {
                    destination: destination.clone(),
                    parent: parent.cloned(),
                    metadata_dir: metadata_dir.clone(),
                    state: TransactionState::Preparing,
                },
            );
        }

        info!(
            "Preparing transaction {:?} for {:?} (parent: {:?})",
            metadata_dir, destination, parent
        );

        match self.materialize(&destination, parent, &metadata_dir, cancel) {
            Ok(()) => {
                self.set_state(&destination, TransactionState::Ready);
                Ok(Vec::new())
            }
            Err(error) => {
                warn!("Prepare of {:?} failed: {}", destination, error);
                match self.remove_transaction_dir(&metadata_dir) {
                    Ok(()) => {
                        self.state.lock().active.remove(&destination);
                        Err(error)
                    }
                    Err(cleanup) => {
                        // The directory is still on disk, so the transaction
                        // stays registered and can be rolled back later.
                        self.set_state(&destination, TransactionState::Ready);
                        Err(SnapshotError::Incomplete {
                            error: Box::new(error),
                            path: metadata_dir,
                            cleanup,
                        })
                    }
                }
            }
        }
    }

    fn materialize(
        &self,
        destination: &Path,
        parent: Option<&DiffId>,
        metadata_dir: &Path,
        cancel: Option<&CancelToken>,
    ) -> Result<(), SnapshotError> {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(SnapshotError::Cancelled(destination.to_path_buf()));
        }

        self.metadata
            .create_transaction_dir(metadata_dir)
            .map_err(|e| SnapshotError::from_metadata(Phase::CreateTransaction, metadata_dir, e))?;
        // `target` marks the transaction as restorable, so it goes last.
        if let Some(parent) = parent {
            self.metadata
                .write_parent(metadata_dir, parent)
                .map_err(|e| SnapshotError::from_metadata(Phase::WriteMetadata, metadata_dir, e))?;
        }
        self.metadata
            .write_target(metadata_dir, destination)
            .map_err(|e| SnapshotError::from_metadata(Phase::WriteMetadata, metadata_dir, e))?;

        fs::create_dir_all(destination)
            .map_err(|e| SnapshotError::io(Phase::CreateDestination, destination, e))?;

        if let Some(parent) = parent {
            let source = self.layout.diff_dir(parent).join(DATA_DIR);
            copy::copy_dir(
                &source,
                destination,
                CopyOptions {
                    sync: false,
                    cancel,
                },
            )
            .map_err(|e| SnapshotError::from_copy(Phase::CopyParent, destination, e))?;
        }

        Ok(())
    }

    /// Captures the content of `dst` as the immutable diff `diff`.
    ///
    /// On failure the transaction stays active, so the caller can retry
    /// the commit (possibly under another id) or roll back.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `dst` is not an active transaction, or is busy
    /// - `diff` is already committed, being committed, or present on disk
    /// - The content cannot be captured or the rename fails
    #[instrument(skip(self))]
    pub fn commit(&self, diff: &DiffId, dst: &Path) -> Result<(), SnapshotError> {
        let destination = resolve(dst);

        let active = {
            let mut state = self.state.lock();
            let reserved = state.parents.contains_key(diff) || state.pending_diffs.contains(diff);
            let entry = state
                .active
                .get_mut(&destination)
                .ok_or_else(|| SnapshotError::UnknownTransaction(destination.clone()))?;
            if entry.state != TransactionState::Ready {
                return Err(SnapshotError::TransactionBusy {
                    path: destination,
                    state: entry.state,
                });
            }
            if reserved {
                return Err(SnapshotError::DiffAlreadyExists(diff.clone()));
            }
            entry.state = TransactionState::Committing;
            let active = entry.clone();
            state.pending_diffs.insert(diff.clone());
            active
        };

        info!("Committing {:?} as diff {}", destination, diff);
        let result = self.capture_and_rename(&active, diff);

        let mut state = self.state.lock();
        state.pending_diffs.remove(diff);
        match result {
            Ok(()) => {
                state.parents.insert(diff.clone(), active.parent.clone());
                state.active.remove(&destination);
                drop(state);

                info!("Committed diff {} (parent: {:?})", diff, active.parent);
                audit::log_audit(&AuditEvent::SnapshotCommitted {
                    diff: diff.clone(),
                    parent: active.parent,
                    destination,
                });
                Ok(())
            }
            Err(error) => {
                if let Some(entry) = state.active.get_mut(&destination) {
                    entry.state = TransactionState::Ready;
                }
                drop(state);
                warn!("Commit of {:?} as {} failed: {}", destination, diff, error);
                Err(error)
            }
        }
    }

    fn capture_and_rename(&self, active: &ActiveSnapshot, diff: &DiffId) -> Result<(), SnapshotError> {
        let diff_dir = self.layout.diff_dir(diff);
        if fs::symlink_metadata(&diff_dir).is_ok() {
            return Err(SnapshotError::DiffAlreadyExists(diff.clone()));
        }

        let data_dir = active.metadata_dir.join(DATA_DIR);
        match fs::symlink_metadata(&data_dir) {
            Ok(_) => {
                debug!("Removing stale capture at {:?}", data_dir);
                fs::remove_dir_all(&data_dir)
                    .map_err(|e| SnapshotError::io(Phase::CaptureContent, &data_dir, e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(SnapshotError::io(Phase::CaptureContent, &data_dir, e)),
        }

        copy::copy_dir(
            &active.destination,
            &data_dir,
            CopyOptions {
                sync: self.metadata.sync(),
                cancel: None,
            },
        )
        .map_err(|e| SnapshotError::from_copy(Phase::CaptureContent, &active.destination, e))?;
        self.metadata
            .sync_dir(&active.metadata_dir)
            .map_err(|e| SnapshotError::from_metadata(Phase::CaptureContent, &active.metadata_dir, e))?;

        fs::rename(&active.metadata_dir, &diff_dir).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists | io::ErrorKind::DirectoryNotEmpty => {
                SnapshotError::DiffAlreadyExists(diff.clone())
            }
            _ => SnapshotError::io(Phase::Rename, &diff_dir, e),
        })?;

        // The diff is visible from here on; flush failures no longer undo it.
        for dir in [self.layout.active_dir(), self.layout.diffs_dir()] {
            if let Err(e) = self.metadata.sync_dir(&dir) {
                warn!("Failed to flush {:?} after commit of {}: {}", dir, diff, e);
            }
        }
        Ok(())
    }

    /// Discards the transaction for `dst`. The content of `dst` is left as is.
    ///
    /// If the transaction directory cannot be removed completely, the
    /// transaction stays active so the leftover state is not lost.
    ///
    /// # Errors
    ///
    /// Returns an error if `dst` is not an active transaction, is busy, or
    /// its directory cannot be removed.
    #[instrument(skip(self))]
    pub fn rollback(&self, dst: &Path) -> Result<(), SnapshotError> {
        let destination = resolve(dst);

        let metadata_dir = {
            let mut state = self.state.lock();
            let entry = state
                .active
                .get_mut(&destination)
                .ok_or_else(|| SnapshotError::UnknownTransaction(destination.clone()))?;
            if entry.state != TransactionState::Ready {
                return Err(SnapshotError::TransactionBusy {
                    path: destination,
                    state: entry.state,
                });
            }
            entry.state = TransactionState::RollingBack;
            entry.metadata_dir.clone()
        };

        info!("Rolling back transaction for {:?}", destination);

        match self.remove_transaction_dir(&metadata_dir) {
            Ok(()) => {
                self.state.lock().active.remove(&destination);
                info!("Transaction for {:?} rolled back and cleaned up", destination);
                audit::log_audit(&AuditEvent::SnapshotRolledBack { destination });
                Ok(())
            }
            Err(e) => {
                self.set_state(&destination, TransactionState::Ready);
                Err(SnapshotError::io(Phase::RemoveTransaction, &metadata_dir, e))
            }
        }
    }

    /// Returns the parent of `diff`: `None` for a base layer.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::DiffNotFound`] if `diff` was never committed.
    pub fn parent(&self, diff: &DiffId) -> Result<Option<DiffId>, SnapshotError> {
        self.state
            .lock()
            .parents
            .get(diff)
            .cloned()
            .ok_or_else(|| SnapshotError::DiffNotFound(diff.clone()))
    }

    /// Returns `diff` followed by its ancestors, ending with the base layer.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::DiffNotFound`] if `diff` or one of its
    /// ancestors is not indexed.
    pub fn chain(&self, diff: &DiffId) -> Result<Vec<DiffId>, SnapshotError> {
        let state = self.state.lock();
        let mut chain = Vec::new();
        let mut current = Some(diff.clone());
        while let Some(id) = current {
            let parent = state
                .parents
                .get(&id)
                .ok_or_else(|| SnapshotError::DiffNotFound(id.clone()))?;
            current = parent.clone();
            chain.push(id);
            // Recovery rejects cycles; this bound only guards against bugs.
            if chain.len() > state.parents.len() {
                return Err(SnapshotError::CorruptMetadata {
                    path: self.layout.diffs_dir(),
                    reason: format!("parent chain of {diff} does not terminate"),
                });
            }
        }
        Ok(chain)
    }

    /// Returns the directory holding the content of a committed diff.
    #[must_use]
    pub fn diff_path(&self, diff: &DiffId) -> Option<PathBuf> {
        if self.state.lock().parents.contains_key(diff) {
            Some(self.layout.diff_dir(diff).join(DATA_DIR))
        } else {
            None
        }
    }

    /// Computes a SHA-256 digest of a committed diff's content.
    ///
    /// # Errors
    ///
    /// Returns an error if the diff is unknown or its content cannot be read.
    pub fn digest(&self, diff: &DiffId) -> Result<String, SnapshotError> {
        let path = self
            .diff_path(diff)
            .ok_or_else(|| SnapshotError::DiffNotFound(diff.clone()))?;
        hashing::compute_directory_hash(&path).map_err(|e| SnapshotError::io(Phase::Digest, &path, e))
    }

    /// Returns the number of active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Returns all active transactions, ordered by destination.
    #[must_use]
    pub fn list_active(&self) -> Vec<ActiveSnapshot> {
        let mut active: Vec<ActiveSnapshot> = self.state.lock().active.values().cloned().collect();
        active.sort_by(|a, b| a.destination.cmp(&b.destination));
        active
    }

    /// Returns all committed diffs with their parents, ordered by id.
    #[must_use]
    pub fn list_diffs(&self) -> Vec<(DiffId, Option<DiffId>)> {
        let mut diffs: Vec<(DiffId, Option<DiffId>)> = self
            .state
            .lock()
            .parents
            .iter()
            .map(|(id, parent)| (id.clone(), parent.clone()))
            .collect();
        diffs.sort();
        diffs
    }

    /// Returns the canonical store root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    /// Returns what the startup scan found.
    #[must_use]
    pub fn last_recovery(&self) -> RecoveryReport {
        self.recovery
    }

    fn validate_destination(&self, dst: &Path) -> Result<PathBuf, SnapshotError> {
        self.policy.validate(dst).map_err(|e| match e {
            PolicyError::SecurityViolation { .. } | PolicyError::OverlapsStore { .. } => {
                let reason = e.to_string();
                audit::log_audit(&AuditEvent::DestinationDenied {
                    destination: dst.to_path_buf(),
                    reason: reason.clone(),
                });
                SnapshotError::PolicyViolation(reason)
            }
            other => SnapshotError::InvalidDestination {
                path: dst.to_path_buf(),
                reason: other.to_string(),
            },
        })
    }

    fn set_state(&self, destination: &Path, new_state: TransactionState) {
        if let Some(entry) = self.state.lock().active.get_mut(destination) {
            entry.state = new_state;
        }
    }

    fn remove_transaction_dir(&self, metadata_dir: &Path) -> io::Result<()> {
        #[cfg(test)]
        if self.fail_removals.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "removal disabled for test",
            ));
        }
        match fs::remove_dir_all(metadata_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }
        if let Err(e) = self.metadata.sync_dir(&self.layout.active_dir()) {
            warn!("Failed to flush {:?}: {}", self.layout.active_dir(), e);
        }
        debug!("Removed transaction directory: {:?}", metadata_dir);
        Ok(())
    }
}

impl Snapshotter for NaiveSnapshotter {
    fn prepare(&self, dst: &Path, parent: Option<&DiffId>) -> Result<Vec<Mount>, SnapshotError> {
        NaiveSnapshotter::prepare(self, dst, parent)
    }

    fn commit(&self, diff: &DiffId, dst: &Path) -> Result<(), SnapshotError> {
        NaiveSnapshotter::commit(self, diff, dst)
    }

    fn rollback(&self, dst: &Path) -> Result<(), SnapshotError> {
        NaiveSnapshotter::rollback(self, dst)
    }

    fn parent(&self, diff: &DiffId) -> Result<Option<DiffId>, SnapshotError> {
        NaiveSnapshotter::parent(self, diff)
    }
}

/// Looks up keys the same way prepare stored them; an unresolvable path
/// cannot name an active transaction and is used verbatim.
fn resolve(dst: &Path) -> PathBuf {
    policy::normalize(dst).unwrap_or_else(|_| dst.to_path_buf())
}

fn ensure_root(root: &Path, metadata: &MetadataStore) -> Result<PathBuf, SnapshotError> {
    let storage_error = |source: io::Error| SnapshotError::Storage {
        path: root.to_path_buf(),
        source,
    };

    match fs::metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(storage_error(io::Error::new(
                io::ErrorKind::NotADirectory,
                "storage root exists and is not a directory",
            )))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!("Creating snapshot store root {:?}", root);
            metadata
                .create_dir_all(root)
                .map_err(|e| storage_error(e.into_io_error()))?;
        }
        Err(e) => return Err(storage_error(e)),
    }

    dunce::canonicalize(root).map_err(storage_error)
}
