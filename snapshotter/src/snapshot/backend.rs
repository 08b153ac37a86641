//! The contract every snapshot backend fulfils.
//!
//! The naive backend materialises checkouts by copying and never returns
//! mounts. Mount-based backends (overlay, block snapshots) implement the
//! same trait and describe the checkout through [`Mount`] entries instead.

use serde::Serialize;
use std::path::Path;

use super::manager::{DiffId, SnapshotError};

/// A single mount directive needed to expose a prepared checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mount {
    /// Filesystem type, e.g. `overlay` or `bind`.
    pub kind: String,
    /// Mount source.
    pub source: String,
    /// Mount options, e.g. `lowerdir=...`.
    pub options: Vec<String>,
}

/// Transactional snapshot operations.
///
/// Implementations must be safe to share between threads; operations on
/// different destinations may run concurrently.
pub trait Snapshotter: Send + Sync {
    /// Prepares a writable checkout at `dst`, derived from `parent` when given.
    ///
    /// Returns the mounts required to expose the checkout; an empty list
    /// means the content was materialised directly in `dst`.
    ///
    /// # Errors
    ///
    /// Returns an error if `dst` is already active, `parent` is unknown, or
    /// the checkout cannot be materialised.
    fn prepare(&self, dst: &Path, parent: Option<&DiffId>) -> Result<Vec<Mount>, SnapshotError>;

    /// Promotes the checkout at `dst` into the immutable diff `diff`.
    ///
    /// # Errors
    ///
    /// Returns an error if `dst` is not active, `diff` already exists, or the
    /// content cannot be captured. The transaction stays active on failure.
    fn commit(&self, diff: &DiffId, dst: &Path) -> Result<(), SnapshotError>;

    /// Discards the transaction for `dst`, leaving `dst` itself untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if `dst` is not active or its bookkeeping cannot be removed.
    fn rollback(&self, dst: &Path) -> Result<(), SnapshotError>;

    /// Returns the parent of `diff`, or `None` for a base layer.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::DiffNotFound`] if `diff` is not a committed diff.
    fn parent(&self, diff: &DiffId) -> Result<Option<DiffId>, SnapshotError>;
}
