//! Snapshot manager for transactional layer storage.
//!
//! This module owns the set of active transactions and the parent index
//! of committed diffs, and enforces the prepare/commit/rollback lifecycle.

pub mod naive;
mod recovery;
pub mod types;

// Re-export primary types for convenience
pub use naive::NaiveSnapshotter;
pub use types::{
    ActiveSnapshot, DiffId, Phase, RecoveryReport, SnapshotError, TransactionState,
};
