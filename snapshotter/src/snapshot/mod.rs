//! Snapshot storage for copy-on-write container layers.

/// Capability trait shared by snapshot backends.
pub mod backend;
/// Recursive directory copy used to materialise and capture layers.
pub mod copy;
pub(crate) mod hashing;
/// Snapshot manager and its transaction state machine.
pub mod manager;
/// Durable per-transaction metadata.
pub mod metadata;
pub(crate) mod policy;
#[cfg(test)]
mod tests;

pub use backend::{Mount, Snapshotter};
pub use copy::CancelToken;
pub use manager::{DiffId, NaiveSnapshotter, RecoveryReport, SnapshotError};
