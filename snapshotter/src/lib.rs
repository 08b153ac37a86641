//! Snapshotter - transactional filesystem snapshots for container layers.
//!
//! This crate tracks an ordered chain of immutable layers ("diffs"),
//! prepares writable checkouts from a parent layer and atomically promotes
//! a checkout into a new layer. All state is kept in plain directories
//! under a storage root and is rebuilt from disk on startup.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

/// Infrastructure components (config, telemetry, audit).
pub mod infrastructure;
/// Snapshot storage: copy utility, metadata store and snapshot manager.
pub mod snapshot;

pub use snapshot::{DiffId, Mount, NaiveSnapshotter, SnapshotError, Snapshotter};
