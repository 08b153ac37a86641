//! Rebuilds in-memory state from the store on startup.
//!
//! Metadata files are the source of truth: committed diffs are indexed
//! from `diffs/`, unfinished transactions are restored from `active/`, and
//! transaction directories that never got a destination recorded are
//! removed as orphans.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use super::naive::State;
use super::types::{ActiveSnapshot, DiffId, Phase, RecoveryReport, SnapshotError, TransactionState};
use crate::snapshot::metadata::{MetadataStore, StoreLayout, DATA_DIR};

pub(crate) fn recover(
    layout: &StoreLayout,
    metadata: &MetadataStore,
) -> Result<(State, RecoveryReport), SnapshotError> {
    let mut state = State::default();
    let mut report = RecoveryReport::default();

    index_diffs(layout, metadata, &mut state, &mut report)?;
    validate_chains(layout, &state.parents)?;
    restore_transactions(layout, metadata, &mut state, &mut report)?;

    if report.orphans_removed > 0 {
        info!("Cleaned up {} orphaned transaction directories", report.orphans_removed);
    }
    Ok((state, report))
}

fn index_diffs(
    layout: &StoreLayout,
    metadata: &MetadataStore,
    state: &mut State,
    report: &mut RecoveryReport,
) -> Result<(), SnapshotError> {
    let diffs_dir = layout.diffs_dir();
    let entries = metadata
        .list_dirs(&diffs_dir)
        .map_err(|e| SnapshotError::from_metadata(Phase::Scan, &diffs_dir, e))?;

    for (name, path) in entries {
        let Ok(diff) = DiffId::new(name.as_str()) else {
            warn!("Skipping diff directory with invalid name: {:?}", path);
            continue;
        };
        if !path.join(DATA_DIR).is_dir() {
            warn!("Skipping diff {} without captured content", diff);
            continue;
        }

        let record = metadata
            .read_record(&path)
            .map_err(|e| corrupt(&path, e.to_string()))?;
        let parent = match record.parent {
            Some(raw) => Some(DiffId::new(raw).map_err(|e| corrupt(&path, e.to_string()))?),
            None => None,
        };
        if parent.as_ref() == Some(&diff) {
            return Err(corrupt(&path, format!("diff {diff} is its own parent")));
        }

        state.parents.insert(diff, parent);
        report.diffs_indexed += 1;
    }
    Ok(())
}

fn validate_chains(
    layout: &StoreLayout,
    parents: &HashMap<DiffId, Option<DiffId>>,
) -> Result<(), SnapshotError> {
    for (diff, parent) in parents {
        if let Some(parent) = parent {
            if !parents.contains_key(parent) {
                warn!("Diff {} references missing parent {}", diff, parent);
            }
        }

        let mut current = parent.as_ref();
        let mut steps = 0;
        while let Some(id) = current {
            steps += 1;
            if steps > parents.len() {
                return Err(corrupt(
                    &layout.diff_dir(diff),
                    format!("parent chain of {diff} contains a cycle"),
                ));
            }
            current = parents.get(id).and_then(Option::as_ref);
        }
    }
    Ok(())
}

fn restore_transactions(
    layout: &StoreLayout,
    metadata: &MetadataStore,
    state: &mut State,
    report: &mut RecoveryReport,
) -> Result<(), SnapshotError> {
    let active_dir = layout.active_dir();
    let entries = metadata
        .list_dirs(&active_dir)
        .map_err(|e| SnapshotError::from_metadata(Phase::Scan, &active_dir, e))?;

    for (_, path) in entries {
        let restored = match metadata.read_record(&path) {
            Ok(record) => match (record.target, record.parent.map(DiffId::new).transpose()) {
                (Some(target), Ok(parent)) if !state.active.contains_key(&target) => {
                    Some((target, parent))
                }
                (Some(target), Ok(_)) => {
                    warn!("Transaction {:?} duplicates destination {:?}", path, target);
                    None
                }
                (None, _) => {
                    warn!("Transaction {:?} has no recorded destination", path);
                    None
                }
                (_, Err(e)) => {
                    warn!("Transaction {:?} has an invalid parent: {}", path, e);
                    None
                }
            },
            Err(e) => {
                warn!("Transaction {:?} has unreadable metadata: {}", path, e);
                None
            }
        };

        let Some((target, parent)) = restored else {
            fs::remove_dir_all(&path).map_err(|e| SnapshotError::io(Phase::Scan, &path, e))?;
            report.orphans_removed += 1;
            continue;
        };

        if let Some(parent) = &parent {
            if !state.parents.contains_key(parent) {
                warn!("Transaction for {:?} references missing parent {}", target, parent);
            }
        }

        info!("Restored transaction for {:?} from {:?}", target, path);
        state.active.insert(
            target.clone(),
            ActiveSnapshot {
                destination: target,
                parent,
                metadata_dir: path,
                state: TransactionState::Ready,
            },
        );
        report.transactions_restored += 1;
    }

    if report.orphans_removed > 0 {
        metadata
            .sync_dir(&active_dir)
            .map_err(|e| SnapshotError::from_metadata(Phase::Scan, &active_dir, e))?;
    }
    Ok(())
}

fn corrupt(path: &Path, reason: String) -> SnapshotError {
    SnapshotError::CorruptMetadata {
        path: path.to_path_buf(),
        reason,
    }
}
