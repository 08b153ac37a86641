use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, info_span};

use crate::snapshot::manager::{DiffId, RecoveryReport};

/// Domain event for audit logging.
/// Structured for JSON serialization to enable machine-readable audit trails.
#[derive(Debug, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A store was opened and its state rebuilt from disk.
    StoreOpened {
        /// Store root.
        root: PathBuf,
        /// Result of the recovery scan.
        report: RecoveryReport,
    },
    /// A checkout became an immutable diff.
    SnapshotCommitted {
        /// New diff.
        diff: DiffId,
        /// Its parent, if any.
        parent: Option<DiffId>,
        /// Destination the content was captured from.
        destination: PathBuf,
    },
    /// A transaction was discarded.
    SnapshotRolledBack {
        /// Destination of the discarded transaction.
        destination: PathBuf,
    },
    /// A destination was refused by the destination policy.
    DestinationDenied {
        /// Refused path.
        destination: PathBuf,
        /// Policy message.
        reason: String,
    },
}

/// Logs an audit event to the dedicated audit channel as structured JSON.
/// This uses a specific `target` which can be filtered by the subscriber to redirect to a secure file.
pub fn log_audit(event: &AuditEvent) {
    let span = info_span!(target: "audit", "audit_event");
    let _enter = span.enter();

    let json = serde_json::to_string(event).unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"));
    info!(target: "audit", audit_json = %json, "Snapshot Audit Event");
}
