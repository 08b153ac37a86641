//! Opens the configured snapshot store, runs recovery and prints its state.

use anyhow::Context;
use snapshotter::infrastructure::{config::Settings, telemetry::TelemetryBuilder};
use snapshotter::NaiveSnapshotter;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let config = Settings::new().context("Failed to load configuration")?;

    TelemetryBuilder::new("snapshotter")
        .with_settings(&config.telemetry)
        .init()
        .context("Failed to initialize telemetry")?;

    info!("Snapshotter starting...");

    // Opening the store runs recovery, so this doubles as an fsck.
    let store = NaiveSnapshotter::new(&config.storage)
        .with_context(|| format!("Failed to open store at {:?}", config.storage.root))?;

    for (diff, parent) in store.list_diffs() {
        match parent {
            Some(parent) => info!("diff {} (parent {})", diff, parent),
            None => info!("diff {} (base layer)", diff),
        }
    }
    for active in store.list_active() {
        info!(
            "active transaction for {:?} (parent: {:?})",
            active.destination(),
            active.parent()
        );
    }

    let status = serde_json::json!({
        "root": store.root(),
        "recovery": store.last_recovery(),
        "diffs": store.list_diffs(),
        "active": store.list_active(),
    });
    println!("{}", serde_json::to_string_pretty(&status)?);

    Ok(())
}
