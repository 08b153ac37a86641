/// Audit logging for store state changes.
pub mod audit;
/// Configuration management for the snapshotter.
pub mod config;
/// Telemetry setup for structured logging.
pub mod telemetry;
