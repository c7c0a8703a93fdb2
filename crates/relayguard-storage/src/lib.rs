//! RelayGuard Storage - Snapshot persistence
//!
//! This crate persists the engine's in-memory maps as versioned
//! snapshot files and appends per-day analysis records.

pub mod analysis;
pub mod snapshot;

pub use analysis::AnalysisLog;
pub use snapshot::SnapshotStore;
