//! Per-day analysis log
//!
//! Every terminal decision may be recorded as one `<token> <verdict>`
//! line in `<dir>/<date>.csv`, for offline scoring of list quality.

use chrono::Utc;
use relayguard_common::{Error, Result};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Appender for the daily analysis files
pub struct AnalysisLog {
    dir: PathBuf,
}

impl AnalysisLog {
    /// Create an analysis log rooted at `dir`, creating the directory
    pub fn new(dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("Failed to create analysis directory: {}", e)))?;

        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Append one verdict line to today's file
    pub async fn append(&self, token: &str, verdict: &str) -> Result<()> {
        let name = format!("{}.csv", Utc::now().format("%Y-%m-%d"));
        let path = self.dir.join(name);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to open analysis file: {}", e)))?;

        file.write_all(format!("{} {}\n", token, verdict).as_bytes())
            .await
            .map_err(|e| Error::Storage(format!("Failed to append analysis line: {}", e)))?;

        debug!(token = %token, verdict = %verdict, "Recorded analysis line");

        Ok(())
    }
}
