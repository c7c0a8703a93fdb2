//! Versioned snapshot files
//!
//! Each in-memory map is persisted as a JSON envelope carrying a schema
//! version and a save timestamp. Writes go to a temp file in the same
//! directory and are renamed into place, so a crash mid-write never
//! truncates the previous snapshot. Loaders tolerate missing files and
//! unknown versions by starting empty.

use chrono::{DateTime, Utc};
use relayguard_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info, warn};

/// Current snapshot schema version
pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk envelope wrapping a serialised map
#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: T,
}

/// Snapshot directory owner
pub struct SnapshotStore {
    base_path: PathBuf,
}

impl SnapshotStore {
    /// Create a snapshot store rooted at `path`, creating the directory
    pub fn new(path: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .map_err(|e| Error::Storage(format!("Failed to create snapshot directory: {}", e)))?;

        info!(path = %path.display(), "Initialized snapshot store");

        Ok(Self {
            base_path: path.to_path_buf(),
        })
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    /// Persist a serialisable map atomically under `name`
    pub async fn save<T: Serialize>(&self, name: &str, entries: &T) -> Result<()> {
        let envelope = Envelope {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            entries,
        };

        let data = serde_json::to_vec(&envelope)
            .map_err(|e| Error::Storage(format!("Failed to serialise {}: {}", name, e)))?;

        let target = self.file_path(name);
        let temp = self.file_path(&format!(".{}.tmp", name));

        fs::write(&temp, &data)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", name, e)))?;
        fs::rename(&temp, &target)
            .await
            .map_err(|e| Error::Storage(format!("Failed to commit {}: {}", name, e)))?;

        debug!(name = %name, size = data.len(), "Saved snapshot");

        Ok(())
    }

    /// Load a snapshot saved under `name`; `None` when absent or from an
    /// unknown schema version
    pub async fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let target = self.file_path(name);

        let data = match fs::read(&target).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Storage(format!("Failed to read {}: {}", name, e))),
        };

        let envelope: Envelope<T> = match serde_json::from_slice(&data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(name = %name, "Discarding unreadable snapshot: {}", e);
                return Ok(None);
            }
        };

        if envelope.version != SNAPSHOT_VERSION {
            warn!(
                name = %name,
                version = envelope.version,
                "Discarding snapshot from unknown schema version"
            );
            return Ok(None);
        }

        debug!(name = %name, saved_at = %envelope.saved_at, "Loaded snapshot");

        Ok(Some(envelope.entries))
    }

    /// Persist plain text lines under `name` with the same atomic rename
    pub async fn save_lines(&self, name: &str, lines: &[String]) -> Result<()> {
        let target = self.file_path(name);
        let temp = self.file_path(&format!(".{}.tmp", name));
        let mut data = lines.join("\n");
        if !data.is_empty() {
            data.push('\n');
        }

        fs::write(&temp, data.as_bytes())
            .await
            .map_err(|e| Error::Storage(format!("Failed to write {}: {}", name, e)))?;
        fs::rename(&temp, &target)
            .await
            .map_err(|e| Error::Storage(format!("Failed to commit {}: {}", name, e)))?;

        Ok(())
    }

    /// Load plain text lines saved under `name`
    pub async fn load_lines(&self, name: &str) -> Result<Vec<String>> {
        let target = self.file_path(name);

        match fs::read_to_string(&target).await {
            Ok(content) => Ok(content.lines().map(|l| l.to_string()).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Storage(format!("Failed to read {}: {}", name, e))),
        }
    }
}
