//! Greylist and flood deferral
//!
//! Flows are deferred by class-specific windows keyed on the
//! `origin>recipient` fingerprint. A flow stays deferred until its
//! window elapses, then passes freely; the record is kept for a grace
//! period so a released flow is not immediately re-greylisted, and so
//! the retry counter survives for flood escalation.

use chrono::Utc;
use relayguard_common::config::DeferConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Seconds a released record is retained past its window
const RETENTION_SECS: i64 = 5 * 24 * 3600;

/// Deferral classes with distinct windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferClass {
    SoftFail,
    Gray,
    Black,
    Flood,
}

/// One deferred flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferEntry {
    pub count: u32,
    pub first_seen: i64,
    pub ttl_secs: i64,
}

/// The deferral controller
pub struct DeferralController {
    map: RwLock<HashMap<String, DeferEntry>>,
    config: DeferConfig,
    dirty: AtomicBool,
}

impl DeferralController {
    pub fn new(config: DeferConfig) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            config,
            dirty: AtomicBool::new(false),
        }
    }

    fn ttl(&self, class: DeferClass) -> i64 {
        match class {
            DeferClass::SoftFail => self.config.softfail_ttl_secs,
            DeferClass::Gray => self.config.gray_ttl_secs,
            DeferClass::Black => self.config.black_ttl_secs,
            DeferClass::Flood => self.config.flood_ttl_secs,
        }
    }

    /// Register an attempt for `key`; `true` while the window holds the
    /// flow back, `false` once it has been served out
    pub async fn defer(&self, key: &str, class: DeferClass) -> bool {
        let now = Utc::now().timestamp();
        let ttl = self.ttl(class);

        let mut map = self.map.write().await;
        self.dirty.store(true, Ordering::Relaxed);

        match map.get_mut(key) {
            Some(entry) => {
                entry.count = entry.count.saturating_add(1);
                let held = now - entry.first_seen < entry.ttl_secs;
                if !held {
                    debug!(flow = %key, count = entry.count, "Deferral released");
                }
                held
            }
            None => {
                map.insert(
                    key.to_string(),
                    DeferEntry {
                        count: 1,
                        first_seen: now,
                        ttl_secs: ttl,
                    },
                );
                debug!(flow = %key, ttl, "Deferral started");
                true
            }
        }
    }

    /// Attempts recorded for `key` inside its current window
    pub async fn count(&self, key: &str) -> u32 {
        let map = self.map.read().await;
        map.get(key).map(|e| e.count).unwrap_or(0)
    }

    /// The configured escalation bound
    pub fn flood_max_retry(&self) -> u32 {
        self.config.flood_max_retry
    }

    /// Drop records past their window plus the retention grace
    pub async fn sweep(&self) {
        let now = Utc::now().timestamp();
        let mut map = self.map.write().await;
        let before = map.len();
        map.retain(|_, entry| now - entry.first_seen <= entry.ttl_secs + RETENTION_SECS);
        if map.len() != before {
            debug!(expired = before - map.len(), "Expired deferral records");
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> HashMap<String, DeferEntry> {
        self.map.read().await.clone()
    }

    pub async fn restore(&self, mut entries: HashMap<String, DeferEntry>) {
        let now = Utc::now().timestamp();
        entries.retain(|_, entry| now - entry.first_seen <= entry.ttl_secs + RETENTION_SECS);
        *self.map.write().await = entries;
    }
}
