//! Complaint ledger
//!
//! Time-keyed record of complained tickets. The ticket timestamp is
//! unique (the codec bumps it monotonically), so a second complaint for
//! the same ticket lands on an existing key and is rejected; removal is
//! the exact inverse. Entries expire after seven days.

use chrono::Utc;
use relayguard_common::constants::LEDGER_TTL_SECS;
use relayguard_common::Token;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// One complained ticket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub tokens: Vec<Token>,
}

/// Outcome of registering a complaint
#[derive(Debug, PartialEq)]
pub enum ComplaintOutcome {
    /// The complaint was new; these tokens were charged
    Added(Vec<Token>),
    /// The same ticket was already complained
    Duplicate,
}

/// Outcome of retracting a complaint
#[derive(Debug, PartialEq)]
pub enum RetractOutcome {
    /// The complaint existed; these tokens were credited back
    Removed(Vec<Token>),
    /// Nothing to retract for this ticket
    AlreadyRemoved,
}

/// The complaint ledger
pub struct ComplaintLedger {
    entries: RwLock<BTreeMap<i64, LedgerEntry>>,
    dirty: AtomicBool,
}

impl ComplaintLedger {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Register a complaint for a decoded ticket
    pub async fn add(&self, timestamp: i64, tokens: Vec<Token>) -> ComplaintOutcome {
        let mut entries = self.entries.write().await;
        if entries.contains_key(&timestamp) {
            return ComplaintOutcome::Duplicate;
        }
        entries.insert(
            timestamp,
            LedgerEntry {
                tokens: tokens.clone(),
            },
        );
        self.dirty.store(true, Ordering::Relaxed);
        ComplaintOutcome::Added(tokens)
    }

    /// Retract a complaint for a decoded ticket
    pub async fn remove(&self, timestamp: i64) -> RetractOutcome {
        let mut entries = self.entries.write().await;
        match entries.remove(&timestamp) {
            Some(entry) => {
                self.dirty.store(true, Ordering::Relaxed);
                RetractOutcome::Removed(entry.tokens)
            }
            None => RetractOutcome::AlreadyRemoved,
        }
    }

    /// Drop entries past the retention window
    pub async fn sweep(&self) {
        let cutoff = (Utc::now().timestamp_micros()) - LEDGER_TTL_SECS * 1_000_000;
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|&timestamp, _| timestamp >= cutoff);
        if entries.len() != before {
            debug!(expired = before - entries.len(), "Expired ledger entries");
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> BTreeMap<i64, LedgerEntry> {
        self.entries.read().await.clone()
    }

    pub async fn restore(&self, mut entries: BTreeMap<i64, LedgerEntry>) {
        let cutoff = (Utc::now().timestamp_micros()) - LEDGER_TTL_SECS * 1_000_000;
        entries.retain(|&timestamp, _| timestamp >= cutoff);
        *self.entries.write().await = entries;
    }
}

impl Default for ComplaintLedger {
    fn default() -> Self {
        Self::new()
    }
}
