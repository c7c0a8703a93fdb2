//! Per-token reputation
//!
//! Each token carries a `Distribution`: a complaint counter and a
//! rolling normal distribution of query inter-arrival times. The spam
//! probability compares complaints against the ham volume the arrival
//! rate implies for one week, and drives a four-state status machine
//! with hysteresis so borderline tokens do not flap.

use chrono::{DateTime, Utc};
use relayguard_common::config::ReputationConfig;
use relayguard_common::constants::{DISTRIBUTION_EVICT_SECS, WEEK_SECS};
use relayguard_common::types::FloodClass;
use relayguard_common::{Status, Token};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Rolling inter-arrival statistics (Welford update)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InterarrivalStats {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
}

impl InterarrivalStats {
    /// Record one observed inter-arrival gap in seconds
    pub fn record(&mut self, secs: f64) {
        self.count += 1;
        let delta = secs - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (secs - self.mean);
    }

    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }

    /// Conservative lower edge of the distribution, floored at one
    /// second; drives both flood detection and ham estimation
    pub fn minimum(&self) -> f64 {
        (self.mean - self.stddev()).max(1.0)
    }
}

/// Reputation state for one token
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Distribution {
    /// Complaint count, clamped non-negative
    pub complaints: i32,

    pub last_query: Option<DateTime<Utc>>,
    pub last_complaint: Option<DateTime<Utc>>,

    pub stats: InterarrivalStats,

    /// Last derived status, the anchor for hysteresis
    pub status: Status,
}

impl Distribution {
    /// Register a query, folding the gap since the previous one into
    /// the inter-arrival statistics
    pub fn add_query(&mut self, now: DateTime<Utc>) {
        if let Some(prev) = self.last_query {
            let gap = (now - prev).num_milliseconds() as f64 / 1000.0;
            if gap >= 0.0 {
                self.stats.record(gap);
            }
        }
        self.last_query = Some(now);
    }

    /// Estimated ham volume per week implied by the arrival rate
    fn estimated_ham(&self) -> f64 {
        if self.stats.count == 0 {
            1.0
        } else {
            WEEK_SECS as f64 / self.stats.minimum()
        }
    }

    /// Spam probability with the minimum-sample caps applied
    pub fn probability(&self) -> f64 {
        if self.complaints <= 0 {
            return 0.0;
        }
        let c = self.complaints as f64;
        let raw = c / (c + self.estimated_ham());

        let cap = if self.complaints >= 7 {
            1.0
        } else if self.complaints >= 5 {
            0.75
        } else if self.complaints >= 3 {
            0.5
        } else {
            0.25
        };

        raw.min(cap)
    }

    /// Re-derive the status; returns whether it changed.
    ///
    /// WHITE is only regained below 1/64; a BLACK token cooling off
    /// passes through GRAY first. IP tokens top out at BLACK.
    pub fn refresh_status(&mut self, is_ip: bool) -> bool {
        let p = self.probability();

        let next = if p < 1.0 / 64.0 {
            Status::White
        } else if p >= 0.75 {
            if is_ip {
                Status::Black
            } else {
                Status::Block
            }
        } else if p >= 0.5 {
            Status::Black
        } else if p >= 0.25 {
            Status::Gray
        } else if self.status == Status::White {
            Status::White
        } else {
            Status::Gray
        };

        let changed = next != self.status;
        self.status = next;
        changed
    }

    /// Whether the arrival rate crosses the class flood threshold
    pub fn is_flood(&self, threshold_secs: f64) -> bool {
        self.stats.count >= 3 && self.stats.mean - self.stats.stddev() < threshold_secs
    }

    /// Droppable after two weeks without activity
    pub fn evictable(&self, now: DateTime<Utc>) -> bool {
        let last = match (self.last_query, self.last_complaint) {
            (Some(q), Some(c)) => q.max(c),
            (Some(q), None) => q,
            (None, Some(c)) => c,
            (None, None) => return true,
        };
        (now - last).num_seconds() > DISTRIBUTION_EVICT_SECS
    }

    /// Reset complaints and frequency, keeping the key alive
    pub fn reset(&mut self) {
        self.complaints = 0;
        self.stats = InterarrivalStats::default();
        self.status = Status::White;
    }
}

/// The reputation store
pub struct ReputationStore {
    map: RwLock<HashMap<String, Distribution>>,
    config: ReputationConfig,
    dirty: AtomicBool,
}

impl ReputationStore {
    pub fn new(config: ReputationConfig) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            config,
            dirty: AtomicBool::new(false),
        }
    }

    fn threshold(&self, class: FloodClass) -> f64 {
        match class {
            FloodClass::Ip => self.config.flood_ip_secs,
            FloodClass::Sender => self.config.flood_sender_secs,
            FloodClass::Helo => self.config.flood_helo_secs,
        }
    }

    /// Register a query for every reputable token in the set
    pub async fn add_queries(&self, tokens: &[Token]) {
        let now = Utc::now();
        let mut map = self.map.write().await;
        for token in tokens.iter().filter(|t| t.is_reputable()) {
            map.entry(token.to_string()).or_default().add_query(now);
        }
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Add one complaint; `true` when the counter actually moved
    pub async fn add_spam(&self, token: &Token) -> bool {
        if !token.is_reputable() {
            return false;
        }
        let mut map = self.map.write().await;
        let dist = map.entry(token.to_string()).or_default();

        if dist.complaints == i32::MAX {
            return false;
        }
        dist.complaints += 1;
        dist.last_complaint = Some(Utc::now());
        let changed = dist.refresh_status(token.is_ip());
        if changed {
            info!(token = %token, status = %dist.status, "Reputation status changed");
        }
        self.dirty.store(true, Ordering::Relaxed);
        true
    }

    /// Retract one complaint; `true` when the counter actually moved
    pub async fn remove_spam(&self, token: &Token) -> bool {
        if !token.is_reputable() {
            return false;
        }
        let mut map = self.map.write().await;
        let dist = match map.get_mut(&token.to_string()) {
            Some(dist) => dist,
            None => return false,
        };
        if dist.complaints == 0 {
            return false;
        }
        dist.complaints -= 1;
        dist.refresh_status(token.is_ip());
        self.dirty.store(true, Ordering::Relaxed);
        true
    }

    /// Reset a token's complaints and frequency
    pub async fn clear(&self, token: &Token) {
        let mut map = self.map.write().await;
        if let Some(dist) = map.get_mut(&token.to_string()) {
            dist.reset();
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    /// Current status, re-derived from the latest probability
    pub async fn status(&self, token: &Token) -> Status {
        if !token.is_reputable() {
            return Status::White;
        }
        let mut map = self.map.write().await;
        match map.get_mut(&token.to_string()) {
            Some(dist) => {
                dist.refresh_status(token.is_ip());
                dist.status
            }
            None => Status::White,
        }
    }

    /// Spam probability for the DNS SCORE zone
    pub async fn probability(&self, key: &str) -> f64 {
        let map = self.map.read().await;
        map.get(key).map(|d| d.probability()).unwrap_or(0.0)
    }

    pub async fn is_flood(&self, token: &Token) -> bool {
        let map = self.map.read().await;
        map.get(&token.to_string())
            .map(|d| d.is_flood(self.threshold(token.flood_class())))
            .unwrap_or(false)
    }

    /// Remove a token entirely, returning what was dropped
    pub async fn drop_token(&self, token: &Token) -> Option<Distribution> {
        let mut map = self.map.write().await;
        let dropped = map.remove(&token.to_string());
        if dropped.is_some() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        dropped
    }

    pub async fn get(&self, key: &str) -> Option<Distribution> {
        self.map.read().await.get(key).cloned()
    }

    /// Fold a peer's view of a token into ours, weighted by observed
    /// agreement. Arrival statistics stay local; only the complaint
    /// counter moves.
    pub async fn merge_remote(
        &self,
        key: &str,
        remote: Option<Distribution>,
        weight: f64,
        is_ip: bool,
    ) {
        let mut map = self.map.write().await;
        match remote {
            None => {
                map.remove(key);
            }
            Some(remote) => {
                let dist = map.entry(key.to_string()).or_default();
                let delta = remote.complaints.saturating_sub(dist.complaints);
                if delta != 0 {
                    let applied = (delta as f64 * weight).round() as i32;
                    dist.complaints = (dist.complaints + applied).max(0);
                    dist.last_complaint = remote.last_complaint.or(dist.last_complaint);
                    dist.refresh_status(is_ip);
                }
            }
        }
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Drop distributions idle past the eviction window
    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut map = self.map.write().await;
        let before = map.len();
        map.retain(|_, dist| !dist.evictable(now));
        if map.len() != before {
            debug!(evicted = before - map.len(), "Evicted idle distributions");
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> HashMap<String, Distribution> {
        self.map.read().await.clone()
    }

    pub async fn restore(&self, mut entries: HashMap<String, Distribution>) {
        let now = Utc::now();
        entries.retain(|_, dist| !dist.evictable(now));
        *self.map.write().await = entries;
    }
}
