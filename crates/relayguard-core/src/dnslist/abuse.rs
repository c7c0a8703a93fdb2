//! Per-source abuse accounting for the DNS frontend
//!
//! Every query that draws REFUSED, FORMERR, or NOTAUTH counts as an
//! abuse event against the source's /25 (IPv4) or /52 (IPv6). Past the
//! event limit within one hour the whole CIDR is banned for a week.
//! State round-trips through `dns.abuse.txt`, one
//! `cidr count window_start banned_until` line each.

use crate::net;
use chrono::Utc;
use relayguard_common::constants::{ABUSE_BAN_SECS, ABUSE_EVENT_LIMIT};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::warn;

/// Event-counting window
const WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Default)]
struct AbuseEntry {
    count: u32,
    window_start: i64,
    banned_until: i64,
}

/// The abuse throttle
pub struct AbuseThrottle {
    map: RwLock<HashMap<String, AbuseEntry>>,
    dirty: AtomicBool,
}

impl AbuseThrottle {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Whether the source is currently banned
    pub async fn is_banned(&self, source: IpAddr) -> bool {
        let key = net::abuse_cidr(source).to_string();
        let map = self.map.read().await;
        map.get(&key)
            .map(|entry| entry.banned_until > Utc::now().timestamp())
            .unwrap_or(false)
    }

    /// Register one abuse event; returns `true` when this event tripped
    /// a new ban
    pub async fn register(&self, source: IpAddr) -> bool {
        let key = net::abuse_cidr(source).to_string();
        let now = Utc::now().timestamp();

        let mut map = self.map.write().await;
        let entry = map.entry(key.clone()).or_default();

        if now - entry.window_start > WINDOW_SECS {
            entry.window_start = now;
            entry.count = 0;
        }
        entry.count = entry.count.saturating_add(1);
        self.dirty.store(true, Ordering::Relaxed);

        if entry.count > ABUSE_EVENT_LIMIT && entry.banned_until <= now {
            entry.banned_until = now + ABUSE_BAN_SECS;
            warn!(cidr = %key, events = entry.count, "Banned abusive DNS source");
            return true;
        }
        false
    }

    /// Drop served-out bans and counters from closed windows
    pub async fn sweep(&self) {
        let now = Utc::now().timestamp();
        let mut map = self.map.write().await;
        let before = map.len();
        map.retain(|_, entry| {
            entry.banned_until > now || now - entry.window_start <= WINDOW_SECS
        });
        if map.len() != before {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Serialise to `dns.abuse.txt` lines
    pub async fn snapshot_lines(&self) -> Vec<String> {
        let map = self.map.read().await;
        map.iter()
            .map(|(cidr, entry)| {
                format!(
                    "{} {} {} {}",
                    cidr, entry.count, entry.window_start, entry.banned_until
                )
            })
            .collect()
    }

    /// Restore from `dns.abuse.txt` lines, skipping unparseable ones
    pub async fn restore_lines(&self, lines: Vec<String>) {
        let mut map = HashMap::new();
        for line in lines {
            let mut fields = line.split_whitespace();
            let (Some(cidr), Some(count), Some(window_start), Some(banned_until)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let (Ok(count), Ok(window_start), Ok(banned_until)) =
                (count.parse(), window_start.parse(), banned_until.parse())
            else {
                continue;
            };
            map.insert(
                cidr.to_string(),
                AbuseEntry {
                    count,
                    window_start,
                    banned_until,
                },
            );
        }
        *self.map.write().await = map;
    }
}

impl Default for AbuseThrottle {
    fn default() -> Self {
        Self::new()
    }
}
