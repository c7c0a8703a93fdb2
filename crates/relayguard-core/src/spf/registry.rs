//! Name-keyed SPF record cache
//!
//! Records are created on first query, refreshed by the background loop
//! under query pressure, kept stale through DNS outages, and evicted
//! after two weeks without queries. Domains that publish nothing get the
//! best-guess record, overridable per host through the guess map.

use super::record::{self, SpfRecord};
use crate::resolver::{DnsError, DnsResult, Resolver};
use chrono::Utc;
use relayguard_common::config::SpfConfig;
use relayguard_common::constants::SPF_REFRESH_QUERIES;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// SPF record registry
pub struct SpfRegistry {
    records: RwLock<HashMap<String, SpfRecord>>,
    guesses: RwLock<HashMap<String, String>>,
    resolver: Arc<dyn Resolver>,
    config: SpfConfig,
    dirty: AtomicBool,
}

impl SpfRegistry {
    pub fn new(resolver: Arc<dyn Resolver>, config: SpfConfig) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            guesses: RwLock::new(HashMap::new()),
            resolver,
            config,
            dirty: AtomicBool::new(false),
        }
    }

    fn normalise(domain: &str) -> String {
        domain.trim().trim_matches('.').to_lowercase()
    }

    /// Look up the record for `domain`, resolving and caching on first
    /// use. Transient DNS trouble surfaces as an error only when no
    /// cached record exists; otherwise the stale record is served.
    pub async fn lookup(&self, domain: &str) -> DnsResult<SpfRecord> {
        let domain = Self::normalise(domain);
        let now = Utc::now();

        {
            let mut records = self.records.write().await;
            if let Some(record) = records.get_mut(&domain) {
                record.register_query(now);
                self.dirty.store(true, Ordering::Relaxed);
                return Ok(record.clone());
            }
        }

        let mut record = self.resolve(&domain).await?;
        record.register_query(now);

        let mut records = self.records.write().await;
        let entry = records.entry(domain).or_insert(record);
        self.dirty.store(true, Ordering::Relaxed);
        Ok(entry.clone())
    }

    /// Resolve a fresh record for `domain` without touching the cache
    async fn resolve(&self, domain: &str) -> DnsResult<SpfRecord> {
        match self.resolver.lookup_txt(domain).await {
            Ok(txts) => {
                let mut published: Vec<&String> =
                    txts.iter().filter(|t| is_spf_text(t)).collect();

                if let Some(text) = published.pop() {
                    let mut parsed = record::parse(text, self.config.rfc_all_default)
                        .unwrap_or_else(SpfRecord::nxdomain);
                    // Multiple v=spf1 records are a publishing error
                    if !published.is_empty() {
                        parsed.syntax_error = true;
                    }
                    debug!(domain = %domain, "Parsed published SPF record");
                    Ok(parsed)
                } else {
                    Ok(self.guess_for(domain).await)
                }
            }
            Err(DnsError::NotFound) => {
                // Distinguish a silent domain from an inexistent one
                match self.resolver.lookup_ip(domain).await {
                    Ok(_) => Ok(self.guess_for(domain).await),
                    Err(DnsError::NotFound) => {
                        debug!(domain = %domain, "Domain does not resolve");
                        Ok(SpfRecord::nxdomain())
                    }
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn guess_for(&self, domain: &str) -> SpfRecord {
        let guesses = self.guesses.read().await;
        let text = guesses
            .get(domain)
            .cloned()
            .unwrap_or_else(|| self.config.guess_default.clone());
        drop(guesses);

        record::parse_guess(&text).unwrap_or_else(|| {
            warn!(domain = %domain, "Unparseable guess record, using empty fallback");
            SpfRecord::nxdomain()
        })
    }

    /// Install a per-host guess override
    pub async fn set_guess(&self, domain: &str, text: String) {
        let mut guesses = self.guesses.write().await;
        guesses.insert(Self::normalise(domain), text);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Force a re-resolution of a cached record. `false` when the domain
    /// was never loaded.
    pub async fn refresh(&self, domain: &str) -> DnsResult<bool> {
        let domain = Self::normalise(domain);

        let previous = {
            let records = self.records.read().await;
            match records.get(&domain) {
                Some(record) => record.clone(),
                None => return Ok(false),
            }
        };

        match self.resolve(&domain).await {
            Ok(mut fresh) => {
                fresh.inherit_counters(&previous);
                let mut records = self.records.write().await;
                records.insert(domain.clone(), fresh);
                self.dirty.store(true, Ordering::Relaxed);
                info!(domain = %domain, "Refreshed SPF record");
                Ok(true)
            }
            Err(e) => {
                // DNS outage keeps the stale record
                warn!(domain = %domain, "Refresh failed, keeping stale record: {}", e);
                Err(e)
            }
        }
    }

    /// One pass of the background refresh loop: re-resolve the record
    /// with the most query pressure. Pressure alone is enough; staleness
    /// past the refresh window qualifies a record too.
    pub async fn refresh_cycle(&self) {
        let now = Utc::now();
        let candidate = {
            let records = self.records.read().await;
            records
                .iter()
                .filter(|(_, r)| {
                    r.queries_since_refresh > SPF_REFRESH_QUERIES || r.needs_refresh(now)
                })
                .max_by_key(|(_, r)| r.queries_since_refresh)
                .map(|(domain, _)| domain.clone())
        };

        if let Some(domain) = candidate {
            let _ = self.refresh(&domain).await;
        }
    }

    /// Drop records unqueried past the eviction window
    pub async fn evict_cycle(&self) {
        let now = Utc::now();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| !record.evictable(now));
        if records.len() != before {
            debug!(evicted = before - records.len(), "Evicted idle SPF records");
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    /// Whether the sender domain is definitively inexistent
    pub async fn is_inexistent(&self, domain: &str) -> bool {
        let records = self.records.read().await;
        records
            .get(&Self::normalise(domain))
            .map(|r| r.definitely_inexistent())
            .unwrap_or(false)
    }

    /// Take the dirty flag, returning whether a save is due
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    /// Re-arm the dirty flag after a failed save
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Snapshot for persistence
    pub async fn snapshot(&self) -> (HashMap<String, SpfRecord>, HashMap<String, String>) {
        let records = self.records.read().await;
        let guesses = self.guesses.read().await;
        (records.clone(), guesses.clone())
    }

    /// Restore from a snapshot, discarding entries past eviction
    pub async fn restore(
        &self,
        mut records: HashMap<String, SpfRecord>,
        guesses: HashMap<String, String>,
    ) {
        let now = Utc::now();
        records.retain(|_, record| !record.evictable(now));

        *self.records.write().await = records;
        *self.guesses.write().await = guesses;
    }
}

fn is_spf_text(text: &str) -> bool {
    let t = text.trim().trim_matches('"');
    t == "v=spf1" || t.starts_with("v=spf1 ")
}
