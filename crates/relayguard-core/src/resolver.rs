//! Bounded-latency DNS lookups
//!
//! Wraps the tokio resolver with a per-lookup timeout and a small
//! positive/negative cache, so a slow or dead upstream cannot stall the
//! decision pipeline past its budget. NXDOMAIN and empty answers map to
//! [`DnsError::NotFound`]; everything transient maps to
//! [`DnsError::Transient`] and is never treated as a verdict.

use async_trait::async_trait;
use relayguard_common::config::DnsConfig;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// DNS lookup failure classes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// NXDOMAIN, or the name exists without records of the asked type
    #[error("HOST NOT FOUND")]
    NotFound,

    /// The lookup exceeded its wall-clock budget
    #[error("DNS lookup timed out")]
    Timeout,

    /// SERVFAIL and friends; retrying later may succeed
    #[error("transient DNS failure: {0}")]
    Transient(String),
}

/// Result alias for resolver calls
pub type DnsResult<T> = std::result::Result<T, DnsError>;

/// Resolver seam used by the SPF evaluator and token expander.
///
/// Production uses [`SystemResolver`]; tests substitute a scripted map.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_a(&self, name: &str) -> DnsResult<Vec<Ipv4Addr>>;
    async fn lookup_aaaa(&self, name: &str) -> DnsResult<Vec<Ipv6Addr>>;
    async fn lookup_mx(&self, name: &str) -> DnsResult<Vec<String>>;
    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>>;
    async fn lookup_ptr(&self, ip: IpAddr) -> DnsResult<Vec<String>>;

    /// Both address families in one call
    async fn lookup_ip(&self, name: &str) -> DnsResult<Vec<IpAddr>> {
        let mut out: Vec<IpAddr> = Vec::new();
        let mut missing = 0;
        match self.lookup_a(name).await {
            Ok(v4) => out.extend(v4.into_iter().map(IpAddr::V4)),
            Err(DnsError::NotFound) => missing += 1,
            Err(e) => return Err(e),
        }
        match self.lookup_aaaa(name).await {
            Ok(v6) => out.extend(v6.into_iter().map(IpAddr::V6)),
            Err(DnsError::NotFound) => missing += 1,
            Err(e) => return Err(e),
        }
        if missing == 2 {
            return Err(DnsError::NotFound);
        }
        Ok(out)
    }
}

#[derive(Clone)]
enum CacheValue {
    A(Vec<Ipv4Addr>),
    Aaaa(Vec<Ipv6Addr>),
    Names(Vec<String>),
    Txt(Vec<String>),
    NotFound,
}

#[derive(Clone, PartialEq, Eq, Hash)]
enum CacheKind {
    A,
    Aaaa,
    Mx,
    Txt,
    Ptr,
}

type CacheKey = (CacheKind, String);

/// Entry count that triggers expired-entry shedding
const CACHE_MAX_ENTRIES: usize = 8192;

/// Production resolver over `trust-dns` with caching and timeouts
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
    cache_ttl: Duration,
    cache: RwLock<HashMap<CacheKey, (Instant, CacheValue)>>,
}

impl SystemResolver {
    /// Create a resolver using the system default upstream
    pub fn new(config: &DnsConfig) -> Arc<Self> {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Arc::new(Self {
            resolver,
            timeout: Duration::from_secs(config.timeout_secs),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: RwLock::new(HashMap::new()),
        })
    }

    async fn cached(&self, key: &CacheKey) -> Option<CacheValue> {
        let cache = self.cache.read().await;
        cache.get(key).and_then(|(stored, value)| {
            (stored.elapsed() < self.cache_ttl).then(|| value.clone())
        })
    }

    async fn store(&self, key: CacheKey, value: CacheValue) {
        let mut cache = self.cache.write().await;
        // Shed expired entries once the cache grows past its bound
        if cache.len() >= CACHE_MAX_ENTRIES {
            cache.retain(|_, (stored, _)| stored.elapsed() < self.cache_ttl);
        }
        cache.insert(key, (Instant::now(), value));
    }

    async fn run<F, T>(&self, name: &str, fut: F) -> DnsResult<T>
    where
        F: std::future::Future<Output = Result<T, trust_dns_resolver::error::ResolveError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => match e.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Err(DnsError::NotFound),
                ResolveErrorKind::Timeout => Err(DnsError::Timeout),
                _ => {
                    debug!(name = %name, "DNS lookup failed: {}", e);
                    Err(DnsError::Transient(e.to_string()))
                }
            },
            Err(_) => {
                warn!(name = %name, "DNS lookup exceeded {}s budget", self.timeout.as_secs());
                Err(DnsError::Timeout)
            }
        }
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_a(&self, name: &str) -> DnsResult<Vec<Ipv4Addr>> {
        let key = (CacheKind::A, name.to_lowercase());
        match self.cached(&key).await {
            Some(CacheValue::A(v)) => return Ok(v),
            Some(CacheValue::NotFound) => return Err(DnsError::NotFound),
            _ => {}
        }

        let result = self
            .run(name, self.resolver.ipv4_lookup(name))
            .await
            .map(|lookup| {
                lookup
                    .iter()
                    .map(|record| Ipv4Addr::from(*record))
                    .collect::<Vec<_>>()
            });

        match &result {
            Ok(v) => self.store(key, CacheValue::A(v.clone())).await,
            Err(DnsError::NotFound) => self.store(key, CacheValue::NotFound).await,
            Err(_) => {}
        }
        result
    }

    async fn lookup_aaaa(&self, name: &str) -> DnsResult<Vec<Ipv6Addr>> {
        let key = (CacheKind::Aaaa, name.to_lowercase());
        match self.cached(&key).await {
            Some(CacheValue::Aaaa(v)) => return Ok(v),
            Some(CacheValue::NotFound) => return Err(DnsError::NotFound),
            _ => {}
        }

        let result = self
            .run(name, self.resolver.ipv6_lookup(name))
            .await
            .map(|lookup| {
                lookup
                    .iter()
                    .map(|record| Ipv6Addr::from(*record))
                    .collect::<Vec<_>>()
            });

        match &result {
            Ok(v) => self.store(key, CacheValue::Aaaa(v.clone())).await,
            Err(DnsError::NotFound) => self.store(key, CacheValue::NotFound).await,
            Err(_) => {}
        }
        result
    }

    async fn lookup_mx(&self, name: &str) -> DnsResult<Vec<String>> {
        let key = (CacheKind::Mx, name.to_lowercase());
        match self.cached(&key).await {
            Some(CacheValue::Names(v)) => return Ok(v),
            Some(CacheValue::NotFound) => return Err(DnsError::NotFound),
            _ => {}
        }

        let result = self.run(name, self.resolver.mx_lookup(name)).await.map(|lookup| {
            let mut hosts: Vec<(u16, String)> = lookup
                .iter()
                .map(|mx| {
                    (
                        mx.preference(),
                        mx.exchange().to_utf8().trim_end_matches('.').to_lowercase(),
                    )
                })
                .collect();
            hosts.sort();
            hosts.into_iter().map(|(_, host)| host).collect::<Vec<_>>()
        });

        match &result {
            Ok(v) => self.store(key, CacheValue::Names(v.clone())).await,
            Err(DnsError::NotFound) => self.store(key, CacheValue::NotFound).await,
            Err(_) => {}
        }
        result
    }

    async fn lookup_txt(&self, name: &str) -> DnsResult<Vec<String>> {
        let key = (CacheKind::Txt, name.to_lowercase());
        match self.cached(&key).await {
            Some(CacheValue::Txt(v)) => return Ok(v),
            Some(CacheValue::NotFound) => return Err(DnsError::NotFound),
            _ => {}
        }

        let result = self.run(name, self.resolver.txt_lookup(name)).await.map(|lookup| {
            lookup
                .iter()
                .map(|record| {
                    record
                        .txt_data()
                        .iter()
                        .map(|d| String::from_utf8_lossy(d))
                        .collect::<String>()
                })
                .collect::<Vec<_>>()
        });

        match &result {
            Ok(v) => self.store(key, CacheValue::Txt(v.clone())).await,
            Err(DnsError::NotFound) => self.store(key, CacheValue::NotFound).await,
            Err(_) => {}
        }
        result
    }

    async fn lookup_ptr(&self, ip: IpAddr) -> DnsResult<Vec<String>> {
        let key = (CacheKind::Ptr, ip.to_string());
        match self.cached(&key).await {
            Some(CacheValue::Names(v)) => return Ok(v),
            Some(CacheValue::NotFound) => return Err(DnsError::NotFound),
            _ => {}
        }

        let result = self
            .run(&ip.to_string(), self.resolver.reverse_lookup(ip))
            .await
            .map(|lookup| {
                lookup
                    .iter()
                    .map(|record| record.0.to_utf8().trim_end_matches('.').to_lowercase())
                    .collect::<Vec<_>>()
            });

        match &result {
            Ok(v) => self.store(key, CacheValue::Names(v.clone())).await,
            Err(DnsError::NotFound) => self.store(key, CacheValue::NotFound).await,
            Err(_) => {}
        }
        result
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StaticResolver;
    use super::*;

    #[tokio::test]
    async fn test_lookup_ip_merges_families() {
        let mut resolver = StaticResolver::new();
        resolver
            .a
            .insert("mx.example.com".to_string(), vec!["192.0.2.5".parse().unwrap()]);
        resolver
            .aaaa
            .insert("mx.example.com".to_string(), vec!["2001:db8::5".parse().unwrap()]);

        let ips = resolver.lookup_ip("mx.example.com").await.unwrap();
        assert_eq!(ips.len(), 2);
    }

    #[tokio::test]
    async fn test_lookup_ip_not_found_when_both_missing() {
        let resolver = StaticResolver::new();
        assert_eq!(
            resolver.lookup_ip("absent.example.com").await,
            Err(DnsError::NotFound)
        );
    }
}
