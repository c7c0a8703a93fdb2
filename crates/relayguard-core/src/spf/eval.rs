//! SPF mechanism evaluation

use super::record::{Mechanism, Qualifier, RecordOrigin, SpfRecord};
use super::registry::SpfRegistry;
use crate::net;
use crate::resolver::{DnsError, Resolver};
use ipnet::{Ipv4Net, Ipv6Net};
use relayguard_common::config::SpfConfig;
use relayguard_common::constants::SPF_DEPTH_LIMIT;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// SPF evaluation result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfOutcome {
    /// The sending IP is authorized
    Pass,
    /// The sending IP is explicitly not authorized
    Fail,
    /// The sending IP is probably not authorized
    SoftFail,
    /// The domain owner has no opinion
    Neutral,
    /// No domain or no record to check
    None,
    /// Transient DNS trouble; retry later
    TempError,
    /// The record could not be interpreted
    PermError,
}

impl From<Qualifier> for SpfOutcome {
    fn from(q: Qualifier) -> Self {
        match q {
            Qualifier::Pass => SpfOutcome::Pass,
            Qualifier::Fail => SpfOutcome::Fail,
            Qualifier::SoftFail => SpfOutcome::SoftFail,
            Qualifier::Neutral => SpfOutcome::Neutral,
        }
    }
}

impl std::fmt::Display for SpfOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SpfOutcome::Pass => "PASS",
            SpfOutcome::Fail => "FAIL",
            SpfOutcome::SoftFail => "SOFTFAIL",
            SpfOutcome::Neutral => "NEUTRAL",
            SpfOutcome::None => "NONE",
            SpfOutcome::TempError => "TEMPERROR",
            SpfOutcome::PermError => "PERMERROR",
        };
        write!(f, "{}", s)
    }
}

/// How one mechanism related to the client IP
enum MechMatch {
    Matched,
    NotMatched,
    TempError,
    PermError,
}

/// SPF evaluator over the shared registry
pub struct SpfEvaluator {
    registry: Arc<SpfRegistry>,
    resolver: Arc<dyn Resolver>,
    config: SpfConfig,
}

impl SpfEvaluator {
    pub fn new(registry: Arc<SpfRegistry>, resolver: Arc<dyn Resolver>, config: SpfConfig) -> Self {
        Self {
            registry,
            resolver,
            config,
        }
    }

    /// Evaluate the transaction. The checked identity is the sender's
    /// domain when present, the HELO name otherwise.
    pub async fn evaluate(
        &self,
        ip: IpAddr,
        sender_domain: Option<&str>,
        helo: Option<&str>,
    ) -> SpfOutcome {
        let domain = sender_domain
            .or_else(|| helo.filter(|h| h.contains('.')))
            .map(|d| d.to_lowercase());

        let domain = match domain {
            Some(d) => d,
            None => return SpfOutcome::None,
        };

        let mut visited = HashSet::new();
        let outcome = self.check_host(&domain, ip, 0, &mut visited).await;
        debug!(domain = %domain, ip = %ip, outcome = %outcome, "SPF evaluated");
        outcome
    }

    fn check_host<'a>(
        &'a self,
        domain: &'a str,
        ip: IpAddr,
        depth: usize,
        visited: &'a mut HashSet<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = SpfOutcome> + Send + 'a>> {
        Box::pin(async move {
            visited.insert(domain.to_string());

            let record = match self.registry.lookup(domain).await {
                Ok(record) => record,
                Err(DnsError::NotFound) => return SpfOutcome::None,
                Err(_) => return SpfOutcome::TempError,
            };

            if record.origin == RecordOrigin::NxDomain {
                return SpfOutcome::None;
            }

            for directive in &record.directives {
                match self
                    .match_mechanism(&directive.mechanism, domain, ip, depth, visited)
                    .await
                {
                    MechMatch::Matched => return directive.qualifier.into(),
                    MechMatch::NotMatched => continue,
                    MechMatch::TempError => return SpfOutcome::TempError,
                    MechMatch::PermError => return SpfOutcome::PermError,
                }
            }

            if let Some(target) = &record.redirect {
                if depth + 1 < SPF_DEPTH_LIMIT && !visited.contains(target) {
                    return self.check_host(target, ip, depth + 1, visited).await;
                }
            }

            self.fallthrough(&record)
        })
    }

    /// Result when no mechanism matched
    fn fallthrough(&self, record: &SpfRecord) -> SpfOutcome {
        if let Some(all) = record.all {
            return all.into();
        }
        if record.syntax_error {
            return if self.config.softfail_on_syntax_error {
                SpfOutcome::SoftFail
            } else {
                SpfOutcome::PermError
            };
        }
        SpfOutcome::Neutral
    }

    async fn match_mechanism(
        &self,
        mechanism: &Mechanism,
        domain: &str,
        ip: IpAddr,
        depth: usize,
        visited: &mut HashSet<String>,
    ) -> MechMatch {
        match mechanism {
            Mechanism::Ip4(net) => {
                // Reserved ranges are publishing mistakes, never matches
                if net::v4_net_reserved(net) {
                    return MechMatch::NotMatched;
                }
                match ip {
                    IpAddr::V4(v4) if net.contains(&v4) => MechMatch::Matched,
                    _ => MechMatch::NotMatched,
                }
            }

            Mechanism::Ip6(net) => match ip {
                IpAddr::V6(v6) if net.contains(&v6) => MechMatch::Matched,
                _ => MechMatch::NotMatched,
            },

            Mechanism::A {
                domain: target,
                v4_prefix,
                v6_prefix,
            } => {
                let target = target.as_deref().unwrap_or(domain);
                self.match_addresses(target, ip, *v4_prefix, *v6_prefix).await
            }

            Mechanism::Mx {
                domain: target,
                v4_prefix,
                v6_prefix,
            } => {
                let target = target.as_deref().unwrap_or(domain);
                let hosts = match self.resolver.lookup_mx(target).await {
                    Ok(hosts) => hosts,
                    Err(DnsError::NotFound) => return MechMatch::NotMatched,
                    Err(_) => return MechMatch::TempError,
                };
                for host in hosts {
                    match self.match_addresses(&host, ip, *v4_prefix, *v6_prefix).await {
                        MechMatch::NotMatched => continue,
                        other => return other,
                    }
                }
                MechMatch::NotMatched
            }

            Mechanism::Exists(target) => match self.resolver.lookup_a(target).await {
                Ok(addrs) if !addrs.is_empty() => MechMatch::Matched,
                Ok(_) | Err(DnsError::NotFound) => MechMatch::NotMatched,
                Err(_) => MechMatch::TempError,
            },

            Mechanism::Include(target) => {
                if depth + 1 >= SPF_DEPTH_LIMIT || visited.contains(target) {
                    return MechMatch::NotMatched;
                }
                match self.check_host(target, ip, depth + 1, visited).await {
                    SpfOutcome::Pass => MechMatch::Matched,
                    // An inexistent include target is survivable
                    SpfOutcome::None => MechMatch::NotMatched,
                    SpfOutcome::Fail | SpfOutcome::SoftFail | SpfOutcome::Neutral => {
                        MechMatch::NotMatched
                    }
                    SpfOutcome::TempError => MechMatch::TempError,
                    SpfOutcome::PermError => MechMatch::PermError,
                }
            }

            Mechanism::Ptr(target) => {
                if depth > 0 {
                    return MechMatch::NotMatched;
                }
                let expected = target.as_deref().unwrap_or(domain);
                let names = match self.resolver.lookup_ptr(ip).await {
                    Ok(names) => names,
                    Err(DnsError::NotFound) => return MechMatch::NotMatched,
                    Err(_) => return MechMatch::TempError,
                };
                for name in names {
                    if name != expected && !name.ends_with(&format!(".{}", expected)) {
                        continue;
                    }
                    if let Ok(addrs) = self.resolver.lookup_ip(&name).await {
                        if addrs.contains(&ip) {
                            return MechMatch::Matched;
                        }
                    }
                }
                MechMatch::NotMatched
            }
        }
    }

    /// Match the client IP against a host's A/AAAA records under the
    /// mechanism's dual-CIDR prefixes
    async fn match_addresses(
        &self,
        host: &str,
        ip: IpAddr,
        v4_prefix: u8,
        v6_prefix: u8,
    ) -> MechMatch {
        match ip {
            IpAddr::V4(v4) => match self.resolver.lookup_a(host).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if let Ok(net) = Ipv4Net::new(addr, v4_prefix) {
                            if net.contains(&v4) {
                                return MechMatch::Matched;
                            }
                        }
                    }
                    MechMatch::NotMatched
                }
                Err(DnsError::NotFound) => MechMatch::NotMatched,
                Err(_) => MechMatch::TempError,
            },
            IpAddr::V6(v6) => match self.resolver.lookup_aaaa(host).await {
                Ok(addrs) => {
                    for addr in addrs {
                        if let Ok(net) = Ipv6Net::new(addr, v6_prefix) {
                            if net.contains(&v6) {
                                return MechMatch::Matched;
                            }
                        }
                    }
                    MechMatch::NotMatched
                }
                Err(DnsError::NotFound) => MechMatch::NotMatched,
                Err(_) => MechMatch::TempError,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::testing::StaticResolver;

    fn evaluator(resolver: StaticResolver) -> SpfEvaluator {
        let resolver: Arc<dyn Resolver> = Arc::new(resolver);
        let config = SpfConfig::default();
        let registry = Arc::new(SpfRegistry::new(resolver.clone(), config.clone()));
        SpfEvaluator::new(registry, resolver, config)
    }

    fn spf(resolver: &mut StaticResolver, domain: &str, record: &str) {
        resolver
            .txt
            .insert(domain.to_string(), vec![record.to_string()]);
        // Keep the domain resolvable so it is not treated as NXDOMAIN
        resolver
            .a
            .entry(domain.to_string())
            .or_insert_with(|| vec!["198.51.100.1".parse().unwrap()]);
    }

    #[tokio::test]
    async fn test_ip4_literal_pass() {
        let mut resolver = StaticResolver::new();
        spf(&mut resolver, "example.com", "v=spf1 ip4:192.0.2.0/24 -all");

        let eval = evaluator(resolver);
        let outcome = eval
            .evaluate("192.0.2.5".parse().unwrap(), Some("example.com"), None)
            .await;
        assert_eq!(outcome, SpfOutcome::Pass);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let mut resolver = StaticResolver::new();
        spf(&mut resolver, "example.com", "v=spf1 -all");

        let eval = evaluator(resolver);
        let outcome = eval
            .evaluate("192.0.2.5".parse().unwrap(), Some("example.com"), None)
            .await;
        assert_eq!(outcome, SpfOutcome::Fail);
    }

    #[tokio::test]
    async fn test_a_mechanism_with_prefix() {
        let mut resolver = StaticResolver::new();
        spf(&mut resolver, "example.com", "v=spf1 a/24 ~all");
        resolver
            .a
            .insert("example.com".to_string(), vec!["192.0.2.1".parse().unwrap()]);

        let eval = evaluator(resolver);
        // In the same /24 as the A record
        let outcome = eval
            .evaluate("192.0.2.200".parse().unwrap(), Some("example.com"), None)
            .await;
        assert_eq!(outcome, SpfOutcome::Pass);

        let outcome = eval
            .evaluate("198.51.100.7".parse().unwrap(), Some("example.com"), None)
            .await;
        assert_eq!(outcome, SpfOutcome::SoftFail);
    }

    #[tokio::test]
    async fn test_include_chain_depth_bound() {
        let mut resolver = StaticResolver::new();
        // Chain of 11 includes ending in a pass-all; depth bound stops
        // the walk and the outer record's all qualifier wins
        for i in 0..11 {
            spf(
                &mut resolver,
                &format!("d{}.example", i),
                &format!("v=spf1 include:d{}.example ~all", i + 1),
            );
        }
        spf(&mut resolver, "d11.example", "v=spf1 +all");

        let eval = evaluator(resolver);
        let outcome = eval
            .evaluate("192.0.2.5".parse().unwrap(), Some("d0.example"), None)
            .await;
        assert_eq!(outcome, SpfOutcome::SoftFail);
    }

    #[tokio::test]
    async fn test_include_cycle_terminates() {
        let mut resolver = StaticResolver::new();
        spf(&mut resolver, "a.example", "v=spf1 include:b.example -all");
        spf(&mut resolver, "b.example", "v=spf1 include:a.example -all");

        let eval = evaluator(resolver);
        let outcome = eval
            .evaluate("192.0.2.5".parse().unwrap(), Some("a.example"), None)
            .await;
        assert_eq!(outcome, SpfOutcome::Fail);
    }

    #[tokio::test]
    async fn test_reserved_cidr_suppressed() {
        let mut resolver = StaticResolver::new();
        spf(&mut resolver, "example.com", "v=spf1 ip4:10.0.0.0/8 ~all");

        let eval = evaluator(resolver);
        let outcome = eval
            .evaluate("10.1.2.3".parse().unwrap(), Some("example.com"), None)
            .await;
        assert_eq!(outcome, SpfOutcome::SoftFail);
    }

    #[tokio::test]
    async fn test_missing_include_target_continues() {
        let mut resolver = StaticResolver::new();
        spf(
            &mut resolver,
            "example.com",
            "v=spf1 include:gone.example ip4:192.0.2.0/24 -all",
        );

        let eval = evaluator(resolver);
        let outcome = eval
            .evaluate("192.0.2.5".parse().unwrap(), Some("example.com"), None)
            .await;
        assert_eq!(outcome, SpfOutcome::Pass);
    }

    #[tokio::test]
    async fn test_syntax_error_fallthrough_softfail() {
        let mut resolver = StaticResolver::new();
        spf(&mut resolver, "example.com", "v=spf1 ip4:192.0.2.0/24 junk%%");

        let eval = evaluator(resolver);
        let outcome = eval
            .evaluate("198.51.100.7".parse().unwrap(), Some("example.com"), None)
            .await;
        assert_eq!(outcome, SpfOutcome::SoftFail);
    }

    #[tokio::test]
    async fn test_no_identity_is_none() {
        let eval = evaluator(StaticResolver::new());
        let outcome = eval.evaluate("192.0.2.5".parse().unwrap(), None, None).await;
        assert_eq!(outcome, SpfOutcome::None);
    }

    #[tokio::test]
    async fn test_transient_failure_is_temperror() {
        let mut resolver = StaticResolver::new();
        resolver.failing.push("example.com".to_string());

        let eval = evaluator(resolver);
        let outcome = eval
            .evaluate("192.0.2.5".parse().unwrap(), Some("example.com"), None)
            .await;
        assert_eq!(outcome, SpfOutcome::TempError);
    }

    #[tokio::test]
    async fn test_ptr_only_at_depth_zero() {
        let mut resolver = StaticResolver::new();
        let ip: IpAddr = "192.0.2.5".parse().unwrap();
        spf(&mut resolver, "example.com", "v=spf1 ptr -all");
        resolver
            .ptr
            .insert(ip, vec!["mx.example.com".to_string()]);
        resolver
            .a
            .insert("mx.example.com".to_string(), vec!["192.0.2.5".parse().unwrap()]);

        let eval = evaluator(resolver);
        let outcome = eval.evaluate(ip, Some("example.com"), None).await;
        assert_eq!(outcome, SpfOutcome::Pass);
    }
}
