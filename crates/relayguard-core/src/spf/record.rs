//! SPF record model and parsing

use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use relayguard_common::constants::{
    SPF_EVICT_SECS, SPF_NXDOMAIN_LIMIT, SPF_NXDOMAIN_QUERIES, SPF_REFRESH_SECS,
};
use serde::{Deserialize, Serialize};

/// SPF qualifier (mechanism prefix)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

/// A single SPF mechanism
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mechanism {
    Ip4(Ipv4Net),
    Ip6(Ipv6Net),
    A {
        domain: Option<String>,
        v4_prefix: u8,
        v6_prefix: u8,
    },
    Mx {
        domain: Option<String>,
        v4_prefix: u8,
        v6_prefix: u8,
    },
    Ptr(Option<String>),
    Exists(String),
    Include(String),
}

impl Mechanism {
    /// Evaluation cost rank; records are walked cheapest-first so IP
    /// literals short-circuit before anything that needs DNS
    pub fn complexity(&self) -> u8 {
        match self {
            Mechanism::Ip4(_) | Mechanism::Ip6(_) => 0,
            Mechanism::A { .. } => 1,
            Mechanism::Mx { .. } => 2,
            Mechanism::Exists(_) => 3,
            Mechanism::Include(_) => 4,
            Mechanism::Ptr(_) => 5,
        }
    }
}

/// Qualifier + mechanism pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

/// How a cached record came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOrigin {
    /// Parsed from a published TXT record
    Published,
    /// Synthesised from the best-guess fallback
    Guessed,
    /// The domain itself did not resolve
    NxDomain,
}

/// A cached SPF record with its usage counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpfRecord {
    /// Mechanisms in complexity order
    pub directives: Vec<Directive>,

    /// Explicit `all` qualifier, when the record carries one
    pub all: Option<Qualifier>,

    /// `redirect=` target
    pub redirect: Option<String>,

    /// `exp=` target
    pub explanation: Option<String>,

    /// Set when the record carried an unrecognised tail
    pub syntax_error: bool,

    pub origin: RecordOrigin,

    /// Consecutive NXDOMAIN observations for the domain
    pub nxdomain_count: u32,

    /// Lifetime query counter
    pub query_count: u32,

    /// Queries since the last refresh, drives refresh priority
    pub queries_since_refresh: u32,

    pub refreshed_at: DateTime<Utc>,
    pub last_query_at: DateTime<Utc>,
}

impl SpfRecord {
    fn empty(origin: RecordOrigin) -> Self {
        let now = Utc::now();
        Self {
            directives: Vec::new(),
            all: None,
            redirect: None,
            explanation: None,
            syntax_error: false,
            origin,
            nxdomain_count: 0,
            query_count: 0,
            queries_since_refresh: 0,
            refreshed_at: now,
            last_query_at: now,
        }
    }

    /// A record for a domain that did not resolve at all
    pub fn nxdomain() -> Self {
        let mut record = Self::empty(RecordOrigin::NxDomain);
        record.nxdomain_count = 1;
        record
    }

    /// Record a query against this entry
    pub fn register_query(&mut self, now: DateTime<Utc>) {
        self.query_count = self.query_count.saturating_add(1);
        self.queries_since_refresh = self.queries_since_refresh.saturating_add(1);
        self.last_query_at = now;
    }

    /// Whether the domain can be treated as definitely inexistent
    pub fn definitely_inexistent(&self) -> bool {
        self.origin == RecordOrigin::NxDomain
            && self.nxdomain_count > SPF_NXDOMAIN_LIMIT
            && self.query_count > SPF_NXDOMAIN_QUERIES
    }

    /// Whether the background loop should re-resolve this record
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.refreshed_at).num_seconds() > SPF_REFRESH_SECS
    }

    /// Whether the record has gone unqueried long enough to evict
    pub fn evictable(&self, now: DateTime<Utc>) -> bool {
        (now - self.last_query_at).num_seconds() > SPF_EVICT_SECS
    }

    /// Carry usage counters over from the entry this one replaces
    pub fn inherit_counters(&mut self, previous: &SpfRecord) {
        self.query_count = previous.query_count;
        self.last_query_at = previous.last_query_at;
        if self.origin == RecordOrigin::NxDomain {
            self.nxdomain_count = previous.nxdomain_count.saturating_add(1);
        }
    }
}

/// Parse a published record body.
///
/// `rfc_all_default` controls the qualifier of a bare `all` term: the
/// engine's historical default is NEUTRAL, the RFC default is `+`.
pub fn parse(text: &str, rfc_all_default: bool) -> Option<SpfRecord> {
    let text = text.trim().trim_matches('"').to_lowercase();
    let rest = text.strip_prefix("v=spf1")?;

    let mut record = SpfRecord::empty(RecordOrigin::Published);

    for term in rest.split_whitespace() {
        // Modifiers
        if let Some(target) = term.strip_prefix("redirect=") {
            record.redirect = Some(target.to_string());
            continue;
        }
        if let Some(target) = term.strip_prefix("exp=") {
            record.explanation = Some(target.to_string());
            continue;
        }
        if term.contains('=') {
            // Unknown modifiers are ignored per RFC 7208 §6
            continue;
        }

        let (explicit, mechanism_str) = match term.chars().next() {
            Some('+') => (Some(Qualifier::Pass), &term[1..]),
            Some('-') => (Some(Qualifier::Fail), &term[1..]),
            Some('~') => (Some(Qualifier::SoftFail), &term[1..]),
            Some('?') => (Some(Qualifier::Neutral), &term[1..]),
            _ => (None, term),
        };

        if mechanism_str == "all" {
            let bare_default = if rfc_all_default {
                Qualifier::Pass
            } else {
                Qualifier::Neutral
            };
            record.all = Some(explicit.unwrap_or(bare_default));
            continue;
        }

        let qualifier = explicit.unwrap_or(Qualifier::Pass);

        match parse_mechanism(mechanism_str).or_else(|| repair_mechanism(mechanism_str)) {
            Some(mechanism) => record.directives.push(Directive {
                qualifier,
                mechanism,
            }),
            None => record.syntax_error = true,
        }
    }

    record
        .directives
        .sort_by_key(|d| d.mechanism.complexity());

    Some(record)
}

/// Parse the best-guess fallback record; `None` only on a broken guess
/// string, which the config layer treats as a configuration error
pub fn parse_guess(text: &str) -> Option<SpfRecord> {
    let mut record = parse(text, false)?;
    record.origin = RecordOrigin::Guessed;
    Some(record)
}

fn parse_mechanism(s: &str) -> Option<Mechanism> {
    if let Some(rest) = s.strip_prefix("ip4:") {
        let net = if rest.contains('/') {
            rest.parse().ok()?
        } else {
            format!("{}/32", rest).parse().ok()?
        };
        return Some(Mechanism::Ip4(net));
    }

    if let Some(rest) = s.strip_prefix("ip6:") {
        let net = if rest.contains('/') {
            rest.parse().ok()?
        } else {
            format!("{}/128", rest).parse().ok()?
        };
        return Some(Mechanism::Ip6(net));
    }

    if s == "a" || s.starts_with("a:") || s.starts_with("a/") {
        let (domain, v4_prefix, v6_prefix) = parse_target(&s[1..])?;
        return Some(Mechanism::A {
            domain,
            v4_prefix,
            v6_prefix,
        });
    }

    if s == "mx" || s.starts_with("mx:") || s.starts_with("mx/") {
        let (domain, v4_prefix, v6_prefix) = parse_target(&s[2..])?;
        return Some(Mechanism::Mx {
            domain,
            v4_prefix,
            v6_prefix,
        });
    }

    if s == "ptr" {
        return Some(Mechanism::Ptr(None));
    }
    if let Some(domain) = s.strip_prefix("ptr:") {
        return Some(Mechanism::Ptr(Some(domain.to_string())));
    }

    if let Some(domain) = s.strip_prefix("exists:") {
        return Some(Mechanism::Exists(domain.to_string()));
    }

    if let Some(domain) = s.strip_prefix("include:") {
        return Some(Mechanism::Include(domain.to_string()));
    }

    None
}

/// Rewrite a mistyped token whose tail still reads as a CIDR mechanism,
/// e.g. `ip4=192.0.2.0/24` or `ipv4:192.0.2.0/24`
fn repair_mechanism(s: &str) -> Option<Mechanism> {
    for marker in ["ip4", "ip6"] {
        if let Some(pos) = s.find(marker) {
            let tail = &s[pos + marker.len()..];
            let tail = tail.trim_start_matches([':', '=']);
            if tail.is_empty() {
                continue;
            }
            let candidate = format!("{}:{}", marker, tail);
            if let Some(mechanism) = parse_mechanism(&candidate) {
                return Some(mechanism);
            }
        }
    }
    None
}

/// Parse `[:domain][/v4][//v6]` following an `a` or `mx` keyword
fn parse_target(rest: &str) -> Option<(Option<String>, u8, u8)> {
    let mut domain = None;
    let mut v4_prefix = 32u8;
    let mut v6_prefix = 128u8;

    let cidr_part = if let Some(rest) = rest.strip_prefix(':') {
        match rest.find('/') {
            Some(pos) => {
                domain = Some(rest[..pos].to_string());
                &rest[pos..]
            }
            None => {
                domain = Some(rest.to_string());
                ""
            }
        }
    } else {
        rest
    };

    if !cidr_part.is_empty() {
        let (v4_part, v6_part) = match cidr_part.find("//") {
            Some(pos) => (&cidr_part[..pos], Some(&cidr_part[pos + 2..])),
            None => (cidr_part, None),
        };
        let v4_part = v4_part.trim_start_matches('/');
        if !v4_part.is_empty() {
            v4_prefix = v4_part.parse().ok().filter(|p| *p <= 32)?;
        }
        if let Some(v6_part) = v6_part {
            v6_prefix = v6_part.parse().ok().filter(|p| *p <= 128)?;
        }
    }

    if let Some(d) = &domain {
        if d.is_empty() {
            return None;
        }
    }

    Some((domain, v4_prefix, v6_prefix))
}
