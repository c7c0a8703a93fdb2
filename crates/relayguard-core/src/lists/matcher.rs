//! Tagged matcher families for policy list entries
//!
//! List entries arrive as strings in several pattern languages (plain
//! tokens, CIDR, regex, WHOIS attributes, DNSBL references). They are
//! split into typed families at insert time so the hot path dispatches
//! on a variant instead of re-inspecting every entry string.

use ipnet::IpNet;
use regex::Regex;
use relayguard_common::{Error, Result, Token};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;

/// WHOIS attributes supplied by the external lookup collaborator,
/// keyed by field name (`ownerid`, `owner-c`, ...)
pub type WhoisFacts = HashMap<String, String>;

/// One compiled policy list
#[derive(Default)]
pub struct Matcher {
    /// Original entry texts, kept for persistence and listing
    entries: BTreeSet<String>,

    ips: HashSet<IpAddr>,
    cidrs: Vec<IpNet>,
    hosts: HashSet<String>,
    domains: HashSet<String>,
    emails: HashSet<String>,
    recipients: HashSet<String>,
    clients: HashSet<String>,
    regexes: Vec<(String, Regex)>,
    whois: Vec<(String, String)>,
    dnsbl: Vec<(String, String)>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry. Returns `false` when it was already present or
    /// is subsumed by an existing CIDR.
    pub fn insert(&mut self, entry: &str) -> Result<bool> {
        let entry = entry.trim();
        if entry.is_empty() {
            return Err(Error::Validation("empty list entry".to_string()));
        }
        if self.entries.contains(entry) {
            return Ok(false);
        }

        if let Some(rest) = entry.strip_prefix("CIDR=") {
            let net: IpNet = rest
                .parse()
                .map_err(|_| Error::Validation(format!("bad CIDR entry: {}", entry)))?;
            if !self.insert_cidr(net) {
                return Ok(false);
            }
        } else if let Some(rest) = entry.strip_prefix("REGEX=") {
            let regex = regex::RegexBuilder::new(rest)
                .size_limit(1 << 20)
                .build()
                .map_err(|e| Error::Validation(format!("bad regex entry: {}", e)))?;
            self.regexes.push((rest.to_string(), regex));
        } else if let Some(rest) = entry.strip_prefix("WHOIS/") {
            let (field, value) = rest
                .split_once('=')
                .ok_or_else(|| Error::Validation(format!("bad WHOIS entry: {}", entry)))?;
            self.whois.push((field.to_lowercase(), value.to_lowercase()));
        } else if let Some(rest) = entry.strip_prefix("DNSBL=") {
            let (zone, value) = rest
                .split_once(';')
                .ok_or_else(|| Error::Validation(format!("bad DNSBL entry: {}", entry)))?;
            self.dnsbl.push((zone.to_lowercase(), value.to_string()));
        } else {
            match entry.parse::<Token>()? {
                Token::Ip(ip) => {
                    self.ips.insert(ip);
                }
                Token::Host(name) => {
                    self.hosts.insert(name);
                }
                Token::Domain(name) => {
                    self.domains.insert(name);
                }
                Token::Email(addr) => {
                    self.emails.insert(addr);
                }
                Token::Recipient(addr) => {
                    self.recipients.insert(addr);
                }
                Token::Client(addr) => {
                    self.clients.insert(addr);
                }
            }
        }

        self.entries.insert(entry.to_string());
        Ok(true)
    }

    /// Insert a CIDR, tracking overlap: subsumed entries are dropped and
    /// an already-covered insert is a no-op
    fn insert_cidr(&mut self, net: IpNet) -> bool {
        if self.cidrs.iter().any(|existing| covers(existing, &net)) {
            return false;
        }
        self.cidrs.retain(|existing| !covers(&net, existing));
        self.cidrs.push(net);
        true
    }

    /// Remove an entry by its original text
    pub fn remove(&mut self, entry: &str) -> bool {
        let entry = entry.trim();
        if !self.entries.remove(entry) {
            return false;
        }
        self.rebuild();
        true
    }

    fn rebuild(&mut self) {
        let entries: Vec<String> = self.entries.iter().cloned().collect();
        *self = Matcher::new();
        for entry in entries {
            let _ = self.insert(&entry);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Original entry texts, for persistence
    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn contains_entry(&self, entry: &str) -> bool {
        self.entries.contains(entry.trim())
    }

    /// Match one token against every applicable family
    pub fn matches_token(&self, token: &Token) -> bool {
        match token {
            Token::Ip(ip) => {
                self.ips.contains(ip) || self.cidrs.iter().any(|net| net.contains(ip))
            }
            Token::Host(name) => self.matches_host(name),
            Token::Domain(name) => {
                self.domains.contains(name) || self.matches_regex(name)
            }
            Token::Email(addr) => {
                if self.emails.contains(addr) || self.matches_regex(addr) {
                    return true;
                }
                addr.rsplit_once('@')
                    .map(|(_, domain)| self.domains.contains(domain))
                    .unwrap_or(false)
            }
            Token::Recipient(addr) => self.matches_recipient(addr),
            Token::Client(addr) => self.clients.contains(addr),
        }
    }

    /// Suffix-walk a hostname against the rooted-suffix family
    pub fn matches_host(&self, name: &str) -> bool {
        if self.matches_regex(name) {
            return true;
        }
        let mut candidate = name;
        loop {
            if self.hosts.contains(candidate) {
                return true;
            }
            match candidate.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => candidate = rest,
                _ => return false,
            }
        }
    }

    /// Match a recipient address against mailbox, domain, and suffix
    /// entries
    pub fn matches_recipient(&self, addr: &str) -> bool {
        if self.recipients.contains(addr) || self.emails.contains(addr) {
            return true;
        }
        if let Some((_, domain)) = addr.rsplit_once('@') {
            if self.domains.contains(domain) || self.matches_host(domain) {
                return true;
            }
        }
        self.matches_regex(addr)
    }

    /// Match free text (hostnames, URLs) against the regex family
    pub fn matches_regex(&self, text: &str) -> bool {
        self.regexes.iter().any(|(_, regex)| regex.is_match(text))
    }

    /// Match externally-supplied WHOIS attributes
    pub fn matches_whois(&self, facts: &WhoisFacts) -> bool {
        self.whois.iter().any(|(field, value)| {
            facts
                .get(field)
                .map(|v| v.to_lowercase() == *value)
                .unwrap_or(false)
        })
    }

    /// First matching token from a set, with the entry family that hit
    pub fn first_match<'a>(&self, tokens: &'a [Token]) -> Option<&'a Token> {
        tokens.iter().find(|token| self.matches_token(token))
    }
}

fn covers(outer: &IpNet, inner: &IpNet) -> bool {
    match (outer, inner) {
        (IpNet::V4(o), IpNet::V4(i)) => o.contains(&i.network()) && o.prefix_len() <= i.prefix_len(),
        (IpNet::V6(o), IpNet::V6(i)) => o.contains(&i.network()) && o.prefix_len() <= i.prefix_len(),
        _ => false,
    }
}
