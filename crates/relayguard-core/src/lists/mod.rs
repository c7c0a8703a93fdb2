//! Policy lists
//!
//! Seven lists steer the decision pipeline: Block, White, Ignore,
//! Provider, Generic, Trap, and NoReply. Each is a compiled [`Matcher`]
//! behind its own lock; reads dominate, mutation is rare.

pub mod matcher;

pub use matcher::{Matcher, WhoisFacts};

use relayguard_common::{Result, Token};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::info;

/// One named policy list
pub struct ListSet {
    name: &'static str,
    matcher: RwLock<Matcher>,
    dirty: AtomicBool,
}

impl ListSet {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            matcher: RwLock::new(Matcher::new()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Add an entry; `true` when it was new
    pub async fn add(&self, entry: &str) -> Result<bool> {
        let added = self.matcher.write().await.insert(entry)?;
        if added {
            self.dirty.store(true, Ordering::Relaxed);
            info!(list = self.name, entry = %entry, "List entry added");
        }
        Ok(added)
    }

    /// Remove an entry; `true` when it was present
    pub async fn remove(&self, entry: &str) -> bool {
        let removed = self.matcher.write().await.remove(entry);
        if removed {
            self.dirty.store(true, Ordering::Relaxed);
            info!(list = self.name, entry = %entry, "List entry removed");
        }
        removed
    }

    pub async fn contains_entry(&self, entry: &str) -> bool {
        self.matcher.read().await.contains_entry(entry)
    }

    pub async fn matches_token(&self, token: &Token) -> bool {
        self.matcher.read().await.matches_token(token)
    }

    /// First token of the set the list matches, cloned out
    pub async fn first_match(&self, tokens: &[Token]) -> Option<Token> {
        self.matcher.read().await.first_match(tokens).cloned()
    }

    pub async fn matches_any(&self, tokens: &[Token]) -> bool {
        self.matcher.read().await.first_match(tokens).is_some()
    }

    pub async fn matches_host(&self, name: &str) -> bool {
        self.matcher.read().await.matches_host(name)
    }

    pub async fn matches_recipient(&self, addr: &str) -> bool {
        self.matcher.read().await.matches_recipient(addr)
    }

    pub async fn matches_regex(&self, text: &str) -> bool {
        self.matcher.read().await.matches_regex(text)
    }

    pub async fn matches_whois(&self, facts: &WhoisFacts) -> bool {
        self.matcher.read().await.matches_whois(facts)
    }

    pub async fn matches_ip(&self, ip: IpAddr) -> bool {
        self.matcher.read().await.matches_token(&Token::Ip(ip))
    }

    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub async fn entries(&self) -> Vec<String> {
        self.matcher.read().await.entries()
    }

    /// Replace contents from persisted entries, skipping unparseable ones
    pub async fn restore(&self, entries: Vec<String>) {
        let mut matcher = Matcher::new();
        for entry in entries {
            let _ = matcher.insert(&entry);
        }
        *self.matcher.write().await = matcher;
    }
}

/// The full set of policy lists
pub struct PolicyLists {
    pub block: ListSet,
    pub white: ListSet,
    pub ignore: ListSet,
    pub provider: ListSet,
    pub generic: ListSet,
    pub trap: ListSet,
    pub noreply: ListSet,
}

impl PolicyLists {
    pub fn new() -> Self {
        Self {
            block: ListSet::new("block"),
            white: ListSet::new("white"),
            ignore: ListSet::new("ignore"),
            provider: ListSet::new("provider"),
            generic: ListSet::new("generic"),
            trap: ListSet::new("trap"),
            noreply: ListSet::new("noreply"),
        }
    }

    /// All lists with their snapshot file names
    pub fn all(&self) -> [(&'static str, &ListSet); 7] {
        [
            ("block.json", &self.block),
            ("white.json", &self.white),
            ("ignore.json", &self.ignore),
            ("provider.json", &self.provider),
            ("generic.json", &self.generic),
            ("trap.json", &self.trap),
            ("noreply.json", &self.noreply),
        ]
    }

    /// Snapshot every list for persistence
    pub async fn snapshot(&self) -> HashMap<String, Vec<String>> {
        let mut out = HashMap::new();
        for (file, list) in self.all() {
            out.insert(file.to_string(), list.entries().await);
        }
        out
    }
}

impl Default for PolicyLists {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_remove_roundtrip() {
        let lists = PolicyLists::new();

        assert!(lists.block.add("192.0.2.5").await.unwrap());
        assert!(!lists.block.add("192.0.2.5").await.unwrap());
        assert!(lists.block.take_dirty());
        assert!(!lists.block.take_dirty());

        assert!(lists.block.matches_ip("192.0.2.5".parse().unwrap()).await);
        assert!(lists.block.remove("192.0.2.5").await);
        assert!(!lists.block.matches_ip("192.0.2.5".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_restore_skips_bad_entries() {
        let lists = PolicyLists::new();
        lists
            .white
            .restore(vec![
                ".example.com".to_string(),
                "not a token".to_string(),
                "192.0.2.5".to_string(),
            ])
            .await;

        assert_eq!(lists.white.entries().await.len(), 2);
        assert!(lists.white.matches_host("mx.example.com").await);
    }

    #[tokio::test]
    async fn test_trap_list_recipients() {
        let lists = PolicyLists::new();
        lists.trap.add("@honeypot.tld").await.unwrap();

        assert!(lists.trap.matches_recipient("victim@honeypot.tld").await);
        assert!(!lists.trap.matches_recipient("real@example.com").await);
    }
}
