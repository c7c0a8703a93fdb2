//! Identifier extraction and token expansion
//!
//! Turns one SMTP transaction into the set of accountable identifiers
//! that reputation and policy evaluation run against.

use crate::resolver::Resolver;
use relayguard_common::{Token, Transaction};
use std::sync::Arc;
use tracing::debug;

/// Provider-list facts the expander needs, computed by the caller so
/// this module stays independent of the policy lists
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderHints {
    /// The connecting IP or HELO belongs to a known provider
    pub origin_is_provider: bool,

    /// The sender's domain is a freemail provider
    pub sender_domain_is_provider: bool,
}

/// Result of token derivation
#[derive(Debug, Clone)]
pub struct DerivedTokens {
    /// Accountable identifiers, canonical order, deduplicated
    pub tokens: Vec<Token>,

    /// The forward-confirmed hostname for the peer, if any
    pub hostname: Option<String>,

    /// Whether the HELO name itself resolved back to the peer IP
    pub helo_confirmed: bool,
}

/// Token expander over the shared resolver
pub struct TokenExpander {
    resolver: Arc<dyn Resolver>,
}

impl TokenExpander {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self { resolver }
    }

    /// Derive the canonical token set for a transaction
    pub async fn derive(
        &self,
        tx: &Transaction,
        spf_pass: bool,
        hints: ProviderHints,
    ) -> DerivedTokens {
        let mut tokens = vec![Token::Ip(tx.ip)];

        // Resolve the peer to a hostname: prefer a HELO that forward
        // confirms, fall back to forward-confirmed rDNS
        let mut helo_confirmed = false;
        let mut hostname: Option<String> = None;

        if let Some(helo) = tx.helo.as_deref().filter(|h| h.contains('.')) {
            if let Ok(addrs) = self.resolver.lookup_ip(helo).await {
                if addrs.contains(&tx.ip) {
                    helo_confirmed = true;
                    hostname = Some(helo.to_string());
                }
            }
        }

        if hostname.is_none() {
            if let Ok(names) = self.resolver.lookup_ptr(tx.ip).await {
                for name in names {
                    if let Ok(addrs) = self.resolver.lookup_ip(&name).await {
                        if addrs.contains(&tx.ip) {
                            hostname = Some(name);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(name) = &hostname {
            tokens.push(Token::host(name));

            // Dual-stack equivalence: a host with exactly one address per
            // family accounts for both addresses
            if let Ok(v4) = self.resolver.lookup_a(name).await {
                if let [addr] = v4.as_slice() {
                    tokens.push(Token::Ip((*addr).into()));
                }
            }
            if let Ok(v6) = self.resolver.lookup_aaaa(name).await {
                if let [addr] = v6.as_slice() {
                    tokens.push(Token::Ip((*addr).into()));
                }
            }
        }

        // The sender becomes accountable only when SPF vouches for it or
        // the origin is a known provider for it
        if spf_pass || hints.origin_is_provider {
            if let Some(sender) = &tx.sender {
                if hints.sender_domain_is_provider {
                    tokens.push(Token::Email(sender.clone()));
                } else if let Some(domain) = tx.sender_domain() {
                    tokens.push(Token::domain(domain));
                }
            }
        }

        if let Some(recipient) = &tx.recipient {
            tokens.push(Token::Recipient(recipient.clone()));
        }
        if let Some(client) = &tx.client {
            tokens.push(Token::Client(client.clone()));
        }

        dedup(&mut tokens);
        debug!(ip = %tx.ip, count = tokens.len(), "Derived token set");

        DerivedTokens {
            tokens,
            hostname,
            helo_confirmed,
        }
    }
}

/// Produce the superset used for list and reputation checks: every
/// hostname and domain token also contributes its registered domain
pub fn expand(tokens: &[Token]) -> Vec<Token> {
    let mut out = tokens.to_vec();

    for token in tokens {
        match token {
            Token::Host(name) => {
                if let Some(registered) = psl::domain_str(name) {
                    if registered != name {
                        out.push(Token::Host(registered.to_string()));
                    }
                }
            }
            Token::Domain(name) => {
                if let Some(registered) = psl::domain_str(name) {
                    if registered != name {
                        out.push(Token::Domain(registered.to_string()));
                    }
                }
            }
            Token::Email(addr) => {
                if let Some((_, domain)) = addr.rsplit_once('@') {
                    if let Some(registered) = psl::domain_str(domain) {
                        if registered != domain {
                            out.push(Token::Domain(registered.to_string()));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    dedup(&mut out);
    out
}

fn dedup(tokens: &mut Vec<Token>) {
    let mut seen = std::collections::HashSet::new();
    tokens.retain(|t| seen.insert(t.clone()));
}
