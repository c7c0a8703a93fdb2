//! The decision pipeline
//!
//! Ordered rules; the first whose precondition holds wins. Reject-path
//! rules charge an automatic complaint against the expanded token set
//! and still hand out a ticket, so downstream filters can confirm or
//! retract the verdict.

use crate::defer::DeferClass;
use crate::engine::Engine;
use crate::net;
use crate::spf::SpfOutcome;
use crate::tokens::{self, ProviderHints};
use relayguard_common::{Action, Status, Token, Transaction};
use std::sync::Arc;
use tracing::debug;

/// Reserved top-level labels that never belong to a real sender
const RESERVED_TLDS: &[&str] = &[
    "localhost", "local", "lan", "home", "corp", "internal", "test", "invalid", "example",
];

/// Outcome of one decision request
#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,

    /// Ticket identifying this decision, when one was issued
    pub ticket: Option<String>,

    /// Extra reply text: unblock/release URL or a rejection reason
    pub message: Option<String>,

    /// Token recorded in the analysis log
    pub subject: Option<String>,
}

impl Decision {
    /// A decision with no ticket and no message
    pub fn bare(action: Action) -> Self {
        Self {
            action,
            ticket: None,
            message: None,
            subject: None,
        }
    }

    fn with_subject(action: Action, subject: String) -> Self {
        Self {
            action,
            ticket: None,
            message: None,
            subject: Some(subject),
        }
    }

    /// The one-line reply for the text protocol
    pub fn reply_line(&self) -> String {
        if let Some(message) = &self.message {
            format!("{} {}", self.action, message)
        } else if let Some(ticket) = &self.ticket {
            format!("{} {}", self.action, ticket)
        } else {
            self.action.to_string()
        }
    }
}

/// Provider-list facts for the token expander
pub async fn provider_hints(engine: &Arc<Engine>, tx: &Transaction) -> ProviderHints {
    let mut origin_is_provider = engine.lists.provider.matches_ip(tx.ip).await;
    if !origin_is_provider {
        if let Some(helo) = tx.helo.as_deref() {
            origin_is_provider = engine.lists.provider.matches_host(helo).await;
        }
    }

    let sender_domain_is_provider = match tx.sender_domain() {
        Some(domain) => {
            engine
                .lists
                .provider
                .matches_token(&Token::domain(domain))
                .await
        }
        None => false,
    };

    ProviderHints {
        origin_is_provider,
        sender_domain_is_provider,
    }
}

/// Issue a ticket, charge an automatic complaint, and reject
async fn reject(
    engine: &Arc<Engine>,
    action: Action,
    tokens: &[Token],
    message: Option<String>,
    subject: String,
) -> Decision {
    let (_, ticket) = engine.issue_ticket(tokens);
    engine.charge(tokens).await;
    Decision {
        action,
        ticket: Some(ticket),
        message,
        subject: Some(subject),
    }
}

/// Run the ordered rules for one transaction
pub(crate) async fn decide(engine: &Arc<Engine>, tx: &Transaction) -> Decision {
    let subject = tx.ip.to_string();

    // 1. LAN and reserved peers are out of scope
    if net::is_lan(tx.ip) {
        return Decision::with_subject(Action::Lan, subject);
    }
    if net::is_reserved(tx.ip) {
        return Decision::with_subject(Action::Invalid, subject);
    }

    let spf = engine
        .evaluator
        .evaluate(tx.ip, tx.sender_domain(), tx.helo.as_deref())
        .await;

    let hints = provider_hints(engine, tx).await;
    let derived = engine
        .expander
        .derive(tx, spf == SpfOutcome::Pass, hints)
        .await;
    let expanded = tokens::expand(&derived.tokens);

    engine.reputation.add_queries(&expanded).await;

    let flow = tx.flow();

    // 2. White short-circuits everything and undoes false-positive blocks
    if engine.lists.white.matches_any(&expanded).await {
        for token in &expanded {
            engine.lists.block.remove(&token.to_string()).await;
        }
        let (_, ticket) = engine.issue_ticket(&derived.tokens);
        return Decision {
            action: Action::Pass,
            ticket: Some(ticket),
            message: None,
            subject: Some(subject),
        };
    }

    // 3. Block list
    if let Some(matched) = engine.lists.block.first_match(&expanded).await {
        debug!(ip = %tx.ip, token = %matched, "Blocked by list");
        let (_, ticket) = engine.issue_ticket(&derived.tokens);
        engine.charge(&derived.tokens).await;
        let message = engine
            .config
            .policy
            .unblock_url
            .as_ref()
            .map(|url| format!("{}{}", url, ticket));
        return Decision {
            action: Action::Blocked,
            ticket: Some(ticket),
            message,
            subject: Some(subject),
        };
    }

    // 4. Sender domain definitively inexistent
    if let Some(domain) = tx.sender_domain() {
        if engine.registry.is_inexistent(domain).await {
            return reject(
                engine,
                Action::Nxdomain,
                &derived.tokens,
                Some("sender has non-existent internet domain".to_string()),
                subject,
            )
            .await;
        }
    }

    // 5. Explicit SPF fail: the publishing domain carries the verdict,
    // so it joins the accountable set even without a PASS
    if spf == SpfOutcome::Fail {
        let mut charged = derived.tokens.clone();
        if let Some(domain) = tx.sender_domain() {
            let token = Token::domain(domain);
            if !charged.contains(&token) {
                charged.push(token);
            }
        }
        return reject(engine, Action::Fail, &charged, None, subject).await;
    }

    // 6. Malformed or reserved sender
    if let Some(sender) = &tx.sender {
        if !valid_sender(sender) {
            return reject(engine, Action::Invalid, &derived.tokens, None, subject).await;
        }
    }

    // 7. A null sender must come from a host that identifies itself
    if tx.sender.is_none() && !derived.helo_confirmed {
        let generic = match &derived.hostname {
            Some(name) => engine.lists.generic.matches_host(name).await,
            None => false,
        };
        if generic {
            let _ = engine.lists.block.add(&tx.ip.to_string()).await;
        }
        if generic || derived.hostname.is_none() {
            return reject(engine, Action::Invalid, &derived.tokens, None, subject).await;
        }
    }

    // 8. No reverse DNS at all, when the policy demands it
    if derived.hostname.is_none() && engine.config.policy.reverse_required {
        let _ = engine.lists.block.add(&tx.ip.to_string()).await;
        return Decision::with_subject(Action::Invalid, subject);
    }

    // 9. Spam trap recipients
    if let Some(recipient) = &tx.recipient {
        if engine.lists.trap.matches_recipient(recipient).await {
            return reject(engine, Action::SpamTrap, &derived.tokens, None, subject).await;
        }
    }

    // 10. Flood escalation: too many defers for one flow
    if engine.defer.count(&flow).await > engine.defer.flood_max_retry() {
        return reject(engine, Action::Blocked, &derived.tokens, None, subject).await;
    }

    let mut statuses = Vec::with_capacity(expanded.len());
    for token in expanded.iter().filter(|t| t.is_reputable()) {
        statuses.push(engine.reputation.status(token).await);
    }

    // 11. Hard-blocked reputation
    if statuses.contains(&Status::Block) {
        return reject(engine, Action::Blocked, &derived.tokens, None, subject).await;
    }

    // 12. Blacklisted reputation defers for the long window
    if statuses.contains(&Status::Black) && engine.defer.defer(&flow, DeferClass::Black).await {
        let (_, ticket) = engine.issue_ticket(&derived.tokens);
        let message = match (&engine.config.policy.release_url, spf) {
            (Some(url), SpfOutcome::Pass) => Some(format!("{}{}", url, ticket)),
            _ => None,
        };
        return Decision {
            action: Action::Listed,
            ticket: Some(ticket),
            message,
            subject: Some(subject),
        };
    }

    // 13. Greylisted reputation
    if statuses.contains(&Status::Gray) && engine.defer.defer(&flow, DeferClass::Gray).await {
        return Decision::with_subject(Action::Greylist, subject);
    }

    // 14. Flooding origins, unless a provider is behind them
    if !hints.origin_is_provider {
        let mut flooding = false;
        for token in expanded.iter().filter(|t| t.is_reputable()) {
            if engine.reputation.is_flood(token).await {
                flooding = true;
                break;
            }
        }
        if flooding {
            let origin = format!("{}>", flow.split('>').next().unwrap_or(&flow));
            if engine.defer.defer(&origin, DeferClass::Flood).await {
                return Decision::with_subject(Action::Greylist, subject);
            }
        }
    }

    // 15. SOFTFAIL greylists once per flow
    if spf == SpfOutcome::SoftFail
        && !hints.origin_is_provider
        && engine.defer.defer(&flow, DeferClass::SoftFail).await
    {
        return Decision::with_subject(Action::Greylist, subject);
    }

    // 16. Accept with the SPF verdict
    let action = match spf {
        SpfOutcome::Pass => Action::Pass,
        SpfOutcome::SoftFail => Action::SoftFail,
        SpfOutcome::Neutral => Action::Neutral,
        SpfOutcome::None => Action::None,
        SpfOutcome::TempError => return Decision::with_subject(Action::TempError, subject),
        SpfOutcome::PermError => return Decision::with_subject(Action::PermError, subject),
        SpfOutcome::Fail => unreachable!("handled by rule 5"),
    };

    let (_, ticket) = engine.issue_ticket(&derived.tokens);
    Decision {
        action,
        ticket: Some(ticket),
        message: None,
        subject: Some(subject),
    }
}

/// A sender the engine is willing to account for: one `@`, a dotted
/// domain, no reserved top-level label, no address literal
fn valid_sender(sender: &str) -> bool {
    let Some((local, domain)) = sender.rsplit_once('@') else {
        return false;
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return false;
    }
    if domain.starts_with('[') || domain.parse::<std::net::IpAddr>().is_ok() {
        return false;
    }
    let Some(tld) = domain.rsplit('.').next() else {
        return false;
    };
    if RESERVED_TLDS.contains(&tld) {
        return false;
    }
    domain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::testing::StaticResolver;
    use relayguard_common::Config;
    use std::net::IpAddr;

    fn scenario_resolver() -> StaticResolver {
        let mut resolver = StaticResolver::new();
        // example.com authorises 192.0.2.5 and runs mx.example.com
        resolver.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 ip4:192.0.2.0/24 -all".to_string()],
        );
        resolver
            .a
            .insert("example.com".to_string(), vec!["192.0.2.1".parse().unwrap()]);
        resolver
            .a
            .insert("mx.example.com".to_string(), vec!["192.0.2.5".parse().unwrap()]);
        resolver.ptr.insert(
            "192.0.2.5".parse().unwrap(),
            vec!["mx.example.com".to_string()],
        );
        resolver
    }

    fn engine_with(resolver: StaticResolver) -> Arc<Engine> {
        Engine::new(Config::default(), Arc::new(resolver), None, None).0
    }

    fn tx(ip: &str, sender: Option<&str>, helo: Option<&str>, rcpt: Option<&str>) -> Transaction {
        Transaction::new(
            ip.parse().unwrap(),
            sender.map(|s| s.to_string()),
            helo.map(|s| s.to_string()),
            rcpt.map(|s| s.to_string()),
        )
    }

    #[tokio::test]
    async fn test_authorised_sender_passes() {
        let engine = engine_with(scenario_resolver());
        let decision = engine
            .process(tx(
                "192.0.2.5",
                Some("alice@example.com"),
                Some("mx.example.com"),
                Some("bob@test.tld"),
            ))
            .await;

        assert_eq!(decision.action, Action::Pass);
        let ticket = decision.ticket.clone().expect("accept path carries a ticket");
        assert!(decision.reply_line().starts_with("PASS "));

        // The ticket binds the accountable tokens
        let (_, tokens) = engine.ticket.decode(&ticket).unwrap();
        assert!(tokens.contains(&Token::domain("example.com")));
        assert!(tokens.contains(&Token::host("mx.example.com")));
        assert!(tokens.contains(&Token::Recipient("bob@test.tld".to_string())));
    }

    #[tokio::test]
    async fn test_spf_fail_rejects_and_spam_still_counts() {
        let mut resolver = scenario_resolver();
        resolver.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 -all".to_string()],
        );

        let engine = engine_with(resolver);
        let decision = engine
            .process(tx(
                "192.0.2.5",
                Some("alice@example.com"),
                Some("mx.example.com"),
                Some("bob@test.tld"),
            ))
            .await;

        assert_eq!(decision.action, Action::Fail);
        let ticket = decision.ticket.unwrap();

        // The auto-complaint charged the host token
        let auto = engine
            .reputation
            .get(".mx.example.com")
            .await
            .unwrap()
            .complaints;
        assert!(auto >= 1);

        // The publishing domain is charged despite the missing PASS
        let domain_auto = engine
            .reputation
            .get("@example.com")
            .await
            .unwrap()
            .complaints;
        assert!(domain_auto >= 1);

        // The recipient's own SPAM report still lands
        let reply = engine.process_spam(&ticket).await.unwrap();
        assert!(reply.starts_with("OK "));
        let after = engine
            .reputation
            .get(".mx.example.com")
            .await
            .unwrap()
            .complaints;
        assert_eq!(after, auto + 1);
        let domain_after = engine
            .reputation
            .get("@example.com")
            .await
            .unwrap()
            .complaints;
        assert_eq!(domain_after, domain_auto + 1);
    }

    #[tokio::test]
    async fn test_generic_rdns_without_sender_blocks_ip() {
        let ip: IpAddr = "203.0.113.7".parse().unwrap();
        let mut resolver = StaticResolver::new();
        resolver
            .ptr
            .insert(ip, vec!["client-1-2-3-4.dyn.isp.tld".to_string()]);
        resolver.a.insert(
            "client-1-2-3-4.dyn.isp.tld".to_string(),
            vec!["203.0.113.7".parse().unwrap()],
        );

        let engine = engine_with(resolver);
        engine
            .lists
            .generic
            .add(r"REGEX=^client[0-9.-]+\.dyn\.")
            .await
            .unwrap();

        let decision = engine
            .process(tx("203.0.113.7", None, None, Some("bob@test.tld")))
            .await;

        assert_eq!(decision.action, Action::Invalid);
        assert!(engine.lists.block.matches_ip(ip).await);
    }

    #[tokio::test]
    async fn test_white_overrides_block_and_clears_it() {
        let engine = engine_with(scenario_resolver());
        engine.lists.block.add("192.0.2.5").await.unwrap();
        engine.lists.white.add(".mx.example.com").await.unwrap();

        let decision = engine
            .process(tx(
                "192.0.2.5",
                Some("alice@example.com"),
                Some("mx.example.com"),
                None,
            ))
            .await;

        assert_eq!(decision.action, Action::Pass);
        // The false-positive block entry was removed
        assert!(!engine.lists.block.matches_ip("192.0.2.5".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_block_list_rejects_with_unblock_url() {
        let mut config = Config::default();
        config.policy.unblock_url = Some("https://guard.example/unblock/".to_string());
        let (engine, _rx) = Engine::new(
            config,
            Arc::new(scenario_resolver()),
            None,
            None,
        );

        engine.lists.block.add("@example.com").await.unwrap();

        let decision = engine
            .process(tx(
                "192.0.2.5",
                Some("alice@example.com"),
                Some("mx.example.com"),
                None,
            ))
            .await;

        assert_eq!(decision.action, Action::Blocked);
        assert!(decision
            .message
            .unwrap()
            .starts_with("https://guard.example/unblock/"));
    }

    #[tokio::test]
    async fn test_reserved_sender_domain_invalid() {
        let engine = engine_with(scenario_resolver());
        let decision = engine
            .process(tx(
                "192.0.2.5",
                Some("root@server.local"),
                Some("mx.example.com"),
                None,
            ))
            .await;
        assert_eq!(decision.action, Action::Invalid);
    }

    #[tokio::test]
    async fn test_lan_peer_short_circuits() {
        let engine = engine_with(StaticResolver::new());
        let decision = engine
            .process(tx("10.0.0.7", Some("a@b.c"), None, None))
            .await;
        assert_eq!(decision.action, Action::Lan);
        assert_eq!(decision.ticket, None);
    }

    #[tokio::test]
    async fn test_trap_recipient_discards() {
        let engine = engine_with(scenario_resolver());
        engine.lists.trap.add("@honeypot.tld").await.unwrap();

        let decision = engine
            .process(tx(
                "192.0.2.5",
                Some("alice@example.com"),
                Some("mx.example.com"),
                Some("victim@honeypot.tld"),
            ))
            .await;

        assert_eq!(decision.action, Action::SpamTrap);
        assert!(decision.ticket.is_some());
    }

    #[tokio::test]
    async fn test_softfail_greylists_then_flood_cap_blocks() {
        let mut resolver = scenario_resolver();
        resolver.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 ~all".to_string()],
        );
        // Flood thresholds off so the rapid-fire test calls exercise the
        // flow counter instead of the flood rule
        let mut config = Config::default();
        config.reputation.flood_ip_secs = 0.0;
        config.reputation.flood_sender_secs = 0.0;
        config.reputation.flood_helo_secs = 0.0;
        let (engine, _rx) = Engine::new(config, Arc::new(resolver), None, None);

        let transaction = tx(
            "192.0.2.5",
            Some("alice@example.com"),
            Some("mx.example.com"),
            Some("bob@test.tld"),
        );

        let decision = engine.process(transaction.clone()).await;
        assert_eq!(decision.action, Action::Greylist);

        // Hammering the same flow past the retry bound escalates
        let bound = engine.defer.flood_max_retry();
        let mut last = Action::Greylist;
        for _ in 0..=bound {
            last = engine.process(transaction.clone()).await.action;
        }
        assert_eq!(last, Action::Blocked);
    }

    #[tokio::test]
    async fn test_blacklisted_token_gets_listed() {
        let engine = engine_with(scenario_resolver());

        // Drive the sender domain to BLACK
        let token = Token::domain("example.com");
        for _ in 0..5 {
            engine.reputation.add_spam(&token).await;
        }
        assert_eq!(engine.reputation.status(&token).await, Status::Black);

        let decision = engine
            .process(tx(
                "192.0.2.5",
                Some("alice@example.com"),
                Some("mx.example.com"),
                Some("bob@test.tld"),
            ))
            .await;
        assert_eq!(decision.action, Action::Listed);
        assert!(decision.ticket.is_some());
    }

    #[tokio::test]
    async fn test_blocked_reputation_rejects() {
        let engine = engine_with(scenario_resolver());

        let token = Token::domain("example.com");
        for _ in 0..20 {
            engine.reputation.add_spam(&token).await;
        }
        assert_eq!(engine.reputation.status(&token).await, Status::Block);

        let decision = engine
            .process(tx(
                "192.0.2.5",
                Some("alice@example.com"),
                Some("mx.example.com"),
                None,
            ))
            .await;
        assert_eq!(decision.action, Action::Blocked);
    }

    #[test]
    fn test_valid_sender() {
        assert!(valid_sender("alice@example.com"));
        assert!(valid_sender("a.b-c@mail.example.co.uk"));
        assert!(!valid_sender("no-at-sign"));
        assert!(!valid_sender("x@nodot"));
        assert!(!valid_sender("x@example.local"));
        assert!(!valid_sender("x@server.test"));
        assert!(!valid_sender("x@192.0.2.5"));
        assert!(!valid_sender("@example.com"));
    }
}
