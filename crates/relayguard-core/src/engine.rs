//! The engine value
//!
//! All process-wide caches live here, constructed once at start-up and
//! handed to every protocol handler as an `Arc`. Persistence, expiry
//! sweeps, and complaint handling are methods on the engine; the
//! decision pipeline itself lives in [`crate::pipeline`].

use crate::defer::DeferralController;
use crate::dnslist::abuse::AbuseThrottle;
use crate::ledger::{ComplaintLedger, ComplaintOutcome, RetractOutcome};
use crate::lists::PolicyLists;
use crate::peers::PeerUpdate;
use crate::pipeline::{self, Decision};
use crate::reputation::ReputationStore;
use crate::resolver::Resolver;
use crate::spf::{SpfEvaluator, SpfRegistry};
use crate::ticket::TicketCodec;
use crate::tokens::{self, TokenExpander};
use relayguard_common::{Action, Config, Result, Token, Transaction};
use relayguard_storage::{AnalysisLog, SnapshotStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// The assembled engine
pub struct Engine {
    pub config: Config,
    pub resolver: Arc<dyn Resolver>,
    pub registry: Arc<SpfRegistry>,
    pub evaluator: SpfEvaluator,
    pub expander: TokenExpander,
    pub lists: PolicyLists,
    pub reputation: Arc<ReputationStore>,
    pub ledger: ComplaintLedger,
    pub ticket: TicketCodec,
    pub defer: DeferralController,
    pub abuse: AbuseThrottle,

    /// Abuse contacts for the DNSAL zone, keyed by domain or address,
    /// fed by the external WHOIS collaborator
    pub abuse_contacts: RwLock<HashMap<String, String>>,
    contacts_dirty: AtomicBool,

    gossip_tx: mpsc::UnboundedSender<PeerUpdate>,
    store: Option<SnapshotStore>,
    analysis: Option<AnalysisLog>,
}

impl Engine {
    /// Assemble an engine over an explicit resolver; the second return
    /// is the gossip channel the dispatcher drains
    pub fn new(
        config: Config,
        resolver: Arc<dyn Resolver>,
        store: Option<SnapshotStore>,
        analysis: Option<AnalysisLog>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerUpdate>) {
        let (gossip_tx, gossip_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(SpfRegistry::new(resolver.clone(), config.spf.clone()));
        let evaluator = SpfEvaluator::new(registry.clone(), resolver.clone(), config.spf.clone());
        let expander = TokenExpander::new(resolver.clone());
        let reputation = Arc::new(ReputationStore::new(config.reputation.clone()));
        let ticket = TicketCodec::new(&config.ticket.secret);
        let defer = DeferralController::new(config.defer.clone());

        let engine = Arc::new(Self {
            resolver,
            registry,
            evaluator,
            expander,
            lists: PolicyLists::new(),
            reputation,
            ledger: ComplaintLedger::new(),
            ticket,
            defer,
            abuse: AbuseThrottle::new(),
            abuse_contacts: RwLock::new(HashMap::new()),
            contacts_dirty: AtomicBool::new(false),
            gossip_tx,
            store,
            analysis,
            config,
        });

        (engine, gossip_rx)
    }

    /// Run the decision pipeline under the request budget. A timeout or
    /// a panic inside the pipeline reports TEMPERROR; the request is
    /// dropped without touching any counter twice.
    pub async fn process(self: &Arc<Self>, tx: Transaction) -> Decision {
        let budget = Duration::from_secs(self.config.server.request_budget_secs);
        let engine = self.clone();
        let handle = tokio::spawn(async move { pipeline::decide(&engine, &tx).await });

        match tokio::time::timeout(budget, handle).await {
            Ok(Ok(decision)) => {
                self.record_analysis(&decision).await;
                decision
            }
            Ok(Err(e)) => {
                error!("Decision pipeline panicked: {}", e);
                Decision::bare(Action::TempError)
            }
            Err(_) => {
                warn!("Decision request exceeded its {}s budget", budget.as_secs());
                Decision::bare(Action::TempError)
            }
        }
    }

    async fn record_analysis(&self, decision: &Decision) {
        if let Some(analysis) = &self.analysis {
            if let Some(token) = &decision.subject {
                if let Err(e) = analysis.append(token, &decision.action.to_string()).await {
                    warn!("Analysis append failed: {}", e);
                }
            }
        }
    }

    /// Issue a ticket over a token set and remember its token charge
    pub fn issue_ticket(&self, tokens: &[Token]) -> (i64, String) {
        self.ticket.issue(tokens)
    }

    /// Charge one complaint to every reputable token in the expanded
    /// set. Reject-path auto-complaints use this directly, without a
    /// ledger entry, so the ticket stays available for an explicit
    /// `SPAM` report by the recipient.
    pub(crate) async fn charge(&self, tokens: &[Token]) {
        for token in tokens::expand(tokens) {
            if token.is_reputable() && self.reputation.add_spam(&token).await {
                self.push_gossip(&token).await;
            }
        }
    }

    async fn credit(&self, tokens: &[Token]) {
        for token in tokens::expand(tokens) {
            if token.is_reputable() && self.reputation.remove_spam(&token).await {
                self.push_gossip(&token).await;
            }
        }
    }

    /// Push a token's current distribution to the peers
    pub async fn push_gossip(&self, token: &Token) {
        let key = token.to_string();
        let update = PeerUpdate {
            distribution: self.reputation.get(&key).await,
            token: key,
        };
        if self.gossip_tx.send(update).is_err() {
            debug!("Gossip channel closed, dropping update");
        }
    }

    /// `SPAM <ticket>`: register a complaint
    pub async fn process_spam(&self, ticket: &str) -> Result<String> {
        let (timestamp, tokens) = self.ticket.decode(ticket)?;

        match self.ledger.add(timestamp, tokens.clone()).await {
            ComplaintOutcome::Added(tokens) => {
                self.charge(&tokens).await;
                Ok(format!("OK {}", join_tokens(&tokens)))
            }
            ComplaintOutcome::Duplicate => Ok("DUPLICATE COMPLAIN".to_string()),
        }
    }

    /// `HAM <ticket>`: retract a complaint
    pub async fn process_ham(&self, ticket: &str) -> Result<String> {
        let (timestamp, _tokens) = self.ticket.decode(ticket)?;

        match self.ledger.remove(timestamp).await {
            RetractOutcome::Removed(tokens) => {
                self.credit(&tokens).await;
                Ok(format!("OK {}", join_tokens(&tokens)))
            }
            RetractOutcome::AlreadyRemoved => Ok("ALREADY REMOVED".to_string()),
        }
    }

    /// `REFRESH <domain>`
    pub async fn process_refresh(&self, domain: &str) -> String {
        match self.registry.refresh(domain).await {
            Ok(true) => "UPDATED".to_string(),
            Ok(false) => "NOT LOADED".to_string(),
            Err(e) => format!("ERROR: {}", e),
        }
    }

    /// Drop a token's reputation entirely, clear its Block entry, and
    /// tell the peers
    pub async fn drop_reputation(&self, token: &Token) {
        self.reputation.drop_token(token).await;
        self.lists.block.remove(&token.to_string()).await;
        self.push_gossip(token).await;
    }

    /// `CHECK`: the multi-line diagnostic
    pub async fn check(self: &Arc<Self>, tx: Transaction) -> String {
        let spf = self
            .evaluator
            .evaluate(tx.ip, tx.sender_domain(), tx.helo.as_deref())
            .await;

        let hints = pipeline::provider_hints(self, &tx).await;
        let derived = self
            .expander
            .derive(&tx, spf == crate::spf::SpfOutcome::Pass, hints)
            .await;
        let expanded = tokens::expand(&derived.tokens);

        let mut out = Vec::new();
        out.push(format!("SPF: {}", spf));
        out.push(format!(
            "Hostname: {}",
            derived.hostname.as_deref().unwrap_or("(none)")
        ));
        out.push("Tokens:".to_string());
        for token in &expanded {
            if token.is_reputable() {
                let status = self.reputation.status(token).await;
                let p = self.reputation.probability(&token.to_string()).await;
                out.push(format!("  {} {} {:.4}", token, status, p));
            } else {
                out.push(format!("  {}", token));
            }
        }
        if self.lists.white.matches_any(&expanded).await {
            out.push("White: matched".to_string());
        }
        if let Some(token) = self.lists.block.first_match(&expanded).await {
            out.push(format!("Block: {}", token));
        }
        out.join("\n")
    }

    // --- persistence ---------------------------------------------------

    /// Load every snapshot the store holds
    pub async fn load(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };

        if let Some(records) = store.load("spf.json").await? {
            let guesses = store.load("guess.json").await?.unwrap_or_default();
            self.registry.restore(records, guesses).await;
        }
        if let Some(distributions) = store.load("distribution.json").await? {
            self.reputation.restore(distributions).await;
        }
        if let Some(entries) = store.load("complain.json").await? {
            self.ledger.restore(entries).await;
        }
        if let Some(entries) = store.load("defer.json").await? {
            self.defer.restore(entries).await;
        }
        for (file, list) in self.lists.all() {
            if let Some(entries) = store.load(file).await? {
                list.restore(entries).await;
            }
        }
        if let Some(contacts) = store.load("abuse.contacts.json").await? {
            *self.abuse_contacts.write().await = contacts;
        }
        self.abuse
            .restore_lines(store.load_lines("dns.abuse.txt").await?)
            .await;

        info!("Snapshots loaded");
        Ok(())
    }

    /// Persist every dirty map; a failed write keeps its dirty flag so
    /// the next tick retries
    pub async fn save(&self) {
        let Some(store) = &self.store else {
            return;
        };

        if self.registry.take_dirty() {
            let (records, guesses) = self.registry.snapshot().await;
            if store.save("spf.json", &records).await.is_err()
                || store.save("guess.json", &guesses).await.is_err()
            {
                self.registry.mark_dirty();
            }
        }

        if self.reputation.take_dirty() {
            let snapshot = self.reputation.snapshot().await;
            if let Err(e) = store.save("distribution.json", &snapshot).await {
                warn!("Persisting distributions failed: {}", e);
                self.reputation.mark_dirty();
            }
        }

        if self.ledger.take_dirty() {
            let snapshot = self.ledger.snapshot().await;
            if let Err(e) = store.save("complain.json", &snapshot).await {
                warn!("Persisting ledger failed: {}", e);
                self.ledger.mark_dirty();
            }
        }

        if self.defer.take_dirty() {
            let snapshot = self.defer.snapshot().await;
            if let Err(e) = store.save("defer.json", &snapshot).await {
                warn!("Persisting deferrals failed: {}", e);
                self.defer.mark_dirty();
            }
        }

        for (file, list) in self.lists.all() {
            if list.take_dirty() {
                let entries = list.entries().await;
                if let Err(e) = store.save(file, &entries).await {
                    warn!(file = %file, "Persisting list failed: {}", e);
                    list.mark_dirty();
                }
            }
        }

        if self.contacts_dirty.swap(false, Ordering::Relaxed) {
            let contacts = self.abuse_contacts.read().await.clone();
            if let Err(e) = store.save("abuse.contacts.json", &contacts).await {
                warn!("Persisting abuse contacts failed: {}", e);
                self.contacts_dirty.store(true, Ordering::Relaxed);
            }
        }

        if self.abuse.take_dirty() {
            let lines = self.abuse.snapshot_lines().await;
            if let Err(e) = store.save_lines("dns.abuse.txt", &lines).await {
                warn!("Persisting abuse counters failed: {}", e);
                self.abuse.mark_dirty();
            }
        }
    }

    /// Record an abuse contact for the DNSAL zone
    pub async fn set_abuse_contact(&self, key: &str, contact: &str) {
        let mut contacts = self.abuse_contacts.write().await;
        contacts.insert(key.to_lowercase(), contact.to_string());
        self.contacts_dirty.store(true, Ordering::Relaxed);
    }

    /// Hourly housekeeping: expiries across every store
    pub async fn sweep(&self) {
        self.ledger.sweep().await;
        self.reputation.sweep().await;
        self.defer.sweep().await;
        self.abuse.sweep().await;
        self.registry.evict_cycle().await;
    }

    /// One background SPF refresh step
    pub async fn refresh_cycle(&self) {
        self.registry.refresh_cycle().await;
    }
}

fn join_tokens(tokens: &[Token]) -> String {
    let mut parts: Vec<String> = tokens
        .iter()
        .filter(|t| t.is_reputable())
        .map(|t| t.to_string())
        .collect();
    parts.extend(
        tokens
            .iter()
            .filter(|t| matches!(t, Token::Recipient(_)))
            .map(|t| t.to_string()),
    );
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::testing::StaticResolver;
    use tempfile::TempDir;

    fn engine_with(
        resolver: StaticResolver,
    ) -> (Arc<Engine>, mpsc::UnboundedReceiver<PeerUpdate>) {
        Engine::new(Config::default(), Arc::new(resolver), None, None)
    }

    #[tokio::test]
    async fn test_spam_then_ham_roundtrip() {
        let (engine, mut gossip) = engine_with(StaticResolver::new());

        let tokens: Vec<Token> = vec![
            "192.0.2.5".parse().unwrap(),
            "@example.com".parse().unwrap(),
            ">bob@test.tld".parse().unwrap(),
        ];
        let (_, ticket) = engine.issue_ticket(&tokens);

        let reply = engine.process_spam(&ticket).await.unwrap();
        assert!(reply.starts_with("OK "));
        assert!(reply.contains("@example.com"));
        assert!(reply.ends_with(">bob@test.tld"));
        assert_eq!(
            engine.reputation.get("@example.com").await.unwrap().complaints,
            1
        );
        // The mutation went out to the peers
        assert!(gossip.try_recv().is_ok());

        // Second complaint for the same ticket is rejected
        let reply = engine.process_spam(&ticket).await.unwrap();
        assert_eq!(reply, "DUPLICATE COMPLAIN");
        assert_eq!(
            engine.reputation.get("@example.com").await.unwrap().complaints,
            1
        );

        // Ham reverses exactly once
        let reply = engine.process_ham(&ticket).await.unwrap();
        assert!(reply.starts_with("OK "));
        assert_eq!(
            engine.reputation.get("@example.com").await.unwrap().complaints,
            0
        );
        let reply = engine.process_ham(&ticket).await.unwrap();
        assert_eq!(reply, "ALREADY REMOVED");
    }

    #[tokio::test]
    async fn test_expired_ticket_rejected_without_state_change() {
        let (engine, _gossip) = engine_with(StaticResolver::new());

        let tokens: Vec<Token> = vec!["@example.com".parse().unwrap()];
        let old = chrono::Utc::now().timestamp_micros() - 6 * 24 * 3600 * 1_000_000;
        let ticket = engine.ticket.encode(old, &tokens);

        let err = engine.process_spam(&ticket).await.unwrap_err();
        assert_eq!(err.protocol_reply(), "ERROR: TICKET EXPIRED");
        assert_eq!(engine.reputation.get("@example.com").await, None);
        assert!(engine.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn test_refresh_replies() {
        let mut resolver = StaticResolver::new();
        resolver.txt.insert(
            "example.com".to_string(),
            vec!["v=spf1 -all".to_string()],
        );
        resolver
            .a
            .insert("example.com".to_string(), vec!["192.0.2.1".parse().unwrap()]);
        let (engine, _gossip) = engine_with(resolver);

        assert_eq!(engine.process_refresh("example.com").await, "NOT LOADED");
        engine.registry.lookup("example.com").await.unwrap();
        assert_eq!(engine.process_refresh("example.com").await, "UPDATED");
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path()).unwrap();
        let (engine, _gossip) = Engine::new(
            Config::default(),
            Arc::new(StaticResolver::new()),
            Some(store),
            None,
        );

        let token: Token = "@example.com".parse().unwrap();
        engine.reputation.add_spam(&token).await;
        engine.lists.block.add("192.0.2.5").await.unwrap();
        engine.save().await;

        let store = SnapshotStore::new(dir.path()).unwrap();
        let (restored, _gossip) = Engine::new(
            Config::default(),
            Arc::new(StaticResolver::new()),
            Some(store),
            None,
        );
        restored.load().await.unwrap();

        assert_eq!(
            restored.reputation.get("@example.com").await.unwrap().complaints,
            1
        );
        assert!(restored
            .lists
            .block
            .matches_ip("192.0.2.5".parse().unwrap())
            .await);
    }

    #[tokio::test]
    async fn test_drop_clears_block_and_gossips() {
        let (engine, mut gossip) = engine_with(StaticResolver::new());
        let token: Token = "192.0.2.5".parse().unwrap();

        engine.reputation.add_spam(&token).await;
        engine.lists.block.add("192.0.2.5").await.unwrap();

        engine.drop_reputation(&token).await;

        assert_eq!(engine.reputation.get("192.0.2.5").await, None);
        assert!(!engine.lists.block.matches_ip("192.0.2.5".parse().unwrap()).await);
        let update = gossip.try_recv().unwrap();
        assert_eq!(update.token, "192.0.2.5");
        assert!(update.distribution.is_none());
    }
}
