//! Peer gossip
//!
//! Reputation mutations are pushed to every configured peer as one JSON
//! datagram each: `(token, distribution|null)`. Incoming deltas are
//! applied with a per-peer weight derived from observed agreement, so a
//! peer whose view keeps contradicting ours moves our counters less.
//! Losses are tolerated; convergence is eventual.

use crate::reputation::{Distribution, ReputationStore};
use relayguard_common::Token;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Minimum weight a disagreeing peer retains
const WEIGHT_FLOOR: f64 = 0.25;

/// One reputation mutation on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub token: String,
    pub distribution: Option<Distribution>,
}

#[derive(Debug, Default, Clone)]
struct PeerStats {
    agreed: u64,
    total: u64,
}

impl PeerStats {
    fn weight(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.agreed as f64 / self.total as f64).max(WEIGHT_FLOOR)
    }
}

/// Gossip dispatcher and receiver
pub struct PeerGossip {
    socket: Arc<UdpSocket>,
    peers: Vec<SocketAddr>,
    reputation: Arc<ReputationStore>,
    stats: RwLock<HashMap<SocketAddr, PeerStats>>,
}

impl PeerGossip {
    /// Bind the gossip socket and resolve the peer set
    pub async fn new(
        bind: &str,
        peers: &[String],
        reputation: Arc<ReputationStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind).await?;
        let peers = peers
            .iter()
            .filter_map(|p| match p.parse() {
                Ok(addr) => Some(addr),
                Err(_) => {
                    warn!(peer = %p, "Ignoring unparseable peer address");
                    None
                }
            })
            .collect();

        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            peers,
            reputation,
            stats: RwLock::new(HashMap::new()),
        }))
    }

    /// Drain the mutation channel, pushing each update to every peer.
    /// Send failures are logged and forgotten; later events reconverge.
    pub async fn run_dispatch(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PeerUpdate>) {
        while let Some(update) = rx.recv().await {
            let payload = match serde_json::to_vec(&update) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to serialise peer update: {}", e);
                    continue;
                }
            };

            for peer in &self.peers {
                if let Err(e) = self.socket.send_to(&payload, peer).await {
                    warn!(peer = %peer, "Peer send failed: {}", e);
                }
            }
        }
    }

    /// Receive loop applying peer deltas into the local store
    pub async fn run_receiver(self: Arc<Self>) {
        let mut buf = vec![0u8; 8192];
        loop {
            let (len, source) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Gossip receive failed: {}", e);
                    continue;
                }
            };

            let update: PeerUpdate = match serde_json::from_slice(&buf[..len]) {
                Ok(update) => update,
                Err(e) => {
                    debug!(source = %source, "Discarding unparseable gossip: {}", e);
                    continue;
                }
            };

            self.apply(source, update).await;
        }
    }

    /// Apply one delta, updating the sender's agreement record
    pub async fn apply(&self, source: SocketAddr, update: PeerUpdate) {
        let is_ip = Token::from_str(&update.token)
            .map(|t| t.is_ip())
            .unwrap_or(false);

        let weight = {
            let mut stats = self.stats.write().await;
            let entry = stats.entry(source).or_default();
            entry.total += 1;

            // Agreement: the peer's derived status matches what we
            // already believed about the token
            if let Some(remote) = &update.distribution {
                if let Some(ours) = self.reputation.get(&update.token).await {
                    if ours.status == remote.status {
                        entry.agreed += 1;
                    }
                } else if remote.complaints == 0 {
                    entry.agreed += 1;
                }
            } else {
                entry.agreed += 1;
            }

            entry.weight()
        };

        debug!(source = %source, token = %update.token, weight, "Applying peer delta");
        self.reputation
            .merge_remote(&update.token, update.distribution, weight, is_ip)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayguard_common::config::ReputationConfig;

    async fn gossip() -> Arc<PeerGossip> {
        let reputation = Arc::new(ReputationStore::new(ReputationConfig::default()));
        PeerGossip::new("127.0.0.1:0", &[], reputation).await.unwrap()
    }

    #[tokio::test]
    async fn test_apply_creates_distribution() {
        let gossip = gossip().await;
        let source: SocketAddr = "203.0.113.10:9878".parse().unwrap();

        gossip
            .apply(
                source,
                PeerUpdate {
                    token: "@example.com".to_string(),
                    distribution: Some(Distribution {
                        complaints: 4,
                        ..Default::default()
                    }),
                },
            )
            .await;

        let dist = gossip.reputation.get("@example.com").await.unwrap();
        assert_eq!(dist.complaints, 4);
    }

    #[tokio::test]
    async fn test_apply_drop_removes() {
        let gossip = gossip().await;
        let source: SocketAddr = "203.0.113.10:9878".parse().unwrap();
        let token: Token = "@example.com".parse().unwrap();

        gossip.reputation.add_spam(&token).await;
        gossip
            .apply(
                source,
                PeerUpdate {
                    token: "@example.com".to_string(),
                    distribution: None,
                },
            )
            .await;

        assert_eq!(gossip.reputation.get("@example.com").await, None);
    }

    #[tokio::test]
    async fn test_disagreeing_peer_loses_weight() {
        let gossip = gossip().await;
        let source: SocketAddr = "203.0.113.10:9878".parse().unwrap();

        // A stream of contradicting updates drives the weight to the
        // floor: each claims many complaints about tokens we see as
        // clean and already hold a different status for
        for i in 0..8 {
            let token: Token = format!("@spamview{}.example", i).parse().unwrap();
            gossip.reputation.add_spam(&token).await;
            gossip
                .apply(
                    source,
                    PeerUpdate {
                        token: token.to_string(),
                        distribution: Some(Distribution {
                            complaints: 100,
                            status: relayguard_common::Status::Block,
                            ..Default::default()
                        }),
                    },
                )
                .await;
        }

        let stats = gossip.stats.read().await;
        let weight = stats.get(&source).unwrap().weight();
        assert!(weight < 1.0);
    }
}
