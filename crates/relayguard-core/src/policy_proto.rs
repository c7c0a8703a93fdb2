//! Postfix policy-server protocol
//!
//! Postfix sends `name=value` attribute lines terminated by an empty
//! line and expects a single `action=...` reply, also terminated by an
//! empty line. One connection carries many requests.

use crate::engine::Engine;
use crate::net;
use crate::pipeline::Decision;
use relayguard_common::{Action, Transaction};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// The policy protocol server
pub struct PolicyServer {
    engine: Arc<Engine>,
}

impl PolicyServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let bind = &self.engine.config.server.policy_bind;
        let listener = TcpListener::bind(bind).await?;
        info!(bind = %bind, "Policy protocol listening");

        let semaphore = Arc::new(Semaphore::new(self.engine.config.server.max_connections));

        loop {
            let (stream, peer) = listener.accept().await?;

            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(peer = %peer, "TOO MANY CONNECTIONS");
                    continue;
                }
            };

            let engine = self.engine.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(engine, stream).await {
                    debug!(peer = %peer, "Policy session ended: {}", e);
                }
                drop(permit);
            });
        }
    }
}

async fn handle_connection(engine: Arc<Engine>, stream: TcpStream) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let mut attrs: HashMap<String, String> = HashMap::new();

    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            if attrs.is_empty() {
                continue;
            }
            let reply = handle_request(&engine, &attrs).await;
            write_half
                .write_all(format!("action={}\n\n", reply).as_bytes())
                .await?;
            attrs.clear();
            continue;
        }

        if let Some((name, value)) = line.split_once('=') {
            attrs.insert(name.to_string(), value.to_string());
        }
    }

    Ok(())
}

/// Decide one attribute block
pub async fn handle_request(engine: &Arc<Engine>, attrs: &HashMap<String, String>) -> String {
    let Some(ip) = attrs
        .get("client_address")
        .and_then(|a| a.parse::<IpAddr>().ok())
    else {
        return "DUNNO".to_string();
    };

    // Non-public peers are the relay's own business
    if net::is_lan(ip) {
        return "DUNNO".to_string();
    }

    let tx = Transaction::new(
        ip,
        attrs.get("sender").cloned(),
        attrs.get("helo_name").cloned(),
        attrs.get("recipient").cloned(),
    );

    let decision = engine.process(tx).await;
    action_reply(&decision)
}

/// Map a decision onto a Postfix access reply
fn action_reply(decision: &Decision) -> String {
    let detail = decision
        .message
        .clone()
        .or_else(|| decision.ticket.clone())
        .unwrap_or_default();

    match decision.action {
        Action::Pass | Action::None | Action::Neutral | Action::SoftFail => {
            format!("PREPEND Received-SPFBL: {} {}", decision.action, detail)
        }
        Action::Fail => format!(
            "554 5.7.1 SPF check failed; this address is not authorized to send mail as the sender {}",
            detail
        ),
        Action::Blocked => format!("554 5.7.1 you are permanently blocked {}", detail),
        Action::Nxdomain => "554 5.7.1 sender has non-existent internet domain".to_string(),
        Action::Invalid => "554 5.7.1 invalid identification".to_string(),
        Action::SpamTrap => "DISCARD spam trap hit".to_string(),
        Action::Listed => format!("451 4.7.2 you are temporarily listed {}", detail),
        Action::Greylist => "451 4.7.1 greylisted, try again later".to_string(),
        Action::TempError | Action::PermError => {
            "451 4.7.1 temporary failure, try again later".to_string()
        }
        Action::Lan => "DUNNO".to_string(),
    }
    .trim_end()
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::testing::StaticResolver;
    use relayguard_common::Config;

    fn engine() -> Arc<Engine> {
        let mut resolver = StaticResolver::new();
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
        Engine::new(Config::default(), Arc::new(resolver), None, None).0
    }

    fn attrs(ip: &str, sender: &str, helo: &str, rcpt: &str) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        attrs.insert("request".to_string(), "smtpd_access_policy".to_string());
        attrs.insert("client_address".to_string(), ip.to_string());
        attrs.insert("sender".to_string(), sender.to_string());
        attrs.insert("helo_name".to_string(), helo.to_string());
        attrs.insert("recipient".to_string(), rcpt.to_string());
        attrs
    }

    #[tokio::test]
    async fn test_pass_prepends_header() {
        let engine = engine();
        let reply = handle_request(
            &engine,
            &attrs("192.0.2.5", "alice@example.com", "mx.example.com", "bob@test.tld"),
        )
        .await;
        assert!(reply.starts_with("PREPEND Received-SPFBL: PASS "), "got: {}", reply);
    }

    #[tokio::test]
    async fn test_fail_rejects_with_554() {
        let engine = engine();
        let reply = handle_request(
            &engine,
            &attrs("198.51.100.9", "alice@example.com", "mx.example.com", "bob@test.tld"),
        )
        .await;
        assert!(reply.starts_with("554 5.7.1 "), "got: {}", reply);
    }

    #[tokio::test]
    async fn test_lan_short_circuits_to_dunno() {
        let engine = engine();
        let reply = handle_request(
            &engine,
            &attrs("192.168.1.10", "a@b.example", "x", "c@d.example"),
        )
        .await;
        assert_eq!(reply, "DUNNO");
    }

    #[tokio::test]
    async fn test_missing_client_address_is_dunno() {
        let engine = engine();
        let reply = handle_request(&engine, &HashMap::new()).await;
        assert_eq!(reply, "DUNNO");
    }

    #[tokio::test]
    async fn test_trap_discards() {
        let engine = engine();
        engine.lists.trap.add("@honeypot.tld").await.unwrap();

        let reply = handle_request(
            &engine,
            &attrs(
                "192.0.2.5",
                "alice@example.com",
                "mx.example.com",
                "victim@honeypot.tld",
            ),
        )
        .await;
        assert!(reply.starts_with("DISCARD"), "got: {}", reply);
    }
}
