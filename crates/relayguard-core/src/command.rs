//! Text command protocol
//!
//! Line-oriented TCP protocol the relays and the CLI client speak:
//!
//! ```text
//! SPF '<ip>' '<sender>' '<helo>' '<recipient>'
//! CHECK <ip> <sender> <helo> <recipient>
//! SPAM <ticket>
//! HAM <ticket>
//! REFRESH <domain>
//! ```

use crate::engine::Engine;
use relayguard_common::Transaction;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// The command protocol server
pub struct CommandServer {
    engine: Arc<Engine>,
}

impl CommandServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Accept loop, one task per connection, capped by the connection
    /// semaphore
    pub async fn run(&self) -> anyhow::Result<()> {
        let bind = &self.engine.config.server.command_bind;
        let listener = TcpListener::bind(bind).await?;
        info!(bind = %bind, "Command protocol listening");

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
                    debug!(peer = %peer, "Command session ended: {}", e);
                }
                drop(permit);
            });
        }
    }
}

async fn handle_connection(engine: Arc<Engine>, stream: TcpStream) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if line.trim().eq_ignore_ascii_case("QUIT") {
            break;
        }

        let mut reply = handle_line(&engine, &line).await;
        reply.push('\n');
        write_half.write_all(reply.as_bytes()).await?;
    }

    Ok(())
}

/// Dispatch one protocol line to the engine
pub async fn handle_line(engine: &Arc<Engine>, line: &str) -> String {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    match verb.to_ascii_uppercase().as_str() {
        "SPF" => {
            let args = quoted_args(rest);
            if args.len() != 4 {
                return "ERROR: QUERY".to_string();
            }
            let Ok(ip) = args[0].parse() else {
                return "INVALID".to_string();
            };
            let tx = Transaction::new(
                ip,
                Some(args[1].clone()),
                Some(args[2].clone()),
                Some(args[3].clone()),
            );
            engine.process(tx).await.reply_line()
        }

        "CHECK" => {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.is_empty() {
                return "ERROR: QUERY".to_string();
            }
            let Ok(ip) = fields[0].trim_matches('\'').parse() else {
                return "INVALID".to_string();
            };
            let tx = Transaction::new(
                ip,
                fields.get(1).map(|s| s.to_string()),
                fields.get(2).map(|s| s.to_string()),
                fields.get(3).map(|s| s.to_string()),
            );
            engine.check(tx).await
        }

        "SPAM" => match engine.process_spam(rest).await {
            Ok(reply) => reply,
            Err(e) => e.protocol_reply(),
        },

        "HAM" => match engine.process_ham(rest).await {
            Ok(reply) => reply,
            Err(e) => e.protocol_reply(),
        },

        "REFRESH" => {
            if rest.is_empty() {
                return "ERROR: QUERY".to_string();
            }
            engine.process_refresh(rest).await
        }

        _ => {
            error!(verb = %verb, "Unknown command");
            "ERROR: UNKNOWN COMMAND".to_string()
        }
    }
}

/// Extract the `'...'` quoted arguments of an SPF command
fn quoted_args(rest: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut inside = false;

    for c in rest.chars() {
        match (c, inside) {
            ('\'', false) => inside = true,
            ('\'', true) => {
                args.push(std::mem::take(&mut current));
                inside = false;
            }
            (_, true) => current.push(c),
            (_, false) => {}
        }
    }

    args
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

    #[test]
    fn test_quoted_args() {
        assert_eq!(
            quoted_args("'192.0.2.5' 'alice@example.com' 'mx.example.com' 'bob@test.tld'"),
            vec![
                "192.0.2.5",
                "alice@example.com",
                "mx.example.com",
                "bob@test.tld"
            ]
        );
        assert_eq!(quoted_args("'a' ''"), vec!["a", ""]);
        assert_eq!(quoted_args("no quotes"), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_spf_verb() {
        let engine = engine();
        let reply = handle_line(
            &engine,
            "SPF '192.0.2.5' 'alice@example.com' 'mx.example.com' 'bob@test.tld'",
        )
        .await;
        assert!(reply.starts_with("PASS "), "got: {}", reply);
    }

    #[tokio::test]
    async fn test_spam_and_ham_verbs() {
        let engine = engine();
        let reply = handle_line(
            &engine,
            "SPF '192.0.2.5' 'alice@example.com' 'mx.example.com' 'bob@test.tld'",
        )
        .await;
        let ticket = reply.split(' ').nth(1).unwrap().to_string();

        let reply = handle_line(&engine, &format!("SPAM {}", ticket)).await;
        assert!(reply.starts_with("OK "));

        let reply = handle_line(&engine, &format!("SPAM {}", ticket)).await;
        assert_eq!(reply, "DUPLICATE COMPLAIN");

        let reply = handle_line(&engine, &format!("HAM {}", ticket)).await;
        assert!(reply.starts_with("OK "));

        let reply = handle_line(&engine, "SPAM garbage").await;
        assert_eq!(reply, "ERROR: TICKET UNDECODABLE");
    }

    #[tokio::test]
    async fn test_check_verb() {
        let engine = engine();
        let reply = handle_line(
            &engine,
            "CHECK 192.0.2.5 alice@example.com mx.example.com bob@test.tld",
        )
        .await;
        assert!(reply.contains("SPF: PASS"));
        assert!(reply.contains("Tokens:"));
    }

    #[tokio::test]
    async fn test_unknown_and_malformed() {
        let engine = engine();
        assert_eq!(
            handle_line(&engine, "NOSUCH thing").await,
            "ERROR: UNKNOWN COMMAND"
        );
        assert_eq!(handle_line(&engine, "SPF 'only-one'").await, "ERROR: QUERY");
        assert_eq!(handle_line(&engine, "REFRESH").await, "ERROR: QUERY");
    }
}
