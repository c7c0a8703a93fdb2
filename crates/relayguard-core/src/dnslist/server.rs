//! UDP frontend for the DNS lists

use super::wire::{self, Answer, Rcode, QTYPE_A, QTYPE_ANY, QTYPE_TXT};
use crate::engine::Engine;
use crate::net;
use relayguard_common::config::ZoneKind;
use relayguard_common::constants::{DNSLIST_TTL_HIGH, DNSLIST_TTL_LOW, DNSLIST_TTL_MEDIUM};
use relayguard_common::{Status, Token};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// File-name suffixes treated as executable signatures by the URIBL
const EXECUTABLE_SUFFIXES: &[&str] = &[".exe", ".scr", ".pif", ".bat", ".cmd", ".js", ".vbs"];

/// One computed list answer
struct ListAnswer {
    code: Ipv4Addr,
    ttl: u32,
    reason: String,
}

impl ListAnswer {
    fn new(code: [u8; 4], ttl: u32, reason: impl Into<String>) -> Self {
        Self {
            code: Ipv4Addr::from(code),
            ttl,
            reason: reason.into(),
        }
    }
}

/// The UDP DNS-list server
pub struct DnslistServer {
    engine: Arc<Engine>,
    zones: Vec<(String, ZoneKind)>,
    socket: Arc<UdpSocket>,
    pool: Arc<Semaphore>,
}

impl DnslistServer {
    /// Bind the frontend socket from the engine's configuration
    pub async fn bind(engine: Arc<Engine>) -> anyhow::Result<Self> {
        let config = &engine.config.dnslist;
        let socket = UdpSocket::bind(&config.bind).await?;
        info!(bind = %config.bind, zones = config.zones.len(), "DNS-list frontend listening");

        let zones = config
            .zones
            .iter()
            .map(|z| (z.zone.trim_matches('.').to_lowercase(), z.kind))
            .collect();
        let max_connections = config.max_connections;

        Ok(Self {
            engine,
            zones,
            socket: Arc::new(socket),
            pool: Arc::new(Semaphore::new(max_connections)),
        })
    }

    /// Receive loop; one task per packet, bounded by the pool
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 1024];
        loop {
            let (len, source) = self.socket.recv_from(&mut buf).await?;
            let packet = buf[..len].to_vec();

            let permit = match self.pool.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(source = %source, "TOO MANY CONNECTIONS");
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                let response = respond(&server.engine, &server.zones, &packet, source.ip()).await;
                if let Err(e) = server.socket.send_to(&response, source).await {
                    debug!(source = %source, "DNS-list send failed: {}", e);
                }
                drop(permit);
            });
        }
    }
}

/// Compute the response for one packet. Refused, malformed, and
/// off-zone queries all count as abuse events for the source.
pub async fn respond(
    engine: &Arc<Engine>,
    zones: &[(String, ZoneKind)],
    packet: &[u8],
    source: IpAddr,
) -> Vec<u8> {
    if engine.abuse.is_banned(source).await {
        engine.abuse.register(source).await;
        return wire::build_error_for_raw(packet, Rcode::Refused);
    }

    let query = match wire::parse_query(packet) {
        Ok(query) => query,
        Err(e) => {
            debug!(source = %source, "Malformed DNS-list query: {}", e);
            engine.abuse.register(source).await;
            return wire::build_error_for_raw(packet, Rcode::FormErr);
        }
    };

    let Some((zone, kind, sub)) = match_zone(zones, &query.name) else {
        engine.abuse.register(source).await;
        return wire::build_response(&query, Rcode::NotAuth, &[]);
    };
    debug!(zone = %zone, kind = ?kind, sub = %sub, "DNS-list query");

    let answer = match kind {
        ZoneKind::Dnsbl => answer_dnsbl(engine, &sub).await,
        ZoneKind::Dnswl => answer_dnswl(engine, &sub).await,
        ZoneKind::Uribl => answer_uribl(engine, &sub).await,
        ZoneKind::Score => answer_score(engine, &sub).await,
        ZoneKind::Dnsal => answer_dnsal(engine, &sub).await,
    };

    match answer {
        Some(list_answer) => {
            let mut answers = Vec::new();
            if query.qtype == QTYPE_A || query.qtype == QTYPE_ANY {
                answers.push(Answer::A {
                    name: query.name.clone(),
                    addr: list_answer.code,
                    ttl: list_answer.ttl,
                });
            }
            if query.qtype == QTYPE_TXT || query.qtype == QTYPE_ANY {
                answers.push(Answer::Txt {
                    name: query.name.clone(),
                    text: list_answer.reason,
                    ttl: list_answer.ttl,
                });
            }
            wire::build_response(&query, Rcode::NoError, &answers)
        }
        None => wire::build_response(&query, Rcode::NxDomain, &[]),
    }
}

/// Resolve the queried name to its zone and the sub-name under it
fn match_zone<'a>(
    zones: &'a [(String, ZoneKind)],
    name: &str,
) -> Option<(&'a str, ZoneKind, String)> {
    for (zone, kind) in zones {
        if let Some(prefix) = name.strip_suffix(zone.as_str()) {
            // The zone must sit on a label boundary
            if let Some(sub) = prefix.strip_suffix('.') {
                if !sub.is_empty() {
                    return Some((zone, *kind, sub.to_string()));
                }
            }
        }
    }
    None
}

/// The token a sub-name stands for: reversed address labels or a host
fn sub_token(sub: &str) -> Token {
    let labels: Vec<&str> = sub.split('.').collect();
    match net::parse_reverse_labels(&labels) {
        Some(ip) => Token::Ip(ip),
        None => Token::host(sub),
    }
}

async fn answer_dnsbl(engine: &Arc<Engine>, sub: &str) -> Option<ListAnswer> {
    let token = sub_token(sub);
    let status = engine.reputation.status(&token).await;
    let blocked = engine.lists.block.matches_token(&token).await;

    if status == Status::Block || (blocked && status >= Status::Black) {
        return Some(ListAnswer::new(
            [127, 0, 0, 2],
            DNSLIST_TTL_HIGH,
            format!("{} is listed for sending spam", token),
        ));
    }
    if blocked {
        return Some(ListAnswer::new(
            [127, 0, 0, 3],
            DNSLIST_TTL_LOW,
            format!("{} is blocked by policy", token),
        ));
    }
    None
}

async fn answer_dnswl(engine: &Arc<Engine>, sub: &str) -> Option<ListAnswer> {
    let token = sub_token(sub);
    let tokens = [token.clone()];

    if engine.lists.provider.matches_any(&tokens).await {
        return Some(ListAnswer::new(
            [127, 0, 0, 2],
            DNSLIST_TTL_MEDIUM,
            format!("{} is a known good origin", token),
        ));
    }
    if engine.lists.ignore.matches_any(&tokens).await {
        return Some(ListAnswer::new(
            [127, 0, 0, 3],
            DNSLIST_TTL_LOW,
            format!("{} is ignored", token),
        ));
    }
    if engine.lists.white.matches_any(&tokens).await {
        return Some(ListAnswer::new(
            [127, 0, 0, 4],
            DNSLIST_TTL_MEDIUM,
            format!("{} is whitelisted", token),
        ));
    }
    None
}

async fn answer_uribl(engine: &Arc<Engine>, sub: &str) -> Option<ListAnswer> {
    let executable = EXECUTABLE_SUFFIXES.iter().any(|ext| sub.ends_with(ext));
    let matched = engine.lists.block.matches_host(sub).await
        || engine.lists.block.matches_regex(sub).await;

    if matched && executable {
        return Some(ListAnswer::new(
            [127, 0, 0, 3],
            DNSLIST_TTL_LOW,
            format!("{} carries a blocked executable signature", sub),
        ));
    }
    if matched {
        return Some(ListAnswer::new(
            [127, 0, 0, 2],
            DNSLIST_TTL_LOW,
            format!("{} matches a blocked address signature", sub),
        ));
    }
    None
}

async fn answer_score(engine: &Arc<Engine>, sub: &str) -> Option<ListAnswer> {
    let token = sub_token(sub);
    let p = engine.reputation.probability(&token.to_string()).await;
    let score = (100.0 - 100.0 * p).round().clamp(0.0, 100.0) as u8;

    Some(ListAnswer::new(
        [127, 0, 1, score],
        DNSLIST_TTL_LOW,
        format!("{} scores {} of 100", token, score),
    ))
}

async fn answer_dnsal(engine: &Arc<Engine>, sub: &str) -> Option<ListAnswer> {
    let token = sub_token(sub);
    let contacts = engine.abuse_contacts.read().await;

    // Exact key first, then the domain suffix walk for hostnames
    let mut key = match &token {
        Token::Ip(ip) => ip.to_string(),
        _ => sub.to_lowercase(),
    };
    loop {
        if let Some(contact) = contacts.get(&key) {
            return Some(ListAnswer::new(
                [127, 0, 0, 2],
                DNSLIST_TTL_LOW,
                contact.clone(),
            ));
        }
        match key.split_once('.') {
            Some((_, rest)) if rest.contains('.') => key = rest.to_string(),
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::testing::StaticResolver;
    use bytes::BufMut;
    use relayguard_common::Config;

    fn build_query(name: &str, qtype: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u16(0x2222);
        out.put_u16(0x0100);
        out.put_u16(1);
        out.put_u16(0);
        out.put_u16(0);
        out.put_u16(0);
        for label in name.split('.') {
            out.put_u8(label.len() as u8);
            out.put_slice(label.as_bytes());
        }
        out.put_u8(0);
        out.put_u16(qtype);
        out.put_u16(1);
        out
    }

    fn zones() -> Vec<(String, ZoneKind)> {
        vec![
            ("dnsbl.example.net".to_string(), ZoneKind::Dnsbl),
            ("dnswl.example.net".to_string(), ZoneKind::Dnswl),
            ("score.example.net".to_string(), ZoneKind::Score),
            ("dnsal.example.net".to_string(), ZoneKind::Dnsal),
        ]
    }

    fn engine() -> Arc<Engine> {
        Engine::new(Config::default(), Arc::new(StaticResolver::new()), None, None).0
    }

    fn answer_a(response: &[u8]) -> Option<Ipv4Addr> {
        // ANCOUNT then the last four bytes of the first A answer
        let ancount = u16::from_be_bytes([response[6], response[7]]);
        if ancount == 0 {
            return None;
        }
        let rdata = &response[response.len() - 4..];
        Some(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
    }

    #[tokio::test]
    async fn test_dnsbl_hot_answer() {
        let engine = engine();
        let source: IpAddr = "198.51.100.9".parse().unwrap();

        // Drive 192.0.2.5 to BLOCK via blocklist plus black reputation
        engine.lists.block.add("192.0.2.5").await.unwrap();
        let token: Token = "192.0.2.5".parse().unwrap();
        for _ in 0..3 {
            engine.reputation.add_spam(&token).await;
        }

        let packet = build_query("5.2.0.192.dnsbl.example.net", QTYPE_A);
        let response = respond(&engine, &zones(), &packet, source).await;

        assert_eq!(response[3] & 0x0F, 0);
        assert_eq!(answer_a(&response), Some(Ipv4Addr::new(127, 0, 0, 2)));
    }

    #[tokio::test]
    async fn test_dnsbl_unlisted_is_nxdomain() {
        let engine = engine();
        let source: IpAddr = "198.51.100.9".parse().unwrap();

        let packet = build_query("5.2.0.192.dnsbl.example.net", QTYPE_A);
        let response = respond(&engine, &zones(), &packet, source).await;

        assert_eq!(response[3] & 0x0F, 3); // NXDOMAIN
        assert_eq!(answer_a(&response), None);
    }

    #[tokio::test]
    async fn test_unknown_zone_is_notauth_and_abuse() {
        let engine = engine();
        let source: IpAddr = "198.51.100.9".parse().unwrap();

        let packet = build_query("5.2.0.192.other.example.org", QTYPE_A);
        let response = respond(&engine, &zones(), &packet, source).await;

        assert_eq!(response[3] & 0x0F, 9); // NOTAUTH
        assert_eq!(engine.abuse.snapshot_lines().await.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_is_formerr() {
        let engine = engine();
        let source: IpAddr = "198.51.100.9".parse().unwrap();

        let response = respond(&engine, &zones(), &[0u8; 5], source).await;
        assert_eq!(response[3] & 0x0F, 1); // FORMERR
        assert_eq!(engine.abuse.snapshot_lines().await.len(), 1);
    }

    #[tokio::test]
    async fn test_score_zone_encodes_probability() {
        let engine = engine();
        let source: IpAddr = "198.51.100.9".parse().unwrap();

        // Clean token scores 100
        let packet = build_query("5.2.0.192.score.example.net", QTYPE_A);
        let response = respond(&engine, &zones(), &packet, source).await;
        assert_eq!(answer_a(&response), Some(Ipv4Addr::new(127, 0, 1, 100)));

        // One complaint caps p at 0.25, scoring 75
        let token: Token = "192.0.2.5".parse().unwrap();
        engine.reputation.add_spam(&token).await;
        let response = respond(&engine, &zones(), &packet, source).await;
        assert_eq!(answer_a(&response), Some(Ipv4Addr::new(127, 0, 1, 75)));
    }

    #[tokio::test]
    async fn test_dnswl_white_answer() {
        let engine = engine();
        let source: IpAddr = "198.51.100.9".parse().unwrap();
        engine.lists.white.add(".mail.example.com").await.unwrap();

        let packet = build_query("mx.mail.example.com.dnswl.example.net", QTYPE_A);
        let response = respond(&engine, &zones(), &packet, source).await;
        assert_eq!(answer_a(&response), Some(Ipv4Addr::new(127, 0, 0, 4)));
    }

    #[tokio::test]
    async fn test_dnsal_contact_walk() {
        let engine = engine();
        let source: IpAddr = "198.51.100.9".parse().unwrap();
        engine
            .set_abuse_contact("example.com", "abuse@example.com")
            .await;

        let packet = build_query("mx.sub.example.com.dnsal.example.net", QTYPE_A);
        let response = respond(&engine, &zones(), &packet, source).await;
        assert_eq!(answer_a(&response), Some(Ipv4Addr::new(127, 0, 0, 2)));

        let packet = build_query("mx.other.org.dnsal.example.net", QTYPE_A);
        let response = respond(&engine, &zones(), &packet, source).await;
        assert_eq!(response[3] & 0x0F, 3);
    }

    #[tokio::test]
    async fn test_banned_source_gets_refused() {
        let engine = engine();
        let source: IpAddr = "198.51.100.9".parse().unwrap();

        // Trip the ban with a primed counter
        for _ in 0..2 {
            engine.abuse.register(source).await;
        }
        let lines = engine.abuse.snapshot_lines().await;
        let cidr = lines[0].split(' ').next().unwrap().to_string();
        engine
            .abuse
            .restore_lines(vec![format!(
                "{} {} {} 0",
                cidr,
                relayguard_common::constants::ABUSE_EVENT_LIMIT,
                chrono::Utc::now().timestamp()
            )])
            .await;
        engine.abuse.register(source).await;

        let packet = build_query("5.2.0.192.dnsbl.example.net", QTYPE_A);
        let response = respond(&engine, &zones(), &packet, source).await;
        assert_eq!(response[3] & 0x0F, 5); // REFUSED
    }
}
