//! Common types for RelayGuard

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// An accountable identifier derived from an SMTP transaction.
///
/// Tokens are the unit of reputation accounting. Each variant has a
/// canonical string form that round-trips through `Display`/`FromStr`:
///
/// - `Ip` - canonical dotted-quad or colon form
/// - `Host` - `.hostname`, a rooted domain suffix
/// - `Domain` - `@domain`, a sending domain
/// - `Email` - `local@domain`, a full mailbox
/// - `Recipient` - `>recipient`, tag only, never accumulates reputation
/// - `Client` - `client:`, tenant tag, same treatment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Token {
    Ip(IpAddr),
    Host(String),
    Domain(String),
    Email(String),
    Recipient(String),
    Client(String),
}

impl Token {
    /// Parse a host name into a rooted-suffix token, lowercasing it
    pub fn host(name: impl AsRef<str>) -> Self {
        Token::Host(name.as_ref().trim_matches('.').to_lowercase())
    }

    /// Parse a sending domain into an `@domain` token
    pub fn domain(name: impl AsRef<str>) -> Self {
        Token::Domain(name.as_ref().trim_start_matches('@').to_lowercase())
    }

    /// Whether this token accumulates reputation (tags do not)
    pub fn is_reputable(&self) -> bool {
        !matches!(self, Token::Recipient(_) | Token::Client(_))
    }

    /// Whether this token is IP-shaped (caps its top status at BLACK)
    pub fn is_ip(&self) -> bool {
        matches!(self, Token::Ip(_))
    }

    /// The flood class this token is measured against
    pub fn flood_class(&self) -> FloodClass {
        match self {
            Token::Ip(_) => FloodClass::Ip,
            Token::Host(_) => FloodClass::Helo,
            _ => FloodClass::Sender,
        }
    }
}

/// Flood-detection class, with distinct inter-arrival thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodClass {
    Ip,
    Sender,
    Helo,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ip(ip) => write!(f, "{}", ip),
            Token::Host(name) => write!(f, ".{}", name),
            Token::Domain(name) => write!(f, "@{}", name),
            Token::Email(addr) => write!(f, "{}", addr),
            Token::Recipient(addr) => write!(f, ">{}", addr),
            Token::Client(addr) => write!(f, "{}:", addr),
        }
    }
}

impl FromStr for Token {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(crate::Error::Validation("empty token".to_string()));
        }
        if let Some(rest) = s.strip_prefix('>') {
            return Ok(Token::Recipient(rest.to_lowercase()));
        }
        if let Some(rest) = s.strip_prefix('.') {
            return Ok(Token::Host(rest.to_lowercase()));
        }
        if let Some(rest) = s.strip_prefix('@') {
            return Ok(Token::Domain(rest.to_lowercase()));
        }
        // Address forms before the client-tag suffix: `fe80::` is an
        // address, not a tag
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(Token::Ip(ip));
        }
        if let Some(rest) = s.strip_suffix(':') {
            return Ok(Token::Client(rest.to_lowercase()));
        }
        if s.contains('@') {
            return Ok(Token::Email(s.to_lowercase()));
        }
        Err(crate::Error::Validation(format!("unrecognised token: {}", s)))
    }
}

impl From<Token> for String {
    fn from(token: Token) -> Self {
        token.to_string()
    }
}

impl TryFrom<String> for Token {
    type Error = crate::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Derived reputation label for a token
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    #[default]
    White,
    Gray,
    Black,
    Block,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::White => write!(f, "WHITE"),
            Status::Gray => write!(f, "GRAY"),
            Status::Black => write!(f, "BLACK"),
            Status::Block => write!(f, "BLOCK"),
        }
    }
}

/// Terminal action of the decision pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    PermError,
    TempError,
    Blocked,
    Listed,
    Greylist,
    SpamTrap,
    Invalid,
    Nxdomain,
    Lan,
}

impl Action {
    /// Exit code for the CLI client
    pub fn exit_code(&self) -> u8 {
        match self {
            Action::Pass => 0,
            Action::Fail => 1,
            Action::SoftFail => 2,
            Action::Neutral => 3,
            Action::PermError => 4,
            Action::TempError => 5,
            Action::None => 6,
            Action::Lan => 7,
            Action::Blocked | Action::SpamTrap | Action::Invalid | Action::Nxdomain => 8,
            Action::Listed | Action::Greylist => 9,
        }
    }

    /// Whether the message is accepted into reputation accounting
    pub fn is_accepting(&self) -> bool {
        matches!(
            self,
            Action::Pass | Action::Fail | Action::SoftFail | Action::Neutral | Action::None
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Pass => "PASS",
            Action::Fail => "FAIL",
            Action::SoftFail => "SOFTFAIL",
            Action::Neutral => "NEUTRAL",
            Action::None => "NONE",
            Action::PermError => "PERMERROR",
            Action::TempError => "TEMPERROR",
            Action::Blocked => "BLOCKED",
            Action::Listed => "LISTED",
            Action::Greylist => "GREYLIST",
            Action::SpamTrap => "SPAMTRAP",
            Action::Invalid => "INVALID",
            Action::Nxdomain => "NXDOMAIN",
            Action::Lan => "LAN",
        };
        write!(f, "{}", s)
    }
}

/// One inbound SMTP transaction as presented by the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Connecting peer address
    pub ip: IpAddr,

    /// Envelope sender (MAIL FROM), if any
    pub sender: Option<String>,

    /// HELO/EHLO hostname
    pub helo: Option<String>,

    /// Envelope recipient (RCPT TO), if any
    pub recipient: Option<String>,

    /// Tenant the relay is serving, if identified
    pub client: Option<String>,
}

impl Transaction {
    /// Create a transaction from the raw protocol fields, normalising
    /// empty strings to absent values
    pub fn new(
        ip: IpAddr,
        sender: Option<String>,
        helo: Option<String>,
        recipient: Option<String>,
    ) -> Self {
        let clean = |v: Option<String>| {
            v.map(|s| s.trim().trim_matches('\'').to_lowercase())
                .filter(|s| !s.is_empty())
        };
        Self {
            ip,
            sender: clean(sender),
            helo: clean(helo),
            recipient: clean(recipient),
            client: None,
        }
    }

    /// Attach the tenant identity
    pub fn with_client(mut self, client: Option<String>) -> Self {
        self.client = client.filter(|s| !s.is_empty());
        self
    }

    /// Domain part of the envelope sender
    pub fn sender_domain(&self) -> Option<&str> {
        self.sender
            .as_deref()
            .and_then(|s| s.rsplit_once('@'))
            .map(|(_, d)| d)
            .filter(|d| !d.is_empty())
    }

    /// Flow fingerprint used for greylisting: `origin>recipient`
    pub fn flow(&self) -> String {
        let origin = self
            .sender
            .clone()
            .unwrap_or_else(|| self.ip.to_string());
        format!("{}>{}", origin, self.recipient.as_deref().unwrap_or(""))
    }
}
