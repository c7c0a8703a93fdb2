//! Configuration for RelayGuard

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// DNS resolver configuration
    #[serde(default)]
    pub dns: DnsConfig,

    /// SPF configuration
    #[serde(default)]
    pub spf: SpfConfig,

    /// Reputation engine configuration
    #[serde(default)]
    pub reputation: ReputationConfig,

    /// Greylist / flood deferral configuration
    #[serde(default)]
    pub defer: DeferConfig,

    /// Ticket codec configuration
    #[serde(default)]
    pub ticket: TicketConfig,

    /// Policy knobs for the decision pipeline
    #[serde(default)]
    pub policy: PolicyConfig,

    /// DNS-list frontend configuration
    #[serde(default)]
    pub dnslist: DnslistConfig,

    /// Peer gossip configuration
    #[serde(default)]
    pub peers: PeersConfig,

    /// Snapshot storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname announced in replies and release URLs
    #[serde(default = "default_hostname")]
    pub hostname: String,

    /// Bind address for the text command protocol
    #[serde(default = "default_command_bind")]
    pub command_bind: String,

    /// Bind address for the Postfix policy protocol
    #[serde(default = "default_policy_bind")]
    pub policy_bind: String,

    /// Maximum concurrent protocol connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Wall-clock budget per decision request, seconds
    #[serde(default = "default_request_budget")]
    pub request_budget_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            command_bind: default_command_bind(),
            policy_bind: default_policy_bind(),
            max_connections: default_max_connections(),
            request_budget_secs: default_request_budget(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_command_bind() -> String {
    "0.0.0.0:9877".to_string()
}

fn default_policy_bind() -> String {
    "0.0.0.0:9876".to_string()
}

fn default_max_connections() -> usize {
    100
}

fn default_request_budget() -> u64 {
    crate::constants::REQUEST_BUDGET_SECS
}

/// DNS resolver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Per-lookup timeout in seconds
    #[serde(default = "default_dns_timeout")]
    pub timeout_secs: u64,

    /// Cache lifetime for resolved records, seconds
    #[serde(default = "default_dns_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_dns_timeout(),
            cache_ttl_secs: default_dns_cache_ttl(),
        }
    }
}

fn default_dns_timeout() -> u64 {
    3
}

fn default_dns_cache_ttl() -> u64 {
    900
}

/// SPF configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpfConfig {
    /// Return SOFTFAIL instead of PERMERROR when a flagged record
    /// evaluates past its last mechanism
    #[serde(default = "default_true")]
    pub softfail_on_syntax_error: bool,

    /// Use the RFC 7208 default for a missing `all` term instead of NEUTRAL
    #[serde(default)]
    pub rfc_all_default: bool,

    /// Best-guess record used when a domain publishes no SPF
    #[serde(default = "default_guess")]
    pub guess_default: String,
}

impl Default for SpfConfig {
    fn default() -> Self {
        Self {
            softfail_on_syntax_error: default_true(),
            rfc_all_default: false,
            guess_default: default_guess(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_guess() -> String {
    "v=spf1 a/24//48 mx/24//48 ptr ?all".to_string()
}

/// Reputation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    /// Flood threshold for IP tokens, minimum inter-arrival seconds
    #[serde(default = "default_flood_ip")]
    pub flood_ip_secs: f64,

    /// Flood threshold for sender tokens
    #[serde(default = "default_flood_sender")]
    pub flood_sender_secs: f64,

    /// Flood threshold for HELO tokens
    #[serde(default = "default_flood_helo")]
    pub flood_helo_secs: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            flood_ip_secs: default_flood_ip(),
            flood_sender_secs: default_flood_sender(),
            flood_helo_secs: default_flood_helo(),
        }
    }
}

fn default_flood_ip() -> f64 {
    1.0
}

fn default_flood_sender() -> f64 {
    2.0
}

fn default_flood_helo() -> f64 {
    5.0
}

/// Deferral class windows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeferConfig {
    /// SOFTFAIL greylist window, seconds
    #[serde(default = "default_defer_softfail")]
    pub softfail_ttl_secs: i64,

    /// Reputation-GRAY greylist window, seconds
    #[serde(default = "default_defer_gray")]
    pub gray_ttl_secs: i64,

    /// Reputation-BLACK listing window, seconds
    #[serde(default = "default_defer_black")]
    pub black_ttl_secs: i64,

    /// Flood deferral window, seconds
    #[serde(default = "default_defer_flood")]
    pub flood_ttl_secs: i64,

    /// Defer count past which a flow escalates to BLOCKED
    #[serde(default = "default_flood_max_retry")]
    pub flood_max_retry: u32,
}

impl Default for DeferConfig {
    fn default() -> Self {
        Self {
            softfail_ttl_secs: default_defer_softfail(),
            gray_ttl_secs: default_defer_gray(),
            black_ttl_secs: default_defer_black(),
            flood_ttl_secs: default_defer_flood(),
            flood_max_retry: default_flood_max_retry(),
        }
    }
}

fn default_defer_softfail() -> i64 {
    900
}

fn default_defer_gray() -> i64 {
    1_500
}

fn default_defer_black() -> i64 {
    86_400
}

fn default_defer_flood() -> i64 {
    300
}

fn default_flood_max_retry() -> u32 {
    16
}

/// Ticket codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketConfig {
    /// Process-wide secret the codec derives its keys from
    #[serde(default = "default_secret")]
    pub secret: String,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            secret: default_secret(),
        }
    }
}

fn default_secret() -> String {
    "relayguard-insecure-default-secret".to_string()
}

/// Policy knobs for the decision pipeline
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyConfig {
    /// Auto-block peers with no reverse DNS
    #[serde(default)]
    pub reverse_required: bool,

    /// Base URL for unblock links included in BLOCKED replies
    pub unblock_url: Option<String>,

    /// Base URL for release links included in LISTED replies
    pub release_url: Option<String>,
}

/// One published DNS-list zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Zone apex, e.g. `dnsbl.example.net`
    pub zone: String,

    /// List type the zone externalises
    pub kind: ZoneKind,
}

/// DNS-list zone types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Dnsbl,
    Dnswl,
    Uribl,
    Score,
    Dnsal,
}

/// DNS-list frontend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnslistConfig {
    /// Enable the UDP frontend
    #[serde(default)]
    pub enabled: bool,

    /// UDP bind address
    #[serde(default = "default_dnslist_bind")]
    pub bind: String,

    /// Published zones
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,

    /// Hard cap on in-flight responses
    #[serde(default = "default_dnslist_pool")]
    pub max_connections: usize,
}

impl Default for DnslistConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_dnslist_bind(),
            zones: Vec::new(),
            max_connections: default_dnslist_pool(),
        }
    }
}

fn default_dnslist_bind() -> String {
    "0.0.0.0:53".to_string()
}

fn default_dnslist_pool() -> usize {
    128
}

/// Peer gossip configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersConfig {
    /// UDP bind address for receiving peer deltas
    #[serde(default = "default_peers_bind")]
    pub bind: String,

    /// Peer addresses reputation mutations are pushed to
    #[serde(default)]
    pub peers: Vec<String>,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            bind: default_peers_bind(),
            peers: Vec::new(),
        }
    }
}

fn default_peers_bind() -> String {
    "0.0.0.0:9878".to_string()
}

/// Snapshot storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory the snapshot files live in
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,

    /// Directory for the per-day analysis CSVs
    #[serde(default = "default_analysis_path")]
    pub analysis_path: PathBuf,

    /// Seconds between persistence sweeps
    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            analysis_path: default_analysis_path(),
            persist_interval_secs: default_persist_interval(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/relayguard")
}

fn default_analysis_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_persist_interval() -> u64 {
    60
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations, falling back to
    /// built-in defaults when no file exists
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./relayguard.toml"),
            std::path::PathBuf::from("/etc/relayguard/relayguard.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Config::default())
    }
}
