//! Expiry windows and hard limits used across the engine
//!
//! Every time constant the pipeline relies on lives here rather than as a
//! literal at the use site.

/// Seconds in one week, the reference window for ham estimation
pub const WEEK_SECS: i64 = 7 * 24 * 3600;

/// Maximum ticket age accepted by the codec
pub const TICKET_TTL_SECS: i64 = 5 * 24 * 3600;

/// Complaint ledger retention
pub const LEDGER_TTL_SECS: i64 = 7 * 24 * 3600;

/// SPF records older than this are refreshed by the background loop
pub const SPF_REFRESH_SECS: i64 = 7 * 24 * 3600;

/// SPF records unqueried for this long are evicted
pub const SPF_EVICT_SECS: i64 = 14 * 24 * 3600;

/// Reputation distributions unqueried for this long are droppable
pub const DISTRIBUTION_EVICT_SECS: i64 = 14 * 24 * 3600;

/// Length of a DNS-frontend abuse ban
pub const ABUSE_BAN_SECS: i64 = 7 * 24 * 3600;

/// Abuse events per source CIDR before a ban engages
pub const ABUSE_EVENT_LIMIT: u32 = 16_384;

/// NXDOMAIN observations before a domain may be marked inexistent
pub const SPF_NXDOMAIN_LIMIT: u32 = 3;

/// Query pressure required before the inexistence mark is trusted
pub const SPF_NXDOMAIN_QUERIES: u32 = 32;

/// Include/redirect depth bound for SPF evaluation
pub const SPF_DEPTH_LIMIT: usize = 10;

/// Queries since last refresh that make a record eligible for re-resolution
pub const SPF_REFRESH_QUERIES: u32 = 3;

/// Wall-clock budget for one decision request
pub const REQUEST_BUDGET_SECS: u64 = 20;

/// DNS-list answer TTL, default confidence
pub const DNSLIST_TTL_LOW: u32 = 86_400;

/// DNS-list answer TTL, medium confidence
pub const DNSLIST_TTL_MEDIUM: u32 = 259_200;

/// DNS-list answer TTL, high confidence
pub const DNSLIST_TTL_HIGH: u32 = 432_000;
