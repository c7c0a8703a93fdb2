//! DNS-list frontend
//!
//! Externalises the reputation store as DNSBL/DNSWL/URIBL/SCORE/DNSAL
//! zones over UDP, with per-source abuse throttling.

pub mod abuse;
pub mod server;
pub mod wire;

pub use abuse::AbuseThrottle;
pub use server::DnslistServer;
