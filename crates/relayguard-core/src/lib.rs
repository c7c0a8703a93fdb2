//! RelayGuard Core - Decision and reputation engine
//!
//! This crate provides the anti-spam decision engine: SPF evaluation
//! and caching, token expansion, policy lists, per-token reputation,
//! the complaint ledger and ticket codec, greylist/flood deferral, the
//! DNS-list frontend, and peer gossip.

pub mod command;
pub mod defer;
pub mod dnslist;
pub mod engine;
pub mod ledger;
pub mod lists;
pub mod net;
pub mod peers;
pub mod pipeline;
pub mod policy_proto;
pub mod reputation;
pub mod resolver;
pub mod spf;
pub mod ticket;
pub mod tokens;

pub use command::CommandServer;
pub use defer::{DeferClass, DeferralController};
pub use dnslist::DnslistServer;
pub use engine::Engine;
pub use ledger::ComplaintLedger;
pub use lists::PolicyLists;
pub use peers::PeerGossip;
pub use pipeline::Decision;
pub use policy_proto::PolicyServer;
pub use reputation::{Distribution, ReputationStore};
pub use resolver::{Resolver, SystemResolver};
pub use spf::{SpfEvaluator, SpfOutcome, SpfRegistry};
pub use ticket::TicketCodec;
pub use tokens::TokenExpander;
