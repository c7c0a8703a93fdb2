//! RelayGuard Common - Shared types and utilities
//!
//! This crate provides common types, configuration, and constants
//! shared across all RelayGuard components.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result, TicketError};
pub use types::{Action, Status, Token, Transaction};
