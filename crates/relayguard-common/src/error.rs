//! Error types for RelayGuard

use thiserror::Error;

/// Ticket decode failures, surfaced verbatim to protocol callers
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketError {
    #[error("TICKET EXPIRED")]
    Expired,

    #[error("TICKET UNDECODABLE")]
    Undecodable,
}

/// Main error type for RelayGuard
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("DNS error: {0}")]
    Dns(String),

    #[error(transparent)]
    Ticket(#[from] TicketError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for RelayGuard
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the single-line reply sent to text-protocol callers
    pub fn protocol_reply(&self) -> String {
        match self {
            Error::Ticket(e) => format!("ERROR: {}", e),
            Error::Dns(_) => "TEMPERROR".to_string(),
            Error::Protocol(msg) => format!("ERROR: {}", msg),
            Error::Validation(msg) => format!("INVALID {}", msg),
            _ => "ERROR: INTERNAL".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_error_display() {
        assert_eq!(TicketError::Expired.to_string(), "TICKET EXPIRED");
        assert_eq!(TicketError::Undecodable.to_string(), "TICKET UNDECODABLE");
    }

    #[test]
    fn test_protocol_reply() {
        let err: Error = TicketError::Expired.into();
        assert_eq!(err.protocol_reply(), "ERROR: TICKET EXPIRED");

        let err = Error::Dns("lookup timed out".to_string());
        assert_eq!(err.protocol_reply(), "TEMPERROR");
    }
}
