use std::io;
use thiserror::Error;

/// Relay engine error type
#[derive(Error, Debug)]
pub enum RelayError {
    /// Binding the listening socket failed; the relay cannot start
    #[error("Listen error on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Accepting an inbound stream connection failed
    #[error("Accept error: {0}")]
    Accept(#[source] io::Error),

    /// Receiving an inbound datagram failed
    #[error("Receive error: {0}")]
    Receive(#[source] io::Error),

    /// Connecting to the upstream endpoint failed
    #[error("Dial error to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A filter rule could not be compiled
    #[error("Invalid filter rule '{rule}': {reason}")]
    Filter { rule: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Whether this error is raised by the accept/receive/dial paths that the
    /// strict flag escalates
    pub fn is_policy_error(&self) -> bool {
        matches!(
            self,
            RelayError::Accept(_) | RelayError::Receive(_) | RelayError::Dial { .. }
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;
