// src/utils/errors.rs
//! Error taxonomy for the queue engine
//!
//! Per-connection failures are logged and swallowed where they happen; only
//! the variants that reach `Runner::execute` decide the process exit status.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    #[error("Stats persistence failed: {0}")]
    StatsFailed(String),

    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("Unable to reach master at {0}")]
    RelayUnreachable(String),

    #[error("Master rejected registration: {0}")]
    RelayRejected(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Observability setup failed: {0}")]
    Observability(String),
}

impl QueueError {
    /// True for errors a worker treats as the master having gone away.
    pub fn is_transport(&self) -> bool {
        match self {
            QueueError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_transport_classification() {
        assert!(QueueError::from(Error::from(ErrorKind::ConnectionRefused)).is_transport());
        assert!(QueueError::from(Error::from(ErrorKind::BrokenPipe)).is_transport());
        assert!(QueueError::from(Error::from(ErrorKind::NotFound)).is_transport());
        assert!(!QueueError::from(Error::from(ErrorKind::PermissionDenied)).is_transport());
        assert!(!QueueError::Protocol("bad".to_string()).is_transport());
    }
}
