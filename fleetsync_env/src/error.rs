//! Error types for the FleetSync environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The relay channel was closed by the receiving side
    #[error("Relay closed: {0}")]
    RelayClosed(String),

    /// Relay delivery failed for another reason
    #[error("Relay error: {0}")]
    RelayError(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a relay error.
    pub fn relay(msg: impl Into<String>) -> Self {
        Self::RelayError(msg.into())
    }

    /// Creates a relay-closed error naming the relay.
    pub fn closed(relay: impl std::fmt::Display) -> Self {
        Self::RelayClosed(relay.to_string())
    }
}
