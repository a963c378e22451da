//! Error types for warden-core.
//!
//! The split between [`WardenError::Transport`] and [`WardenError::Protocol`]
//! drives the recovery policy: transport failures are handled like a worker
//! crash (suspend forwarding, wait for reconnect), while protocol violations
//! are escalated fatally and never retried.

use thiserror::Error;

/// Main error type for the warden supervision core.
#[derive(Debug, Error)]
pub enum WardenError {
    /// A forwarded call failed in transit. The worker process is assumed to
    /// have crashed or be restarting.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The worker broke the connection protocol, e.g. returned a malformed
    /// handshake acknowledgment.
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    /// The bind request to the connection source could not be issued.
    #[error("Bind request failed: {message}")]
    BindFailed { message: String },

    /// An operation required a live worker connection.
    #[error("Not connected to the worker service")]
    NotConnected,

    /// The supervisor actor has shut down and no longer accepts commands.
    #[error("Supervisor is no longer running")]
    SupervisorClosed,
}

impl WardenError {
    /// Helper to create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        WardenError::Transport {
            message: message.into(),
        }
    }

    /// Helper to create a protocol-violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        WardenError::Protocol {
            message: message.into(),
        }
    }
}

/// Result type alias using [`WardenError`].
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = WardenError::transport("peer hung up");
        assert_eq!(err.to_string(), "Transport error: peer hung up");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = WardenError::protocol("empty handshake payload");
        assert_eq!(err.to_string(), "Protocol violation: empty handshake payload");
    }
}
