//! Tunnel client error types.

/// Errors that can occur in the tunnel client.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Authentication rejected for a reason that points at configuration
    /// (bad signature, unknown address). Not retried automatically.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// Authentication rejected for a reason that a fresh connection (and
    /// fresh challenge) can fix, e.g. an expired challenge.
    #[error("Authentication rejected (transient): {0}")]
    AuthTransient(String),

    #[error("Bind rejected: {0}")]
    Bind(String),

    #[error("Heartbeat timed out")]
    HeartbeatTimeout,

    #[error("Invalid port bindings: {0}")]
    Bindings(String),
}

impl TunnelError {
    /// Whether this error should stop the reconnect loop and move the
    /// client to `Failed` instead of retrying with backoff.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::AuthRejected(_) | Self::Bindings(_))
    }
}
