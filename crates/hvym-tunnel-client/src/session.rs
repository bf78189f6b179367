//! Per-connection session state.

/// The credential and endpoint of one authenticated connection.
///
/// A fresh `Session` is created for every connection attempt and dropped
/// on disconnect; it is never mutated in place across reconnects, so a
/// reconnect race can never observe stale session state.
#[derive(Debug, Clone)]
pub struct Session {
    /// Short-lived credential issued by the relay for this session.
    pub token: String,
    /// Public endpoint URL serving this tunnel.
    pub endpoint: String,
}

impl Session {
    pub const fn new(token: String, endpoint: String) -> Self {
        Self { token, endpoint }
    }
}
