//! Tunnel states and the outbound event channel payloads.
//!
//! The engine reports everything a frontend needs through
//! [`TunnelEvent`]s; callers render state transitions and the last error
//! reason without ever inspecting protocol-level detail.

/// Tunnel connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Initial state, and terminal state after a caller-initiated stop.
    Disconnected,
    /// Opening the WebSocket to the relay.
    Connecting,
    /// Challenge/response handshake in flight.
    Authenticating,
    /// Authenticated, bound, and forwarding requests.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// Terminal authentication failure; requires caller intervention.
    Failed,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Asynchronous notifications emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The state machine moved to a new state.
    StateChanged(TunnelState),
    /// A session reached steady state; carries the public endpoint URL.
    Connected { endpoint: String },
    /// A previously connected session ended (cleanly or not).
    Disconnected,
    /// A non-fatal or terminal error, as a rendered message.
    Error { message: String },
}
