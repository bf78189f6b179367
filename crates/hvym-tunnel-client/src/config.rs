//! Tunnel client configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng as _;

use crate::error::TunnelError;

/// A service name exposed through the tunnel and the local port it
/// forwards to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    /// Logical service name, unique within a session.
    pub service: String,
    /// Local TCP port the service listens on.
    pub local_port: u16,
}

impl PortBinding {
    pub fn new(service: impl Into<String>, local_port: u16) -> Self {
        Self {
            service: service.into(),
            local_port,
        }
    }
}

/// Validate bindings into the service → port map sent in `bind`.
///
/// The binding set is fixed for a session once registered; duplicate or
/// empty service names are a caller error caught before connecting.
pub(crate) fn validate_bindings(
    bindings: &[PortBinding],
) -> Result<BTreeMap<String, u16>, TunnelError> {
    if bindings.is_empty() {
        return Err(TunnelError::Bindings("no services to bind".into()));
    }
    let mut map = BTreeMap::new();
    for binding in bindings {
        if binding.service.is_empty() {
            return Err(TunnelError::Bindings("empty service name".into()));
        }
        if map
            .insert(binding.service.clone(), binding.local_port)
            .is_some()
        {
            return Err(TunnelError::Bindings(format!(
                "duplicate service name: {}",
                binding.service
            )));
        }
    }
    Ok(map)
}

/// Configuration for the tunnel connection to the relay.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Relay WebSocket URL (e.g., "wss://tunnel.hvym.link/connect").
    pub server_url: String,

    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,

    /// Interval between protocol-level pings while connected.
    pub ping_interval: Duration,

    /// How long to wait for a `pong` before declaring the link dead.
    pub pong_timeout: Duration,

    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,

    /// How long to wait for the relay's `challenge` after connecting.
    pub challenge_timeout: Duration,

    /// How long to wait for `auth_ok`/`auth_error` after sending `auth`.
    pub auth_timeout: Duration,

    /// How long to wait for `bind_ok` after sending `bind`.
    pub bind_timeout: Duration,

    /// Per-request timeout for local HTTP dispatch.
    pub dispatch_timeout: Duration,

    /// Cap on concurrently in-flight local dispatches. Backpressure for
    /// the local sink, not a protocol limit.
    pub max_concurrent_dispatches: usize,
}

impl TunnelConfig {
    /// Create a tunnel config for the given relay URL with defaults.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            reconnect: ReconnectPolicy::default(),
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            challenge_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            bind_timeout: Duration::from_secs(10),
            dispatch_timeout: Duration::from_secs(30),
            max_concurrent_dispatches: 32,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self::new(hvym_tunnel_core::store::DEFAULT_SERVER_URL)
    }
}

/// Exponential backoff reconnection policy with jitter.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Random jitter fraction applied to each delay (0.2 = ±20%).
    pub jitter: f64,
    /// Maximum number of reconnect attempts (None = unlimited; a tunnel
    /// should self-heal across network blips without user action).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Calculate the deterministic delay for a given attempt number
    /// (0-indexed), before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// The delay actually slept: `delay_for_attempt` with random jitter so
    /// a fleet of clients doesn't reconnect in lockstep.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor)
    }

    /// Whether another attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}
