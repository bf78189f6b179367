//! HVYM Tunnel Client
//!
//! Engine that keeps a local HTTP service reachable from the public
//! internet through the HVYM relay:
//! - Challenge/response authentication against a Stellar-style keypair
//! - Request multiplexing from the relay into local ports
//! - Automatic reconnection with exponential backoff and heartbeats
//! - Advisory discovery of the relay's public address

pub mod auth;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod forwarder;
pub mod session;
pub mod transport;

pub use client::{TunnelClient, TunnelHandle};
pub use config::{PortBinding, ReconnectPolicy, TunnelConfig};
pub use discovery::DiscoveryClient;
pub use error::TunnelError;
pub use event::{TunnelEvent, TunnelState};
