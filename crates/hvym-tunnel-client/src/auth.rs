//! Challenge/response authentication against the relay.
//!
//! The relay proves nothing to us beyond TLS; we prove possession of the
//! keypair behind our address by signing the nonce it issues. A rejected
//! challenge is never retried on the same connection; the supervisor
//! reconnects for a fresh nonce only when the rejection is transient.

use tracing::{debug, info};

use hvym_tunnel_crypto::SigningIdentity;
use hvym_tunnel_proto::{Message, codec};

use crate::config::TunnelConfig;
use crate::error::TunnelError;
use crate::transport::Transport;

/// Result of a successful handshake.
#[derive(Debug, Clone)]
pub struct AuthGrant {
    /// Opaque session credential.
    pub token: String,
    /// Public endpoint URL the relay assigned to this address.
    pub endpoint: String,
}

/// Run the challenge/response exchange on a freshly opened transport.
pub async fn negotiate(
    transport: &mut Transport,
    identity: &dyn SigningIdentity,
    config: &TunnelConfig,
) -> Result<AuthGrant, TunnelError> {
    let nonce = loop {
        match transport
            .recv_timeout(config.challenge_timeout, "auth challenge")
            .await?
        {
            Message::Challenge { nonce } => break nonce,
            Message::Ping => transport.send(Message::Pong).await?,
            other => {
                return Err(TunnelError::Protocol(format!(
                    "expected challenge, got {}",
                    other.kind()
                )));
            }
        }
    };

    // The signature covers the decoded nonce bytes; the nonce itself is
    // echoed back verbatim so the relay can match the challenge.
    let nonce_bytes = codec::decode_body(&nonce)
        .map_err(|_| TunnelError::Protocol("challenge nonce is not valid base64".into()))?;
    let signature = codec::encode_body(&identity.sign(&nonce_bytes));
    let address = identity.address();
    debug!(%address, "Answering auth challenge");

    transport
        .send(Message::Auth {
            address,
            nonce,
            signature,
        })
        .await?;

    loop {
        match transport
            .recv_timeout(config.auth_timeout, "auth result")
            .await?
        {
            Message::AuthOk { token, endpoint } => {
                info!(%endpoint, "Authenticated with relay");
                return Ok(AuthGrant { token, endpoint });
            }
            Message::AuthError { reason } => {
                return Err(if is_transient_reason(&reason) {
                    TunnelError::AuthTransient(reason)
                } else {
                    TunnelError::AuthRejected(reason)
                });
            }
            Message::Ping => transport.send(Message::Pong).await?,
            other => {
                return Err(TunnelError::Protocol(format!(
                    "expected auth result, got {}",
                    other.kind()
                )));
            }
        }
    }
}

/// Relay rejection reasons are free-form strings, so transient detection
/// is by substring: anything that a fresh connection (fresh nonce, fresh
/// clock reading) can fix. Everything else, like a bad signature or an
/// unknown address, points at configuration and is terminal.
fn is_transient_reason(reason: &str) -> bool {
    let reason = reason.to_ascii_lowercase();
    ["expired", "clock", "timeout", "stale"]
        .iter()
        .any(|needle| reason.contains(needle))
}
