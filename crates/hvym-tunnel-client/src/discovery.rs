//! Relay metadata discovery.
//!
//! The relay serves an unauthenticated `/info` document next to its
//! WebSocket endpoint. The only field the client cares about is
//! `server_address`: the relay's own signing address, which the user can
//! pin in the config store to detect relay swaps. Discovery is advisory:
//! any failure is logged and the connection proceeds without it.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct InfoDocument {
    server_address: String,
}

/// Fetches relay metadata from the `/info` endpoint derived from the
/// WebSocket URL.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl Default for DiscoveryClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl DiscoveryClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// Fetch the relay's signing address, or `None` if the info document
    /// is unreachable or malformed.
    pub async fn fetch_server_address(&self, server_url: &str) -> Option<String> {
        let info_url = info_url_for(server_url)?;
        debug!(%info_url, "Fetching relay info");
        match self.fetch(&info_url).await {
            Ok(address) => {
                debug!(server_address = %address, "Relay info fetched");
                Some(address)
            }
            Err(reason) => {
                warn!(%info_url, %reason, "Relay discovery failed, continuing without it");
                None
            }
        }
    }

    async fn fetch(&self, info_url: &str) -> Result<String, String> {
        let response = self
            .http
            .get(info_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let info: InfoDocument = response.json().await.map_err(|e| e.to_string())?;
        if info.server_address.is_empty() {
            return Err("empty server_address".into());
        }
        Ok(info.server_address)
    }
}

/// Derive the HTTP info URL from the WebSocket connect URL:
/// `wss://host/connect` → `https://host/info` (and `ws` → `http`).
fn info_url_for(server_url: &str) -> Option<String> {
    let (scheme, rest) = server_url.split_once("://")?;
    let http_scheme = match scheme {
        "wss" => "https",
        "ws" => "http",
        other => {
            warn!(scheme = other, "Unrecognized relay URL scheme, skipping discovery");
            return None;
        }
    };
    let base = rest.strip_suffix("/connect").unwrap_or(rest);
    let base = base.strip_suffix('/').unwrap_or(base);
    Some(format!("{http_scheme}://{base}/info"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;

    #[test]
    fn info_url_derivation() {
        assert_eq!(
            info_url_for("wss://tunnel.hvym.link/connect").unwrap(),
            "https://tunnel.hvym.link/info"
        );
        assert_eq!(
            info_url_for("ws://127.0.0.1:4443/connect").unwrap(),
            "http://127.0.0.1:4443/info"
        );
        assert_eq!(
            info_url_for("wss://relay.example").unwrap(),
            "https://relay.example/info"
        );
        assert!(info_url_for("ftp://relay.example/connect").is_none());
        assert!(info_url_for("not-a-url").is_none());
    }

    async fn spawn_info_server(body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(body.as_bytes()).await;
        });
        port
    }

    #[tokio::test]
    async fn fetches_server_address_from_info_document() {
        let port = spawn_info_server(
            r#"{"server_address": "GA7QYNF7SOWQ3GLR2BGMZEHXAVIRZA4KVWLTJJFC7MGXUA74P7UJVSGZ", "version": "1.4.0"}"#,
        )
        .await;

        let discovery = DiscoveryClient::default();
        let address = discovery
            .fetch_server_address(&format!("ws://127.0.0.1:{port}/connect"))
            .await
            .unwrap();
        assert_eq!(
            address,
            "GA7QYNF7SOWQ3GLR2BGMZEHXAVIRZA4KVWLTJJFC7MGXUA74P7UJVSGZ"
        );
    }

    #[tokio::test]
    async fn malformed_info_document_is_advisory() {
        let port = spawn_info_server(r#"{"version": "1.4.0"}"#).await;

        let discovery = DiscoveryClient::default();
        let address = discovery
            .fetch_server_address(&format!("ws://127.0.0.1:{port}/connect"))
            .await;
        assert!(address.is_none());
    }

    #[tokio::test]
    async fn unreachable_relay_is_advisory() {
        let discovery = DiscoveryClient::new(Duration::from_millis(200));
        // Port 1 is essentially guaranteed closed.
        let address = discovery
            .fetch_server_address("ws://127.0.0.1:1/connect")
            .await;
        assert!(address.is_none());
    }
}
