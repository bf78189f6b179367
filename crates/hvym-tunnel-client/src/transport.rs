//! WebSocket transport to the relay.
//!
//! The engine never touches the socket directly: a reader task decodes
//! frames into an inbound channel and a writer task drains an outbound
//! channel onto the sink. That keeps the control loop free to `select!`
//! over plain mpsc endpoints, lets the forwarder push responses from any
//! task via a cloned sender, and makes the whole engine drivable from
//! tests with [`Transport::from_channels`].
//!
//! When the last outbound sender drops, the writer sends a best-effort
//! close frame. When the socket closes or errors, the inbound channel
//! ends and `recv` returns `None`.

use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use hvym_tunnel_proto::{Message, codec};

use crate::error::TunnelError;

const CHANNEL_CAPACITY: usize = 128;

/// A connected, message-typed transport.
pub struct Transport {
    outbound: mpsc::Sender<Message>,
    inbound: mpsc::Receiver<Message>,
}

impl Transport {
    /// Open a WebSocket to the relay's `/connect` endpoint.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, TunnelError> {
        let (ws, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| TunnelError::Timeout("websocket connect"))?
            .map_err(|e| TunnelError::Connection(e.to_string()))?;
        Ok(Self::from_websocket(ws))
    }

    fn from_websocket(ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel::<Message>(CHANNEL_CAPACITY);

        // Writer: drain the outbound channel onto the socket, then close.
        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let text = match codec::encode(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, kind = msg.kind(), "Failed to encode frame");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.send(WsMessage::Close(None)).await;
        });

        // Reader: decode frames into the inbound channel until the socket
        // closes. Malformed frames are logged and skipped, not fatal.
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let decoded = match &frame {
                    Ok(WsMessage::Text(text)) => codec::decode(text.as_str()),
                    Ok(WsMessage::Binary(bytes)) => match std::str::from_utf8(bytes) {
                        Ok(text) => codec::decode(text),
                        Err(_) => {
                            warn!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(_)) => break,
                    // WebSocket-level ping/pong is answered by tungstenite.
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "WebSocket read error");
                        break;
                    }
                };
                match decoded {
                    Ok(msg) => {
                        if inbound_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring malformed frame"),
                }
            }
        });

        Self { outbound, inbound }
    }

    /// Build a transport over raw channels. Used by tests to drive the
    /// engine without a socket.
    pub fn from_channels(outbound: mpsc::Sender<Message>, inbound: mpsc::Receiver<Message>) -> Self {
        Self { outbound, inbound }
    }

    /// A cloneable sender for pushing messages from concurrent tasks.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.outbound.clone()
    }

    /// Send one message.
    pub async fn send(&self, msg: Message) -> Result<(), TunnelError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| TunnelError::Connection("transport closed while sending".into()))
    }

    /// Receive the next message; `None` means the transport closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    /// Receive with a deadline, mapping closure and timeout to errors.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
        waiting_for: &'static str,
    ) -> Result<Message, TunnelError> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(TunnelError::Connection(format!(
                "transport closed while waiting for {waiting_for}"
            ))),
            Err(_) => Err(TunnelError::Timeout(waiting_for)),
        }
    }
}
