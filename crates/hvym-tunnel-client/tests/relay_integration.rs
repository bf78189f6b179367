//! End-to-end tests against a mock relay speaking the real wire protocol
//! over a real WebSocket, plus a raw-TCP local HTTP service.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{WebSocketStream, accept_async};

use hvym_tunnel_client::{PortBinding, TunnelClient, TunnelConfig, TunnelError, TunnelEvent, TunnelState};
use hvym_tunnel_core::store::{ConfigStore, MemoryConfigStore};
use hvym_tunnel_crypto::{SigningIdentity as _, StellarKeyPair, verify_signature};
use hvym_tunnel_proto::{Message, codec};

type Ws = WebSocketStream<TcpStream>;

async fn send(ws: &mut Ws, msg: &Message) {
    let text = codec::encode(msg).unwrap();
    ws.send(WsMessage::Text(text.into())).await.unwrap();
}

/// Next protocol frame, skipping WebSocket-level control frames.
async fn recv(ws: &mut Ws) -> Option<Message> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => return Some(codec::decode(text.as_str()).unwrap()),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Drive one relay-side handshake: challenge, verify the signature,
/// grant, and accept the bind. Returns the authenticated address.
async fn serve_handshake(ws: &mut Ws, endpoint: &str) -> String {
    let nonce_bytes = b"integration-nonce".to_vec();
    send(
        ws,
        &Message::Challenge {
            nonce: codec::encode_body(&nonce_bytes),
        },
    )
    .await;

    let Some(Message::Auth {
        address,
        nonce,
        signature,
    }) = recv(ws).await
    else {
        panic!("expected auth frame");
    };
    assert_eq!(codec::decode_body(&nonce).unwrap(), nonce_bytes);
    let sig = codec::decode_body(&signature).unwrap();
    assert!(verify_signature(&address, &nonce_bytes, &sig));

    send(
        ws,
        &Message::AuthOk {
            token: "session-token".into(),
            endpoint: endpoint.to_string(),
        },
    )
    .await;

    let Some(Message::Bind { services }) = recv(ws).await else {
        panic!("expected bind frame");
    };
    assert!(services.contains_key("pintheon"));
    send(ws, &Message::BindOk).await;

    address
}

/// Accept loop that skips non-WebSocket connections (the client's
/// advisory discovery request hits the same port with plain HTTP).
async fn accept_ws(listener: &TcpListener) -> Ws {
    loop {
        let (stream, _) = listener.accept().await.unwrap();
        if let Ok(ws) = accept_async(stream).await {
            return ws;
        }
    }
}

/// Local HTTP service that answers every request with 200 and a fixed
/// body.
async fn spawn_local_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let body = b"local says hi";
                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(body).await;
            });
        }
    });
    port
}

fn fast_config(relay_port: u16) -> TunnelConfig {
    let mut config = TunnelConfig::new(format!("ws://127.0.0.1:{relay_port}/connect"));
    config.reconnect.initial_delay = Duration::from_millis(50);
    config.reconnect.max_delay = Duration::from_millis(200);
    config
}

async fn wait_for_connected(events: &mut tokio::sync::mpsc::UnboundedReceiver<TunnelEvent>) -> String {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for connected event")
            .expect("event stream ended");
        if let TunnelEvent::Connected { endpoint } = event {
            return endpoint;
        }
    }
}

#[tokio::test]
async fn full_session_forwards_requests() {
    let local_port = spawn_local_service().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = listener.local_addr().unwrap().port();

    let identity = StellarKeyPair::generate();
    let client_address = identity.address();
    let (forwarded_tx, forwarded_rx) = tokio::sync::oneshot::channel();

    let relay = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let address = serve_handshake(&mut ws, "https://g1.tunnel.hvym.link").await;
        assert_eq!(address, client_address);

        send(
            &mut ws,
            &Message::Request {
                id: "r1".into(),
                service: "pintheon".into(),
                method: "GET".into(),
                path: "/hello".into(),
                query: Some("who=relay".into()),
                headers: [("x-trace-id".to_string(), "1".to_string())]
                    .into_iter()
                    .collect(),
                body: None,
            },
        )
        .await;

        let Some(Message::Response { id, status, body, .. }) = recv(&mut ws).await else {
            panic!("expected response frame");
        };
        assert_eq!(id, "r1");
        assert_eq!(status, 200);
        assert_eq!(codec::decode_body(&body.unwrap()).unwrap(), b"local says hi");
        forwarded_tx.send(()).unwrap();

        // Hold the session open until the client hangs up.
        while recv(&mut ws).await.is_some() {}
    });

    let store = Arc::new(MemoryConfigStore::default());
    let client = TunnelClient::new(
        fast_config(relay_port),
        Arc::new(identity),
        &[PortBinding::new("pintheon", local_port)],
    )
    .unwrap()
    .with_config_store(store.clone());

    let mut events = client.take_events().unwrap();
    let handle = client.spawn();

    let endpoint = wait_for_connected(&mut events).await;
    assert_eq!(endpoint, "https://g1.tunnel.hvym.link");
    assert_eq!(handle.state(), TunnelState::Connected);
    assert_eq!(
        store.load().unwrap().last_endpoint.as_deref(),
        Some("https://g1.tunnel.hvym.link")
    );

    // Relay has verified the forwarded response.
    tokio::time::timeout(Duration::from_secs(5), forwarded_rx)
        .await
        .unwrap()
        .unwrap();

    handle.stop();
    handle.join().await.unwrap();
    assert!(store.load().unwrap().last_endpoint.is_none());
    relay.await.unwrap();
}

#[tokio::test]
async fn reconnects_after_relay_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        // First session: grant and immediately drop the socket.
        let mut ws = accept_ws(&listener).await;
        serve_handshake(&mut ws, "https://g1.tunnel.hvym.link").await;
        drop(ws);

        // Second session: grant and hold until the client goes away.
        let mut ws = accept_ws(&listener).await;
        serve_handshake(&mut ws, "https://g1.tunnel.hvym.link").await;
        while recv(&mut ws).await.is_some() {}
    });

    let client = TunnelClient::new(
        fast_config(relay_port),
        Arc::new(StellarKeyPair::generate()),
        &[PortBinding::new("pintheon", 9998)],
    )
    .unwrap();

    let mut events = client.take_events().unwrap();
    let handle = client.spawn();

    wait_for_connected(&mut events).await;
    // The relay drops the first session; the client must come back on
    // its own.
    wait_for_connected(&mut events).await;
    assert_eq!(handle.state(), TunnelState::Connected);

    handle.stop();
    handle.join().await.unwrap();
    assert_eq!(handle_state_after(&mut events).await, TunnelState::Disconnected);
    relay.abort();
}

/// Drain remaining events and return the final observed state.
async fn handle_state_after(
    events: &mut tokio::sync::mpsc::UnboundedReceiver<TunnelEvent>,
) -> TunnelState {
    let mut last = TunnelState::Connected;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_millis(200), events.recv()).await
    {
        if let TunnelEvent::StateChanged(state) = event {
            last = state;
        }
    }
    last
}

#[tokio::test]
async fn terminal_auth_rejection_fails_without_retry() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = listener.local_addr().unwrap().port();

    let relay = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        send(
            &mut ws,
            &Message::Challenge {
                nonce: codec::encode_body(b"nonce"),
            },
        )
        .await;
        let _ = recv(&mut ws).await;
        send(
            &mut ws,
            &Message::AuthError {
                reason: "unknown address".into(),
            },
        )
        .await;
    });

    let client = TunnelClient::new(
        fast_config(relay_port),
        Arc::new(StellarKeyPair::generate()),
        &[PortBinding::new("pintheon", 9998)],
    )
    .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let err = client.run(shutdown_rx).await.unwrap_err();
    assert!(matches!(err, TunnelError::AuthRejected(_)));
    assert_eq!(client.state(), TunnelState::Failed);
    relay.await.unwrap();
}

#[tokio::test]
async fn stop_mid_handshake_aborts_cleanly() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = listener.local_addr().unwrap().port();

    // Accept the WebSocket but never send a challenge, so the client
    // sits in the handshake.
    let relay = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        while recv(&mut ws).await.is_some() {}
    });

    let client = TunnelClient::new(
        fast_config(relay_port),
        Arc::new(StellarKeyPair::generate()),
        &[PortBinding::new("pintheon", 9998)],
    )
    .unwrap();

    let mut state = client.watch_state();
    let handle = client.spawn();

    tokio::time::timeout(Duration::from_secs(5), async {
        while *state.borrow() != TunnelState::Authenticating {
            state.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    handle.stop();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*state.borrow(), TunnelState::Disconnected);
    relay.abort();
}

#[tokio::test]
async fn stop_during_backoff_returns_cleanly() {
    // Nothing is listening on the relay port; the client cycles through
    // Connecting/Reconnecting.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = fast_config(relay_port);
    // Long enough that the stop lands during the backoff sleep.
    config.reconnect.initial_delay = Duration::from_secs(30);

    let client = TunnelClient::new(
        config,
        Arc::new(StellarKeyPair::generate()),
        &[PortBinding::new("pintheon", 9998)],
    )
    .unwrap();

    let mut state = client.watch_state();
    let handle = client.spawn();

    // Wait until the client is sitting in the backoff delay.
    tokio::time::timeout(Duration::from_secs(5), async {
        while *state.borrow() != TunnelState::Reconnecting {
            state.changed().await.unwrap();
        }
    })
    .await
    .unwrap();

    handle.stop();
    tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn retries_exhausted_moves_to_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = fast_config(relay_port);
    config.reconnect.initial_delay = Duration::from_millis(10);
    config.reconnect.max_attempts = Some(2);

    let client = TunnelClient::new(
        config,
        Arc::new(StellarKeyPair::generate()),
        &[PortBinding::new("pintheon", 9998)],
    )
    .unwrap();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let err = client.run(shutdown_rx).await.unwrap_err();
    assert!(matches!(err, TunnelError::Connection(_) | TunnelError::Timeout(_)));
    assert_eq!(client.state(), TunnelState::Failed);
}
