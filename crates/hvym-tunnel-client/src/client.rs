//! The tunnel client engine: connection supervisor and steady-state loop.
//!
//! [`TunnelClient::run`] owns the whole lifecycle: connect, authenticate,
//! bind, forward, and reconnect with backoff until shut down. Callers
//! observe progress through a [`watch`] channel of [`TunnelState`] and an
//! event stream; they never see protocol frames.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, info, warn};

use hvym_tunnel_core::store::ConfigStore;
use hvym_tunnel_crypto::SigningIdentity;
use hvym_tunnel_proto::Message;

use crate::auth;
use crate::config::{PortBinding, TunnelConfig, validate_bindings};
use crate::discovery::DiscoveryClient;
use crate::error::TunnelError;
use crate::event::{TunnelEvent, TunnelState};
use crate::forwarder::{ForwardedRequest, Forwarder};
use crate::session::Session;
use crate::transport::Transport;

/// One step of the steady-state loop, resolved from the select so the
/// handlers below can borrow the transport freely.
enum Step {
    Inbound(Option<Message>),
    PingTick,
    PongTimeout,
    Shutdown,
}

/// Exposes local HTTP services through a remote relay.
pub struct TunnelClient {
    config: TunnelConfig,
    identity: Arc<dyn SigningIdentity>,
    bindings: BTreeMap<String, u16>,
    store: Option<Arc<dyn ConfigStore>>,
    discovery: DiscoveryClient,
    state_tx: watch::Sender<TunnelState>,
    events_tx: mpsc::UnboundedSender<TunnelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TunnelEvent>>>,
}

impl TunnelClient {
    /// Create a client for the given identity and service bindings.
    /// The binding set is validated here and fixed for the client's
    /// lifetime.
    pub fn new(
        config: TunnelConfig,
        identity: Arc<dyn SigningIdentity>,
        bindings: &[PortBinding],
    ) -> Result<Self, TunnelError> {
        let bindings = validate_bindings(bindings)?;
        let (state_tx, _) = watch::channel(TunnelState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            identity,
            bindings,
            store: None,
            discovery: DiscoveryClient::default(),
            state_tx,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Attach a config store; the engine will persist the discovered relay
    /// address and the current public endpoint into it.
    #[must_use]
    pub fn with_config_store(mut self, store: Arc<dyn ConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Take the event stream. Yields `Some` exactly once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TunnelEvent>> {
        self.events_rx.lock().ok()?.take()
    }

    /// Current state.
    pub fn state(&self) -> TunnelState {
        *self.state_tx.borrow()
    }

    /// A watch receiver over state transitions.
    pub fn watch_state(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    /// Run until shut down or a terminal failure.
    ///
    /// Retries with jittered exponential backoff on transient errors; the
    /// attempt counter resets once a session authenticates, so a long-lived
    /// tunnel that drops starts over from the shortest delay. Terminal
    /// errors (rejected credentials, invalid bindings) move the client to
    /// [`TunnelState::Failed`] and return the error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), TunnelError> {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                self.set_state(TunnelState::Disconnected);
                return Ok(());
            }

            match self.connect_once(&mut shutdown, &mut attempt).await {
                Ok(()) => {
                    // Caller-initiated stop.
                    self.set_state(TunnelState::Disconnected);
                    return Ok(());
                }
                Err(e) if e.is_terminal() => {
                    warn!(error = %e, "Tunnel failed");
                    self.emit(TunnelEvent::Error {
                        message: e.to_string(),
                    });
                    self.set_state(TunnelState::Failed);
                    return Err(e);
                }
                Err(e) => {
                    self.emit(TunnelEvent::Error {
                        message: e.to_string(),
                    });
                    if !self.config.reconnect.should_retry(attempt) {
                        warn!(error = %e, attempt, "Retries exhausted");
                        self.set_state(TunnelState::Failed);
                        return Err(e);
                    }
                    let delay = self.config.reconnect.jittered_delay(attempt);
                    attempt += 1;
                    info!(error = %e, attempt, ?delay, "Reconnecting after delay");
                    self.set_state(TunnelState::Reconnecting);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            self.set_state(TunnelState::Disconnected);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) on its own task, returning a handle that
    /// can stop it and await its result.
    #[must_use]
    pub fn spawn(self) -> TunnelHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = self.watch_state();
        let task = tokio::spawn(async move { self.run(shutdown_rx).await });
        TunnelHandle {
            shutdown_tx,
            state,
            task,
        }
    }

    /// One connection lifecycle: dial, authenticate, bind, then forward
    /// until the link drops. `Ok(())` means shutdown was requested.
    async fn connect_once(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> Result<(), TunnelError> {
        self.set_state(TunnelState::Connecting);
        self.maybe_discover().await;

        let handshake = self.handshake();
        let (mut transport, session) = tokio::select! {
            result = handshake => result?,
            _ = shutdown.changed() => return Ok(()),
        };
        // Authentication succeeded: the next failure starts backoff from
        // the shortest delay again.
        *attempt = 0;

        self.set_state(TunnelState::Connected);
        info!(endpoint = %session.endpoint, "Tunnel established");
        if let Some(store) = &self.store {
            if let Err(e) = store.set_last_endpoint(&session.endpoint) {
                warn!(error = %e, "Failed to persist endpoint");
            }
        }
        self.emit(TunnelEvent::Connected {
            endpoint: session.endpoint.clone(),
        });

        let forwarder = Forwarder::new(
            self.bindings.clone(),
            transport.sender(),
            self.config.dispatch_timeout,
            self.config.max_concurrent_dispatches,
        );

        let result = self.steady_loop(&mut transport, &forwarder, shutdown).await;

        forwarder.abort_all().await;
        if let Some(store) = &self.store {
            if let Err(e) = store.clear_last_endpoint() {
                warn!(error = %e, "Failed to clear endpoint");
            }
        }
        self.emit(TunnelEvent::Disconnected);
        result
    }

    /// Dial the relay, authenticate, and register bindings.
    async fn handshake(&self) -> Result<(Transport, Session), TunnelError> {
        let mut transport =
            Transport::connect(&self.config.server_url, self.config.connect_timeout).await?;

        self.set_state(TunnelState::Authenticating);
        let grant = auth::negotiate(&mut transport, self.identity.as_ref(), &self.config).await?;

        transport
            .send(Message::Bind {
                services: self.bindings.clone(),
            })
            .await?;
        loop {
            match transport
                .recv_timeout(self.config.bind_timeout, "bind_ok")
                .await?
            {
                Message::BindOk => break,
                Message::Ping => transport.send(Message::Pong).await?,
                Message::Error { reason, .. } => return Err(TunnelError::Bind(reason)),
                other => {
                    return Err(TunnelError::Protocol(format!(
                        "expected bind_ok, got {}",
                        other.kind()
                    )));
                }
            }
        }

        Ok((transport, Session::new(grant.token, grant.endpoint)))
    }

    /// Forward requests and keep the link alive until it drops or the
    /// caller shuts down.
    async fn steady_loop(
        &self,
        transport: &mut Transport,
        forwarder: &Forwarder,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; a ping right after bind_ok is
        // just noise.
        ping.tick().await;

        // Armed while a pong is outstanding.
        let mut pong_deadline: Option<Pin<Box<Sleep>>> = None;

        loop {
            let step = tokio::select! {
                msg = transport.recv() => Step::Inbound(msg),
                _ = ping.tick() => Step::PingTick,
                () = async {
                    match pong_deadline.as_mut() {
                        Some(deadline) => deadline.await,
                        None => std::future::pending().await,
                    }
                } => Step::PongTimeout,
                _ = shutdown.changed() => Step::Shutdown,
            };

            match step {
                Step::Inbound(None) => {
                    return Err(TunnelError::Connection(
                        "relay closed the connection".into(),
                    ));
                }
                Step::Inbound(Some(msg)) => match msg {
                    Message::Request {
                        id,
                        service,
                        method,
                        path,
                        query,
                        headers,
                        body,
                    } => {
                        forwarder
                            .dispatch(ForwardedRequest {
                                id,
                                service,
                                method,
                                path,
                                query,
                                headers,
                                body,
                            })
                            .await;
                    }
                    Message::Ping => transport.send(Message::Pong).await?,
                    Message::Pong => {
                        pong_deadline = None;
                    }
                    Message::Error { id: None, reason } => {
                        warn!(%reason, "Relay reported session error");
                        self.emit(TunnelEvent::Error { message: reason });
                    }
                    Message::Error {
                        id: Some(id),
                        reason,
                    } => {
                        debug!(%id, %reason, "Relay reported request error");
                    }
                    other => {
                        debug!(kind = other.kind(), "Ignoring unexpected frame");
                    }
                },
                Step::PingTick => {
                    transport.send(Message::Ping).await?;
                    if pong_deadline.is_none() {
                        pong_deadline =
                            Some(Box::pin(tokio::time::sleep(self.config.pong_timeout)));
                    }
                }
                Step::PongTimeout => return Err(TunnelError::HeartbeatTimeout),
                Step::Shutdown => return Ok(()),
            }
        }
    }

    /// Discovery is advisory: failures are logged and the connection
    /// proceeds. Only runs when a store is attached to persist into, and
    /// only when the store has no relay address yet or the address was
    /// recorded for a different server URL. A pinned address for the
    /// current URL is never overwritten.
    async fn maybe_discover(&self) {
        let Some(store) = &self.store else { return };
        let mut record = match store.load() {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Failed to load settings before discovery");
                return;
            }
        };
        if !record.server_address.is_empty() && record.server_url == self.config.server_url {
            return;
        }
        if let Some(address) = self
            .discovery
            .fetch_server_address(&self.config.server_url)
            .await
        {
            // Store the URL alongside the address so a later URL change
            // is detectable.
            record.server_address = address;
            record.server_url.clone_from(&self.config.server_url);
            if let Err(e) = store.save(&record) {
                warn!(error = %e, "Failed to persist relay address");
            }
        }
    }

    fn set_state(&self, state: TunnelState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Tunnel state changed");
            self.emit(TunnelEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: TunnelEvent) {
        // A dropped receiver just means nobody is listening.
        let _ = self.events_tx.send(event);
    }
}

/// Handle to a spawned tunnel task.
pub struct TunnelHandle {
    shutdown_tx: watch::Sender<bool>,
    state: watch::Receiver<TunnelState>,
    task: JoinHandle<Result<(), TunnelError>>,
}

impl TunnelHandle {
    /// Request a graceful stop. Idempotent; safe from any state.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Current state of the spawned client.
    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Await the client task's result.
    pub async fn join(self) -> Result<(), TunnelError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(TunnelError::Connection(format!(
                "tunnel task panicked: {e}"
            ))),
        }
    }

    /// Stop and wait for the task to finish.
    pub async fn shutdown(self) -> Result<(), TunnelError> {
        self.stop();
        self.join().await
    }
}
