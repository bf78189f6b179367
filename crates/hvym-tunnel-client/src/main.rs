//! `hvym-tunnel`
//!
//! Command-line front end for the tunnel client engine: loads the
//! settings file and signing identity, connects to the relay, and
//! forwards relayed requests to local services until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use hvym_tunnel_client::{PortBinding, TunnelClient, TunnelConfig, TunnelEvent};
use hvym_tunnel_core::store::{ConfigStore, JsonConfigStore};
use hvym_tunnel_core::tracing_init::init_tracing;
use hvym_tunnel_crypto::{SigningIdentity as _, StellarKeyPair};

#[derive(Parser, Debug)]
#[command(name = "hvym-tunnel")]
#[command(version, about = "Expose local services through an HVYM relay")]
struct Args {
    /// Relay WebSocket URL; overrides the settings file
    #[arg(long, env = "HVYM_TUNNEL_SERVER_URL")]
    server_url: Option<String>,

    /// Path to the Ed25519 identity key (created on first run)
    #[arg(long, env = "HVYM_TUNNEL_IDENTITY_KEY")]
    identity_key: Option<PathBuf>,

    /// Settings file path
    #[arg(long, env = "HVYM_TUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// Service binding as `name=port`; repeatable, overrides the settings
    /// file when given
    #[arg(long = "bind", value_parser = parse_binding)]
    bindings: Vec<PortBinding>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, default_value = "info", env = "HVYM_TUNNEL_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, env = "HVYM_TUNNEL_LOG_JSON")]
    log_json: bool,
}

fn parse_binding(raw: &str) -> Result<PortBinding, String> {
    let (service, port) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=port, got: {raw}"))?;
    if service.is_empty() {
        return Err(format!("empty service name in binding: {raw}"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port in binding: {raw}"))?;
    Ok(PortBinding::new(service, port))
}

/// Default identity key path: `<config dir>/hvym-tunnel/identity.key`.
fn default_identity_path() -> anyhow::Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Cannot determine config directory"))?;
    Ok(dir.join("hvym-tunnel").join("identity.key"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!(
        "hvym_tunnel_client={0},hvym_tunnel_core={0},hvym_tunnel_crypto={0}",
        args.log_level
    );
    init_tracing(&log_filter, args.log_json);

    let config_path = match args.config {
        Some(path) => path,
        None => JsonConfigStore::default_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine config directory"))?,
    };
    info!(path = %config_path.display(), "Loading settings");
    let store = Arc::new(JsonConfigStore::new(config_path));
    let record = store.load()?;

    let identity_path = match args.identity_key {
        Some(path) => path,
        None => default_identity_path()?,
    };
    let identity = StellarKeyPair::load_or_generate(&identity_path)?;
    info!(address = %identity.address(), "Loaded identity");

    let server_url = args.server_url.unwrap_or_else(|| record.server_url.clone());
    let bindings: Vec<PortBinding> = if args.bindings.is_empty() {
        record
            .port_bindings
            .iter()
            .map(|(service, &port)| PortBinding::new(service.clone(), port))
            .collect()
    } else {
        args.bindings
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        %server_url,
        services = bindings.len(),
        "Starting hvym-tunnel"
    );

    let client = TunnelClient::new(TunnelConfig::new(server_url), Arc::new(identity), &bindings)?
        .with_config_store(store);

    // Surface engine events as log lines; a GUI embedder would render
    // these instead.
    if let Some(mut events) = client.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TunnelEvent::Connected { endpoint } => {
                        info!(%endpoint, "Tunnel is live");
                    }
                    TunnelEvent::Disconnected => info!("Tunnel session ended"),
                    TunnelEvent::Error { message } => warn!(%message, "Tunnel error"),
                    TunnelEvent::StateChanged(_) => {}
                }
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run = client.run(shutdown_rx);
    tokio::pin!(run);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        // Ends on its own only for a terminal failure.
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            let _ = shutdown_tx.send(true);
            run.await?;
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            let _ = shutdown_tx.send(true);
            run.await?;
        }
    }

    info!("Tunnel stopped");
    Ok(())
}
