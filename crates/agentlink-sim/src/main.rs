//! agentlink-sim: drives the connection core against simulated collaborators
//!
//! Connects, changes NetShield, optionally drops the agent link to show a
//! reconnection, then disconnects, printing every state transition.

use agentlink::sim::{LocalIssuer, ProbeOutcome, RecordingFilter, SimAgent, SimulatedLayer};
use agentlink::{
    CertificateStore, ConnectionConfig, ConnectionState, ConnectionStateMachine, NetShieldLevel,
    ProtocolPreference, RejectReason, SettingsSnapshot, TransportKind,
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Simulated VPN connection run
#[derive(Parser)]
#[command(name = "agentlink-sim")]
#[command(version)]
#[command(about = "Exercise the VPN connection core against simulated transports", long_about = None)]
struct Cli {
    /// Connection configuration (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Transports that refuse connections (comma separated)
    #[arg(long, value_delimiter = ',')]
    fail: Vec<TransportKind>,

    /// Connect over one transport instead of the smart order
    #[arg(short, long)]
    protocol: Option<TransportKind>,

    /// Agent rejects the first handshake with an expired certificate
    #[arg(long)]
    reject_once: bool,

    /// Drop the agent link once connected
    #[arg(long)]
    drop_link: bool,

    /// Enable the kill switch
    #[arg(long)]
    kill_switch: bool,

    /// Allow LAN traffic while the kill switch blocks
    #[arg(long)]
    lan: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(false)
        .compact()
        .init();

    let config = match &cli.config {
        Some(path) => ConnectionConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConnectionConfig::default(),
    };

    let agent = SimAgent::new();
    let layer = SimulatedLayer::new(agent.clone());
    for kind in &cli.fail {
        layer.set_outcome(*kind, ProbeOutcome::Refuse, Duration::from_millis(150));
    }
    if cli.reject_once {
        agent.reject_next(1, RejectReason::CertificateExpired);
    }

    let preference = cli.protocol.map_or(ProtocolPreference::Smart, ProtocolPreference::Specific);
    let (settings, settings_rx) = watch::channel(SettingsSnapshot {
        kill_switch: cli.kill_switch,
        lan_access: cli.lan,
        protocol: preference,
        ..SettingsSnapshot::default()
    });

    let filter = RecordingFilter::new();
    let issuer = LocalIssuer::new(Duration::from_secs(86_400)).with_latency(Duration::from_millis(50));
    let certificates = Arc::new(CertificateStore::new(issuer.clone(), config.renewal_margin()));
    let connection_timeout = config.connection_timeout();

    let handle = ConnectionStateMachine::spawn(config, layer.clone(), filter.clone(), certificates, settings_rx)
        .context("Invalid connection configuration")?;

    let mut transitions = handle.transitions();
    let printer = tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                Ok(transition) => println!("{:>16} -> {}", transition.from, transition.to),
                Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "Transition log lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    info!(?preference, "Connecting");
    handle.connect_preferred().await?;
    let state = wait_settled(&handle, connection_timeout * 2).await?;

    if state.is_connected() {
        if let Some(candidate) = handle.candidate() {
            info!(%candidate, "Connected");
        }

        settings.send_modify(|s| s.netshield = NetShieldLevel::MalwareAndAds);
        tokio::time::sleep(Duration::from_millis(200)).await;
        info!(pushes = agent.feature_pushes().len(), "Feature sets pushed to agent");

        if cli.drop_link {
            info!("Dropping agent link");
            agent.drop_connections();
            handle
                .wait_for(|s| *s == ConnectionState::Reconnecting || s.error().is_some())
                .await?;
            let state = wait_settled(&handle, connection_timeout * 4).await?;
            info!(%state, "Link recovery finished");
        }
    }

    handle.disconnect().await?;
    handle
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await?;
    handle.shutdown().await;
    drop(handle);
    let _ = printer.await;

    println!();
    println!("candidates tried: {}", layer.attempts().len());
    println!("tunnels left open: {}", layer.live_tunnels());
    println!("certificates issued: {}", issuer.issued_count());
    println!("agent handshakes: {}", agent.handshakes());
    println!("filter operations: {:?}", filter.ops());

    if let Some(kind) = state.error() {
        bail!("Connection failed: {kind}");
    }
    Ok(())
}

/// Wait until the connection is up or has failed
async fn wait_settled(
    handle: &agentlink::ConnectionHandle,
    limit: Duration,
) -> Result<ConnectionState> {
    let settled = tokio::time::timeout(
        limit,
        handle.wait_for(|s| s.is_connected() || s.error().is_some()),
    )
    .await
    .context("Connection did not settle in time")??;
    Ok(settled)
}
