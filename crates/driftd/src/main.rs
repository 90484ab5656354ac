//! driftd: Drift LAN file-transfer daemon.
//!
//! Usage: `driftd [identity]`. The optional argument overrides the
//! configured instance name.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use drift_core::config::{self, DriftConfig};
use drift_core::dns::ServiceType;
use drift_core::Keypair;
use drift_services::gateway::GatewayChannels;
use drift_services::peer::{TXT_DISPLAY_NAME, TXT_OS, TXT_PUBLIC_KEY, TXT_VERSION};
use drift_services::{MemoryGateway, PeerRegistry};
use driftd::console::Console;
use driftd::mdns::{self, LocalService};
use driftd::{acceptor, Supervisor};
use tokio_util::sync::CancellationToken;

const PROTOCOL_VERSION: &str = "0.1";

/// How long shutdown waits for goodbyes and in-flight transfers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Load config
    let config_path = DriftConfig::file_path();
    if let Err(e) = DriftConfig::write_default_if_missing(&config_path) {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = DriftConfig::load().context("refusing to start with invalid configuration")?;
    if let Some(identity) = std::env::args().nth(1) {
        config.identity = Some(identity);
        config.validate().context("invalid identity argument")?;
    }

    let hostname = hostname();
    let identity = config
        .identity
        .clone()
        .unwrap_or_else(|| config::default_identity(&user_name(), &hostname));
    tracing::info!(
        identity,
        download_dir = %config.download_dir.display(),
        accept_timeout = ?config.accept_timeout,
        "driftd starting"
    );

    // Keypair, fresh every run
    let keypair = Arc::new(Keypair::generate());
    tracing::info!(public_key = %keypair.public_hex(), "keypair ready");

    // ── Shutdown ─────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            cancel.cancel();
        });
    }

    // ── Transfers listener ───────────────────────────────────────────────────
    let acceptor = acceptor::start(cancel.clone()).context("failed to start transfer listener")?;

    // ── Discovery ────────────────────────────────────────────────────────────
    let registry = PeerRegistry::new();
    let service = ServiceType::new(&config.network.service_type, &config.network.domain)
        .context("invalid service type")?;
    let local = LocalService {
        service,
        instance: identity.clone(),
        host: host_label(&hostname),
        port: acceptor.port,
        txt: vec![
            format!("{TXT_VERSION}={PROTOCOL_VERSION}"),
            format!("{TXT_DISPLAY_NAME}={identity}"),
            format!("{TXT_PUBLIC_KEY}={}", keypair.public_hex()),
            format!("{TXT_OS}={}", std::env::consts::OS),
        ],
    };
    let engine = mdns::Engine::new(
        local,
        config.network.interfaces.clone(),
        registry.clone(),
        cancel.clone(),
    )
    .context("failed to start mDNS")?;

    // ── Gateway and front-end ────────────────────────────────────────────────
    let (gateway, channels) = MemoryGateway::new(config.accept_timeout, cancel.clone());
    let GatewayChannels {
        prompts,
        notifications,
        requests,
    } = channels;

    // ── Spawn tasks ──────────────────────────────────────────────────────────
    let mdns_task = tokio::spawn(engine.run());

    let supervisor_task = tokio::spawn(
        Supervisor::new(
            keypair,
            registry.clone(),
            gateway.clone(),
            config.download_dir.clone(),
            cancel.clone(),
        )
        .run(acceptor.connections, acceptor.errors, requests),
    );

    let console_task = tokio::spawn(
        Console::new(gateway, registry, prompts, notifications, cancel.clone()).run(),
    );

    cancel.cancelled().await;
    tracing::info!("shutting down");

    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = tokio::join!(mdns_task, supervisor_task, console_task, acceptor.task);
    })
    .await;
    if drained.is_err() {
        tracing::warn!("tasks still running after {SHUTDOWN_GRACE:?}, exiting anyway");
    }
    Ok(())
}

fn hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "gethostname failed");
            "drift".to_string()
        }
    }
}

fn user_name() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "Someone".to_string())
}

/// First label of the hostname, reduced to letters, digits and hyphens.
fn host_label(hostname: &str) -> String {
    let label: String = hostname
        .split('.')
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .take(63)
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        "drift".to_string()
    } else {
        label.to_string()
    }
}
