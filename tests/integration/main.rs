//! Drift integration test harness.
//!
//! Each test starts two or more in-process nodes on the loopback
//! interface: a real TCP acceptor, a transfer supervisor and an in-memory
//! gateway per node. Discovery is replaced by writing each node's record
//! straight into the other's peer registry, so no multicast is needed.
//!
//!   cargo test --test integration

mod hostile;
mod transfers;

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use drift_core::Keypair;
use drift_services::peer::{TXT_DISPLAY_NAME, TXT_PUBLIC_KEY, TXT_VERSION};
use drift_services::{MemoryGateway, Peer, PeerEvent, PeerRegistry, Prompt};
use driftd::{acceptor, Supervisor};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long any single expectation may take before the test fails.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

pub const LOOPBACK: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

/// One in-process Drift node.
pub struct Node {
    pub name: String,
    pub keypair: Arc<Keypair>,
    pub registry: PeerRegistry,
    pub gateway: Arc<MemoryGateway>,
    pub prompts: mpsc::Receiver<Prompt>,
    pub notifications: mpsc::Receiver<String>,
    pub port: u16,
    pub downloads: TempDir,
    pub cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl Node {
    pub async fn start(name: &str) -> Result<Node> {
        Self::start_with_timeout(name, Duration::from_secs(30)).await
    }

    pub async fn start_with_timeout(name: &str, accept_timeout: Duration) -> Result<Node> {
        Self::spawn(name, accept_timeout, driftd::supervisor::HANDSHAKE_TIMEOUT).await
    }

    pub async fn start_with_handshake_timeout(name: &str, handshake: Duration) -> Result<Node> {
        Self::spawn(name, Duration::from_secs(30), handshake).await
    }

    async fn spawn(name: &str, accept_timeout: Duration, handshake: Duration) -> Result<Node> {
        let cancel = CancellationToken::new();
        let keypair = Arc::new(Keypair::generate());
        let registry = PeerRegistry::new();
        let downloads = tempfile::tempdir().context("download dir")?;

        let acceptor = acceptor::start(cancel.clone())?;
        let (gateway, channels) = MemoryGateway::new(accept_timeout, cancel.clone());
        let supervisor = tokio::spawn(
            Supervisor::new(
                keypair.clone(),
                registry.clone(),
                gateway.clone(),
                downloads.path().to_path_buf(),
                cancel.clone(),
            )
            .with_handshake_timeout(handshake)
            .run(acceptor.connections, acceptor.errors, channels.requests),
        );

        Ok(Node {
            name: name.to_string(),
            keypair,
            registry,
            gateway,
            prompts: channels.prompts,
            notifications: channels.notifications,
            port: acceptor.port,
            downloads,
            cancel,
            supervisor,
        })
    }

    /// The record this node would announce over mDNS.
    pub fn peer_record(&self) -> Peer {
        Peer {
            instance: self.name.clone(),
            service: "_drift._tcp".into(),
            domain: "local".into(),
            hostname: format!("{}.local", self.name),
            port: self.port,
            addrs: vec![LOOPBACK],
            txt: vec![
                format!("{TXT_VERSION}=0.1"),
                format!("{TXT_DISPLAY_NAME}={}", self.name),
                format!("{TXT_PUBLIC_KEY}={}", self.keypair.public_hex()),
            ],
            ttl: Duration::from_secs(120),
            seen_at: Instant::now(),
        }
    }

    /// Make `other` known to this node, as discovery would.
    pub fn discovers(&self, other: &Node) {
        self.registry.apply(PeerEvent::Added(other.peer_record()));
    }

    pub async fn send(&self, to: &str, paths: Vec<PathBuf>) {
        assert!(self.gateway.request(to, paths).await, "supervisor is gone");
    }

    pub async fn next_prompt(&mut self) -> Prompt {
        tokio::time::timeout(STEP_TIMEOUT, self.prompts.recv())
            .await
            .expect("timed out waiting for a prompt")
            .expect("prompt channel closed")
    }

    pub async fn next_notification(&mut self) -> String {
        tokio::time::timeout(STEP_TIMEOUT, self.notifications.recv())
            .await
            .expect("timed out waiting for a notification")
            .expect("notification channel closed")
    }

    /// Fail if a prompt shows up within `window`.
    pub async fn expect_no_prompt(&mut self, window: Duration) {
        if let Ok(Some(prompt)) = tokio::time::timeout(window, self.prompts.recv()).await {
            panic!("unexpected prompt: {prompt:?}");
        }
    }

    /// Visible file names in the download directory, sorted.
    pub fn downloaded(&self) -> Vec<String> {
        list_dir(self.downloads.path())
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        tokio::time::timeout(STEP_TIMEOUT, self.supervisor)
            .await
            .expect("supervisor did not stop")
            .expect("supervisor panicked");
    }
}

pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| !n.starts_with('.'))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Write `len` bytes of a repeating pattern to `dir/name`.
pub fn write_file(dir: &Path, name: &str, len: usize) -> PathBuf {
    let path = dir.join(name);
    let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, data).unwrap();
    path
}

/// Two nodes that know each other.
pub async fn pair() -> (Node, Node) {
    let a = Node::start("alice").await.unwrap();
    let b = Node::start("bob").await.unwrap();
    a.discovers(&b);
    b.discovers(&a);
    (a, b)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn nodes_listen_on_distinct_ports() {
    let (a, b) = pair().await;
    assert_ne!(a.port, 0);
    assert_ne!(a.port, b.port);
    assert_eq!(a.registry.get_by_instance("bob").unwrap().port, b.port);
    assert_eq!(b.registry.get_by_address(LOOPBACK).unwrap().instance, "alice");
    a.shutdown().await;
    b.shutdown().await;
}
