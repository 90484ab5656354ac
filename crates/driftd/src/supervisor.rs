//! Transfer supervisor. Owns every transfer task.
//!
//! Inbound: an accepted connection is matched to a known peer by source
//! address, secured with that peer's advertised key and served. Outbound:
//! a user request is resolved to a peer, dialled, secured and sent. Each
//! connection runs in its own task; all of them stop on cancellation.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use drift_core::Keypair;
use drift_services::transfer::{self, InboundSummary};
use drift_services::{Peer, PeerRegistry, PromptGateway, SecureStream, SendOutcome, TransferRequest};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Default upper bound on the preamble exchange. Dialling is left to the OS.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Supervisor<G> {
    keypair: Arc<Keypair>,
    registry: PeerRegistry,
    gateway: Arc<G>,
    download_dir: PathBuf,
    cancel: CancellationToken,
    handshake_timeout: Duration,
    tasks: JoinSet<()>,
}

impl<G: PromptGateway> Supervisor<G> {
    pub fn new(
        keypair: Arc<Keypair>,
        registry: PeerRegistry,
        gateway: Arc<G>,
        download_dir: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            keypair,
            registry,
            gateway,
            download_dir,
            cancel,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            tasks: JoinSet::new(),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Run until cancelled or until every input channel has closed, then
    /// wait for in-flight transfers to wind down.
    pub async fn run(
        mut self,
        mut connections: mpsc::Receiver<(TcpStream, SocketAddr)>,
        mut errors: mpsc::Receiver<io::Error>,
        mut requests: mpsc::Receiver<TransferRequest>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some((stream, addr)) = connections.recv() => self.spawn_inbound(stream, addr),

                Some(request) = requests.recv() => self.spawn_outbound(request),

                Some(e) = errors.recv() => {
                    tracing::error!(error = %e, "acceptor reported an error");
                }

                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "transfer task failed");
                    }
                }

                else => break,
            }
        }

        tracing::debug!(running = self.tasks.len(), "supervisor draining transfers");
        while self.tasks.join_next().await.is_some() {}
        tracing::info!("supervisor stopped");
    }

    fn spawn_inbound(&mut self, stream: TcpStream, addr: SocketAddr) {
        let ctx = self.context();
        self.tasks.spawn(async move {
            match ctx.inbound(stream, addr).await {
                Ok(Some(summary)) => tracing::info!(
                    %addr,
                    stored = summary.stored.len(),
                    declined = summary.declined,
                    "inbound connection finished"
                ),
                Ok(None) => {}
                Err(e) => tracing::warn!(%addr, error = %e, "inbound transfer failed"),
            }
        });
    }

    fn spawn_outbound(&mut self, request: TransferRequest) {
        let ctx = self.context();
        self.tasks.spawn(async move { ctx.outbound(request).await });
    }

    fn context(&self) -> TaskContext<G> {
        TaskContext {
            keypair: self.keypair.clone(),
            registry: self.registry.clone(),
            gateway: self.gateway.clone(),
            download_dir: self.download_dir.clone(),
            cancel: self.cancel.clone(),
            handshake_timeout: self.handshake_timeout,
        }
    }
}

// ── Per-connection tasks ──────────────────────────────────────────────────────

struct TaskContext<G> {
    keypair: Arc<Keypair>,
    registry: PeerRegistry,
    gateway: Arc<G>,
    download_dir: PathBuf,
    cancel: CancellationToken,
    handshake_timeout: Duration,
}

#[derive(Debug, Error)]
enum ConnectError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Handshake(#[from] drift_services::secure_stream::SecureStreamError),
    #[error("timed out")]
    TimedOut,
    #[error("cancelled")]
    Cancelled,
}

impl<G: PromptGateway> TaskContext<G> {
    /// `Ok(None)` means the connection was dropped before any transfer.
    async fn inbound(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<Option<InboundSummary>, transfer::TransferError> {
        let Some(peer) = self.registry.get_by_address(addr.ip()) else {
            tracing::warn!(%addr, "connection from unknown address, closing");
            return Ok(None);
        };
        let peer_key = match peer.public_key() {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(peer = %peer.instance, error = %e, "peer has no usable key, closing");
                return Ok(None);
            }
        };

        let secure = match self.secure(stream, &peer_key).await {
            Ok(secure) => secure,
            Err(e) => {
                tracing::warn!(peer = %peer.instance, error = %e, "inbound handshake failed");
                return Ok(None);
            }
        };
        tracing::debug!(peer = %peer.instance, %addr, "inbound connection secured");

        let summary = transfer::serve_inbound(
            secure,
            peer.display_name(),
            self.gateway.as_ref(),
            &self.download_dir,
            &self.cancel,
        )
        .await?;
        Ok(Some(summary))
    }

    async fn outbound(&self, request: TransferRequest) {
        let Some(peer) = self.registry.get_by_instance(&request.to) else {
            self.gateway.notify(format!("User {} not found", request.to));
            return;
        };

        let stream = match self.dial(&peer).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(peer = %peer.instance, error = %e, "dial failed");
                self.gateway
                    .notify(format!("Unable to connect to peer: {}", request.to));
                return;
            }
        };

        match transfer::send_files(stream, &request.paths, &self.cancel).await {
            Ok(SendOutcome::Delivered { files, bytes }) => {
                tracing::info!(peer = %peer.instance, files, bytes, "transfer complete");
                let note = match request.paths.as_slice() {
                    [single] => format!("File sent: {}", single.display()),
                    many => format!("Batch sent: {} files", many.len()),
                };
                self.gateway.notify(note);
            }
            Ok(SendOutcome::Declined) => {
                self.gateway
                    .notify(format!("{} declined the transfer", peer.display_name()));
            }
            Err(e) => {
                tracing::warn!(peer = %peer.instance, error = %e, "outbound transfer failed");
                self.gateway
                    .notify(format!("Transfer to {} failed: {e}", peer.display_name()));
            }
        }
    }

    /// Connect to the peer's first address and secure the connection.
    async fn dial(&self, peer: &Peer) -> Result<SecureStream<TcpStream>, ConnectError> {
        let addr = peer
            .first_address()
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "peer has no address"))?;
        let peer_key = peer
            .public_key()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ConnectError::Cancelled),
            dialled = TcpStream::connect(addr) => dialled?,
        };
        stream.set_nodelay(true)?;
        tracing::debug!(peer = %peer.instance, %addr, "connected");
        self.secure(stream, &peer_key).await
    }

    async fn secure(
        &self,
        stream: TcpStream,
        peer_key: &[u8; drift_core::crypto::KEY_LEN],
    ) -> Result<SecureStream<TcpStream>, ConnectError> {
        let handshake = SecureStream::handshake(stream, &self.keypair, peer_key);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConnectError::Cancelled),
            secured = tokio::time::timeout(self.handshake_timeout, handshake) => {
                Ok(secured.map_err(|_| ConnectError::TimedOut)??)
            }
        }
    }
}
