//! The seam between the transfer engine and whatever asks the user.
//!
//! A gateway answers three needs of the engine: ask about one incoming
//! file, ask about an incoming batch, and post a notification. It also
//! feeds outbound transfer requests to the supervisor through a channel.
//!
//! `MemoryGateway` keeps open prompts in an in-process map keyed by prompt
//! id and publishes them on a channel. Whoever drains that channel (a test,
//! or the daemon's terminal front-end) answers by id.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use drift_core::message::{format_size, Answer};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const CHANNEL_CAPACITY: usize = 64;

/// One file in a batch prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

impl std::fmt::Display for FileInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, format_size(self.size))
    }
}

/// "Send these paths to that peer", as issued by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    /// Instance name of the destination peer.
    pub to: String,
    /// One path sends a single OFFER, more send a BATCH_OFFER.
    pub paths: Vec<PathBuf>,
}

pub trait PromptGateway: Send + Sync + 'static {
    /// Ask about a single file. Resolves to `Decline` on timeout or shutdown.
    fn ask(&self, question: String) -> impl Future<Output = Answer> + Send;

    /// Ask about a batch from `peer`. Same resolution rules as `ask`.
    fn ask_batch(&self, peer: String, files: Vec<FileInfo>) -> impl Future<Output = Answer> + Send;

    /// Fire-and-forget user notification.
    fn notify(&self, message: String);
}

// ── In-memory gateway ─────────────────────────────────────────────────────────

/// An open question waiting for `MemoryGateway::answer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    Single { id: u64, question: String },
    Batch { id: u64, peer: String, files: Vec<FileInfo> },
}

impl Prompt {
    pub fn id(&self) -> u64 {
        match self {
            Prompt::Single { id, .. } | Prompt::Batch { id, .. } => *id,
        }
    }
}

/// Receiving ends handed out by `MemoryGateway::new`.
#[derive(Debug)]
pub struct GatewayChannels {
    /// Prompts for the front-end to show.
    pub prompts: mpsc::Receiver<Prompt>,
    /// Notifications for the front-end to show.
    pub notifications: mpsc::Receiver<String>,
    /// Transfer requests for the supervisor.
    pub requests: mpsc::Receiver<TransferRequest>,
}

#[derive(Debug)]
pub struct MemoryGateway {
    pending: DashMap<u64, oneshot::Sender<Answer>>,
    next_id: AtomicU64,
    prompts: mpsc::Sender<Prompt>,
    notifications: mpsc::Sender<String>,
    requests: mpsc::Sender<TransferRequest>,
    deadline: Duration,
    cancel: CancellationToken,
}

impl MemoryGateway {
    /// `deadline` bounds every prompt; `cancel` declines everything open.
    pub fn new(deadline: Duration, cancel: CancellationToken) -> (Arc<Self>, GatewayChannels) {
        let (prompts_tx, prompts) = mpsc::channel(CHANNEL_CAPACITY);
        let (notifications_tx, notifications) = mpsc::channel(CHANNEL_CAPACITY);
        let (requests_tx, requests) = mpsc::channel(CHANNEL_CAPACITY);
        let gateway = Arc::new(Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            prompts: prompts_tx,
            notifications: notifications_tx,
            requests: requests_tx,
            deadline,
            cancel,
        });
        (
            gateway,
            GatewayChannels {
                prompts,
                notifications,
                requests,
            },
        )
    }

    /// Resolve an open prompt. False if it already timed out or was answered.
    pub fn answer(&self, id: u64, answer: Answer) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(answer).is_ok(),
            None => false,
        }
    }

    /// Ids of prompts still waiting for an answer.
    pub fn open_prompts(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Queue an outbound transfer for the supervisor.
    pub async fn request(&self, to: impl Into<String>, paths: Vec<PathBuf>) -> bool {
        let request = TransferRequest {
            to: to.into(),
            paths,
        };
        self.requests.send(request).await.is_ok()
    }

    async fn converse(&self, make: impl FnOnce(u64) -> Prompt) -> Answer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if self.prompts.send(make(id)).await.is_err() {
            self.pending.remove(&id);
            tracing::warn!(id, "no front-end is listening for prompts, declining");
            return Answer::Decline;
        }

        let answer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(id, "prompt cancelled by shutdown");
                Answer::Decline
            }
            result = tokio::time::timeout(self.deadline, rx) => match result {
                Ok(Ok(answer)) => answer,
                Ok(Err(_)) => Answer::Decline,
                Err(_) => {
                    tracing::info!(id, deadline = ?self.deadline, "prompt timed out, declining");
                    Answer::Decline
                }
            },
        };
        self.pending.remove(&id);
        answer
    }
}

impl PromptGateway for MemoryGateway {
    async fn ask(&self, question: String) -> Answer {
        self.converse(|id| Prompt::Single { id, question }).await
    }

    async fn ask_batch(&self, peer: String, files: Vec<FileInfo>) -> Answer {
        self.converse(|id| Prompt::Batch { id, peer, files }).await
    }

    fn notify(&self, message: String) {
        tracing::info!(%message, "notification");
        if let Err(e) = self.notifications.try_send(message) {
            tracing::debug!(error = %e, "notification dropped");
        }
    }
}
