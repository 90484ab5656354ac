//! The application protocol spoken inside a secure stream.
//!
//! Receiver: read a control line, ask the gateway, answer, and on ACCEPT
//! read exactly the offered bytes per file. Repeat until the sender closes.
//!
//! Sender: offer one file (OFFER) or several (BATCH_OFFER), wait for the
//! answer, and on ACCEPT stream the files back to back, then close.
//!
//! Both sides observe the shared cancellation token at message boundaries
//! and while waiting on the peer.

use std::io;
use std::path::{Path, PathBuf};

use drift_core::message::{format_size, Answer, Message, MessageError};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::gateway::{FileInfo, PromptGateway};
use crate::progress::ProgressFn;
use crate::storage::{self, OutgoingFile, StorageError};

/// Longest control line accepted before the terminating `\n`.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] MessageError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("unexpected {0} message")]
    Unexpected(&'static str),
    #[error("control line exceeds {MAX_MESSAGE_LEN} bytes")]
    MessageTooLong,
    #[error("peer closed the connection without answering")]
    NoAnswer,
    #[error("cancelled")]
    Cancelled,
}

// ── Framing of control lines ──────────────────────────────────────────────────

/// Read one `\n`-terminated message. `None` on EOF before any byte.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, TransferError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        match available.iter().position(|b| *b == b'\n') {
            Some(end) => {
                line.extend_from_slice(&available[..=end]);
                reader.consume(end + 1);
                break;
            }
            None => {
                let n = available.len();
                line.extend_from_slice(available);
                reader.consume(n);
            }
        }
        if line.len() > MAX_MESSAGE_LEN {
            return Err(TransferError::MessageTooLong);
        }
    }
    if line.len() > MAX_MESSAGE_LEN + 1 {
        return Err(TransferError::MessageTooLong);
    }
    Ok(Some(Message::decode(&line)?))
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let line = message.encode()?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Progress callback that logs every tenth of the way.
pub fn progress_logger(name: String) -> ProgressFn {
    let mut last_decile = 0;
    Box::new(move |done, total| {
        if total == 0 {
            return;
        }
        let decile = done.saturating_mul(10) / total;
        if decile > last_decile {
            last_decile = decile;
            tracing::debug!(file = %name, done, total, "transfer progress");
        }
    })
}

// ── Receiving ─────────────────────────────────────────────────────────────────

/// What an inbound connection delivered.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InboundSummary {
    pub stored: Vec<PathBuf>,
    pub declined: usize,
}

/// Serve one inbound connection until the peer closes it, a decline ends
/// it, or an error occurs. Stored files land in `download_dir`.
pub async fn serve_inbound<S, G>(
    stream: S,
    peer_name: &str,
    gateway: &G,
    download_dir: &Path,
    cancel: &CancellationToken,
) -> Result<InboundSummary, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    G: PromptGateway,
{
    let mut stream = BufReader::new(stream);
    let mut summary = InboundSummary::default();

    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            message = read_message(&mut stream) => message?,
        };
        let Some(message) = message else {
            return Ok(summary);
        };

        match message {
            Message::Offer(offer) => {
                tracing::info!(peer = %peer_name, file = %offer.filename, size = offer.size, "offer received");
                let question = format!(
                    "Incoming file: {} ({})",
                    offer.filename,
                    format_size(offer.size)
                );
                let answer = gateway.ask(question).await;
                write_message(&mut stream, &Message::Answer(answer)).await?;
                if answer == Answer::Decline {
                    summary.declined += 1;
                    return Ok(summary);
                }

                let path = receive_one(&mut stream, gateway, download_dir, &offer.filename, offer.size, cancel).await?;
                gateway.notify(format!("File received: {}", offer.filename));
                summary.stored.push(path);
            }
            Message::BatchOffer(offers) => {
                let total = offers.iter().fold(0u64, |acc, o| acc.saturating_add(o.size));
                tracing::info!(peer = %peer_name, files = offers.len(), total, "batch offer received");
                let files = offers
                    .iter()
                    .map(|o| FileInfo {
                        name: o.filename.clone(),
                        size: o.size,
                    })
                    .collect();
                let answer = gateway.ask_batch(peer_name.to_string(), files).await;
                write_message(&mut stream, &Message::Answer(answer)).await?;
                if answer == Answer::Decline {
                    summary.declined += offers.len();
                    return Ok(summary);
                }

                for offer in &offers {
                    let path = receive_one(&mut stream, gateway, download_dir, &offer.filename, offer.size, cancel).await?;
                    summary.stored.push(path);
                }
                gateway.notify(format!("Batch received: {} files", offers.len()));
            }
            Message::Answer(_) => return Err(TransferError::Unexpected("ANSWER")),
        }
    }
}

async fn receive_one<R, G>(
    stream: &mut R,
    gateway: &G,
    download_dir: &Path,
    filename: &str,
    size: u64,
    cancel: &CancellationToken,
) -> Result<PathBuf, TransferError>
where
    R: AsyncRead + Unpin,
    G: PromptGateway,
{
    let progress = progress_logger(filename.to_string());
    let stored = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        stored = storage::store_file(stream, download_dir, filename, size, Some(progress)) => stored,
    };
    match stored {
        Ok(path) => {
            tracing::info!(file = %filename, path = %path.display(), size, "file stored");
            Ok(path)
        }
        Err(e) => {
            gateway.notify(format!("Failed to receive {filename}: {e}"));
            Err(e.into())
        }
    }
}

// ── Sending ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered { files: usize, bytes: u64 },
    Declined,
}

/// Offer `paths` over `stream` and, if accepted, send them.
///
/// Every file is opened and its name checked before the first byte goes
/// out, so a bad path never produces a partial offer.
pub async fn send_files<S>(
    stream: S,
    paths: &[PathBuf],
    cancel: &CancellationToken,
) -> Result<SendOutcome, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        files.push(OutgoingFile::open(path).await?);
    }
    let offer = match files.as_slice() {
        [single] => Message::Offer(single.offer.clone()),
        many => Message::BatchOffer(many.iter().map(|f| f.offer.clone()).collect()),
    };

    let mut stream = BufReader::new(stream);
    write_message(&mut stream, &offer).await?;

    let reply = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        reply = read_message(&mut stream) => reply?,
    };
    match reply {
        None => return Err(TransferError::NoAnswer),
        Some(Message::Answer(Answer::Decline)) => {
            tracing::info!(files = files.len(), "offer declined");
            let _ = stream.shutdown().await;
            return Ok(SendOutcome::Declined);
        }
        Some(Message::Answer(Answer::Accept)) => {}
        Some(Message::Offer(_)) => return Err(TransferError::Unexpected("OFFER")),
        Some(Message::BatchOffer(_)) => return Err(TransferError::Unexpected("BATCH_OFFER")),
    }

    let count = files.len();
    let mut bytes = 0;
    for file in files {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let progress = progress_logger(file.offer.filename.clone());
        bytes += file.send(&mut stream, Some(progress)).await?;
    }
    stream.shutdown().await?;
    tracing::info!(files = count, bytes, "offer delivered");
    Ok(SendOutcome::Delivered {
        files: count,
        bytes,
    })
}
