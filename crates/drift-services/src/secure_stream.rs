//! Encrypted, framed byte stream over any reliable transport.
//!
//! Handshake: each side writes a 44-byte preamble (a fresh ephemeral X25519
//! public key followed by a random 12-byte nonce) and reads the peer's.
//!
//!   write key = SHA-256(X25519(my_ephemeral, peer_static))
//!   read key  = SHA-256(X25519(my_static, peer_ephemeral))
//!
//! so the two directions use independent keys and counters.
//!
//! Frames: `[u32 BE ciphertext length][AES-256-GCM ciphertext + tag]`.
//! The nonce starts at the sender's preamble nonce and advances by one per
//! frame. A length above `MAX_FRAME_LEN` is rejected before any buffer is
//! allocated for it.
//!
//! Any I/O, framing, or authentication error closes the stream for good.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use drift_core::crypto::{self, CryptoError, FrameCipher, Keypair, KEY_LEN, NONCE_LEN, TAG_LEN};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Largest ciphertext (including tag) accepted in one frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Largest plaintext sealed into one frame.
pub const MAX_PLAINTEXT_LEN: usize = MAX_FRAME_LEN - TAG_LEN;

/// Ephemeral public key followed by initial nonce.
pub const PREAMBLE_LEN: usize = KEY_LEN + NONCE_LEN;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum SecureStreamError {
    #[error("transport: {0}")]
    Io(#[from] io::Error),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("frame of {0} bytes is shorter than the authentication tag")]
    FrameTooSmall(usize),
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("secure stream is closed")]
    Closed,
}

impl From<SecureStreamError> for io::Error {
    fn from(err: SecureStreamError) -> Self {
        match err {
            SecureStreamError::Io(e) => e,
            SecureStreamError::Truncated => io::Error::new(io::ErrorKind::UnexpectedEof, err),
            SecureStreamError::Closed => io::Error::new(io::ErrorKind::NotConnected, err),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

enum ReadState {
    Header { buf: [u8; LEN_PREFIX], filled: usize },
    Body { buf: Vec<u8>, filled: usize },
}

impl ReadState {
    fn header() -> Self {
        ReadState::Header {
            buf: [0; LEN_PREFIX],
            filled: 0,
        }
    }
}

/// One established secure channel.
///
/// `poll_write` seals one frame per call and returns as soon as the frame
/// is queued; the frame is pushed to the transport by later writes or by
/// `poll_flush`. Frames are never interleaved.
pub struct SecureStream<S> {
    inner: S,
    opener: FrameCipher,
    sealer: FrameCipher,
    read_state: ReadState,
    /// Decrypted bytes not yet handed to the caller.
    residue: Vec<u8>,
    residue_pos: usize,
    /// Sealed frame not yet fully written to `inner`.
    outgoing: Vec<u8>,
    outgoing_pos: usize,
    closed: bool,
}

impl<S> SecureStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the preamble exchange and return the established stream.
    ///
    /// `peer_public` is the peer's static key as advertised in discovery.
    /// Nothing here proves the peer holds the matching private key; a
    /// wrong key only shows up as a decrypt failure on the first frame.
    pub async fn handshake(
        mut inner: S,
        local: &Keypair,
        peer_public: &[u8; KEY_LEN],
    ) -> Result<Self, SecureStreamError> {
        let ephemeral = Keypair::generate();
        let nonce = crypto::random_nonce();
        let write_key = ephemeral.derive_key(peer_public)?;

        let mut preamble = [0u8; PREAMBLE_LEN];
        preamble[..KEY_LEN].copy_from_slice(&ephemeral.public);
        preamble[KEY_LEN..].copy_from_slice(&nonce);
        inner.write_all(&preamble).await?;
        inner.flush().await?;

        let mut theirs = [0u8; PREAMBLE_LEN];
        inner.read_exact(&mut theirs).await?;
        let mut peer_ephemeral = [0u8; KEY_LEN];
        peer_ephemeral.copy_from_slice(&theirs[..KEY_LEN]);
        let mut peer_nonce = [0u8; NONCE_LEN];
        peer_nonce.copy_from_slice(&theirs[KEY_LEN..]);

        let read_key = local.derive_key(&peer_ephemeral)?;

        Ok(Self {
            inner,
            opener: FrameCipher::new(&read_key, peer_nonce),
            sealer: FrameCipher::new(&write_key, nonce),
            read_state: ReadState::header(),
            residue: Vec::new(),
            residue_pos: 0,
            outgoing: Vec::new(),
            outgoing_pos: 0,
            closed: false,
        })
    }
}

impl<S> SecureStream<S> {
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
        self.residue = Vec::new();
        self.residue_pos = 0;
        self.outgoing = Vec::new();
        self.outgoing_pos = 0;
    }
}

impl<S> SecureStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Read and open the next frame. `None` on a clean EOF between frames.
    fn poll_frame(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Vec<u8>>, SecureStreamError>> {
        loop {
            match &mut self.read_state {
                ReadState::Header { buf, filled } => {
                    if *filled == LEN_PREFIX {
                        let len = u32::from_be_bytes(*buf) as usize;
                        if len > MAX_FRAME_LEN {
                            return Poll::Ready(Err(SecureStreamError::FrameTooLarge(len)));
                        }
                        if len < TAG_LEN {
                            return Poll::Ready(Err(SecureStreamError::FrameTooSmall(len)));
                        }
                        self.read_state = ReadState::Body {
                            buf: vec![0; len],
                            filled: 0,
                        };
                        continue;
                    }
                    let mut rb = ReadBuf::new(&mut buf[*filled..]);
                    ready!(Pin::new(&mut self.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        return Poll::Ready(if *filled == 0 {
                            Ok(None)
                        } else {
                            Err(SecureStreamError::Truncated)
                        });
                    }
                    *filled += n;
                }
                ReadState::Body { buf, filled } => {
                    if *filled == buf.len() {
                        let plaintext = self.opener.open(buf)?;
                        self.read_state = ReadState::header();
                        return Poll::Ready(Ok(Some(plaintext)));
                    }
                    let mut rb = ReadBuf::new(&mut buf[*filled..]);
                    ready!(Pin::new(&mut self.inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(SecureStreamError::Truncated));
                    }
                    *filled += n;
                }
            }
        }
    }
}

impl<S> SecureStream<S>
where
    S: AsyncWrite + Unpin,
{
    /// Push any queued frame bytes into the transport.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.outgoing_pos < self.outgoing.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.outgoing[self.outgoing_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.outgoing_pos += n;
        }
        self.outgoing.clear();
        self.outgoing_pos = 0;
        Poll::Ready(Ok(()))
    }

    fn poll_drain_or_close(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Err(SecureStreamError::Closed.into()));
        }
        let result = ready!(self.poll_drain(cx));
        if result.is_err() {
            self.close();
        }
        Poll::Ready(result)
    }
}

impl<S> AsyncRead for SecureStream<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(SecureStreamError::Closed.into()));
        }
        loop {
            if this.residue_pos < this.residue.len() {
                let n = buf.remaining().min(this.residue.len() - this.residue_pos);
                buf.put_slice(&this.residue[this.residue_pos..this.residue_pos + n]);
                this.residue_pos += n;
                return Poll::Ready(Ok(()));
            }
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            match ready!(this.poll_frame(cx)) {
                Ok(Some(plaintext)) => {
                    this.residue = plaintext;
                    this.residue_pos = 0;
                }
                Ok(None) => return Poll::Ready(Ok(())),
                Err(e) => {
                    tracing::debug!(error = %e, "secure stream read failed");
                    this.close();
                    return Poll::Ready(Err(e.into()));
                }
            }
        }
    }
}

impl<S> AsyncWrite for SecureStream<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain_or_close(cx))?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = data.len().min(MAX_PLAINTEXT_LEN);
        let sealed = match this.sealer.seal(&data[..n]) {
            Ok(sealed) => sealed,
            Err(e) => {
                this.close();
                return Poll::Ready(Err(SecureStreamError::from(e).into()));
            }
        };
        this.outgoing.reserve(LEN_PREFIX + sealed.len());
        this.outgoing.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        this.outgoing.extend_from_slice(&sealed);

        // The frame is committed; start pushing it but report success either way.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            this.close();
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_or_close(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_or_close(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
