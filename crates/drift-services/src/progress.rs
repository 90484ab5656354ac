//! Byte-counting adapters for reporting transfer progress.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Called with `(bytes so far, declared total)` after every read or write.
pub type ProgressFn = Box<dyn FnMut(u64, u64) + Send>;

/// Counts bytes read through it.
pub struct ProgressReader<R> {
    inner: R,
    done: u64,
    total: u64,
    callback: Option<ProgressFn>,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, total: u64, callback: Option<ProgressFn>) -> Self {
        Self {
            inner,
            done: 0,
            total,
            callback,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.done
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.done += (buf.filled().len() - before) as u64;
        if let Some(cb) = this.callback.as_mut() {
            cb(this.done, this.total);
        }
        Poll::Ready(Ok(()))
    }
}

/// Counts bytes written through it.
pub struct ProgressWriter<W> {
    inner: W,
    done: u64,
    total: u64,
    callback: Option<ProgressFn>,
}

impl<W> ProgressWriter<W> {
    pub fn new(inner: W, total: u64, callback: Option<ProgressFn>) -> Self {
        Self {
            inner,
            done: 0,
            total,
            callback,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.done
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ProgressWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, data))?;
        this.done += n as u64;
        if let Some(cb) = this.callback.as_mut() {
            cb(this.done, this.total);
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
