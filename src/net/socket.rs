//! Socket preparation and read push-back.
//!
//! # Responsibilities
//! - Tune sockets for tunneling: no-delay on, keep-alive on
//! - Replay bytes that were read ahead of time before reading from the socket
//! - Notice a peer that closes while nobody is reading the socket

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

use crate::resilience::timeouts::TimedIo;

/// Read-ahead kept while watching for close; past it the watch stops.
const MAX_READ_AHEAD: usize = 64 * 1024;

/// Streams that can be tuned before they carry a tunnel.
///
/// Non-TCP transports keep the default no-op.
pub trait PrepareSocket {
    fn prepare(&self) -> io::Result<()> {
        Ok(())
    }
}

impl PrepareSocket for TcpStream {
    fn prepare(&self) -> io::Result<()> {
        self.set_nodelay(true)?;
        SockRef::from(self).set_keepalive(true)?;
        Ok(())
    }
}

impl PrepareSocket for DuplexStream {}

impl<S: PrepareSocket> PrepareSocket for PrefixedStream<S> {
    fn prepare(&self) -> io::Result<()> {
        self.inner.prepare()
    }
}

impl<S: PrepareSocket> PrepareSocket for TimedIo<S> {
    fn prepare(&self) -> io::Result<()> {
        self.get_ref().prepare()
    }
}

/// A stream that yields `prefix` before reading from `inner`.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    inner: S,
    prefix: Bytes,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Bytes) -> Self {
        Self { inner, prefix }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

}

impl<S: AsyncRead + Unpin> PrefixedStream<S> {
    /// Resolve once the peer closes the stream or it fails.
    ///
    /// Bytes that arrive meanwhile are appended to the prefix, so later
    /// reads still see them. Cancel safe.
    pub async fn closed(&mut self) {
        let mut chunk = [0u8; 4096];
        while self.prefix.len() < MAX_READ_AHEAD {
            match self.inner.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    let mut joined = BytesMut::with_capacity(self.prefix.len() + n);
                    joined.extend_from_slice(&self.prefix);
                    joined.extend_from_slice(&chunk[..n]);
                    self.prefix = joined.freeze();
                }
            }
        }
        std::future::pending().await
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.prefix.has_remaining() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
