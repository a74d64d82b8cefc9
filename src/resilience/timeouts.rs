//! Idle timeouts for both legs of an exchange.
//!
//! # Responsibilities
//! - Record the last moment a leg made progress
//! - Resolve a future once a leg has been idle for longer than its limit
//! - Wrap streams and bodies so reads and writes count as progress
//!
//! # Design Decisions
//! - Timeouts measure inactivity, not total duration, so long downloads
//!   that keep moving are never cut off
//! - No limit means the deadline future never resolves

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http_body::{Body, Frame, SizeHint};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;

/// Shared record of the last activity on one leg.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    origin: Instant,
    last: Arc<AtomicU64>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Mark progress now.
    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last recorded progress.
    pub fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed();
        let last = Duration::from_millis(self.last.load(Ordering::Relaxed));
        now.saturating_sub(last)
    }

    /// Resolve once the leg has been idle for `limit`.
    pub async fn idle_elapsed(&self, limit: Duration) {
        loop {
            let idle = self.idle_for();
            if idle >= limit {
                return;
            }
            tokio::time::sleep(limit - idle).await;
        }
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Idle deadline for an optional limit. Pending forever when `limit` is `None`.
pub async fn idle_deadline(clock: &ActivityClock, limit: Option<Duration>) {
    match limit {
        Some(limit) => clock.idle_elapsed(limit).await,
        None => std::future::pending().await,
    }
}

/// Stream wrapper that touches a clock whenever bytes move.
#[derive(Debug)]
pub struct TimedIo<S> {
    inner: S,
    clock: ActivityClock,
}

impl<S> TimedIo<S> {
    pub fn new(inner: S, clock: ActivityClock) -> Self {
        Self { inner, clock }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedIo<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if buf.filled().len() > before {
            self.clock.touch();
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedIo<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            self.clock.touch();
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Body wrapper that touches a clock for every frame pulled.
#[derive(Debug)]
pub struct TimedBody<B> {
    inner: B,
    clock: ActivityClock,
}

impl<B> TimedBody<B> {
    pub fn new(inner: B, clock: ActivityClock) -> Self {
        Self { inner, clock }
    }
}

impl<B: Body + Unpin> Body for TimedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let poll = Pin::new(&mut self.inner).poll_frame(cx);
        if matches!(poll, Poll::Ready(Some(Ok(_)))) {
            self.clock.touch();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test(start_paused = true)]
    async fn idle_elapsed_waits_for_full_limit() {
        let clock = ActivityClock::new();
        let start = Instant::now();
        clock.idle_elapsed(Duration::from_millis(500)).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn touch_pushes_deadline_out() {
        let clock = ActivityClock::new();
        let toucher = clock.clone();
        let start = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            toucher.touch();
        });

        clock.idle_elapsed(Duration::from_millis(500)).await;
        assert!(start.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_limit_never_fires() {
        let clock = ActivityClock::new();
        let fired = tokio::time::timeout(Duration::from_secs(3600), idle_deadline(&clock, None)).await;
        assert!(fired.is_err());
    }

    #[tokio::test]
    async fn timed_io_counts_traffic() {
        let (a, mut b) = tokio::io::duplex(64);
        let clock = ActivityClock::new();
        let mut timed = TimedIo::new(a, clock.clone());

        b.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timed.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(clock.idle_for() < Duration::from_secs(1));
    }
}
