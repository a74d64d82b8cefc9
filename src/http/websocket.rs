//! WebSocket upgrade tunnel.
//!
//! # Responsibilities
//! - Send the upgrade request upstream and parse the raw response head
//! - Replay the upstream `101` head onto the client socket byte for byte
//! - Splice client and upstream sockets into a full-duplex pipe
//!
//! # Data Flow
//! ```text
//! Client ◀──── 101 head (verbatim) ──── Proxy ◀──── 101 head ──── Backend
//! Client ◀═══════════ raw bytes ═══════▶ Proxy ◀═══ raw bytes ═══▶ Backend
//! ```
//!
//! # Design Decisions
//! - The upstream head is parsed with `httparse` so header case and order
//!   survive exactly as the backend sent them
//! - Bytes read past the upstream head are pushed back before piping
//! - No framing: the tunnel copies bytes, not WebSocket messages

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderValue, StatusCode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorCode, ProxyError};
use crate::handlers::pool::{HandlerPool, Pooled, Recycle};
use crate::http::proxy::OutboundRequestSpec;
use crate::http::request::ExchangeKind;
use crate::http::response::{ClientConnection, ResponseSink};
use crate::net::socket::{PrefixedStream, PrepareSocket};

const MAX_HEADERS: usize = 100;
const MAX_HEAD_BYTES: usize = 64 * 1024;
const SHRINK_ABOVE: usize = 16 * 1024;

/// Raw client socket of an upgrade exchange.
#[derive(Debug)]
pub struct ClientSocket<S> {
    io: Option<S>,
    upgraded: bool,
}

impl<S> ClientSocket<S> {
    pub fn new(io: S) -> Self {
        Self {
            io: Some(io),
            upgraded: false,
        }
    }

    pub fn get_ref(&self) -> Option<&S> {
        self.io.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut S> {
        self.io.as_mut()
    }

}

impl<S: AsyncRead + Unpin> ClientSocket<PrefixedStream<S>> {
    /// Resolve once the client hangs up. An already destroyed socket counts.
    pub async fn closed(&mut self) {
        if let Some(io) = self.io.as_mut() {
            io.closed().await;
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientSocket<S> {
    /// Write a raw response head.
    pub async fn write_head(&mut self, head: &[u8]) -> Result<(), ProxyError> {
        let io = self.io.as_mut().ok_or_else(closed_socket)?;
        io.write_all(head).await?;
        io.flush().await?;
        self.upgraded = true;
        Ok(())
    }

    /// Gracefully close the socket.
    pub async fn end(&mut self) {
        if let Some(mut io) = self.io.take() {
            let _ = io.shutdown().await;
        }
    }
}

impl<S: Send> ClientConnection for ClientSocket<S> {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Upgrade
    }

    fn headers_sent(&self) -> bool {
        self.upgraded
    }

    fn is_closed(&self) -> bool {
        self.io.is_none()
    }

    fn writer(&mut self) -> Option<&mut ResponseSink> {
        None
    }

    fn destroy(&mut self) {
        self.io = None;
    }
}

fn closed_socket() -> ProxyError {
    ProxyError::new("socket closed", Some(ErrorCode::ConnReset), None)
}

/// Parsed upstream response head, raw header names preserved.
#[derive(Debug, Clone)]
pub struct UpstreamHead {
    pub status: StatusCode,
    pub headers: Vec<(String, HeaderValue)>,
}

impl UpstreamHead {
    pub fn is_switching_protocols(&self) -> bool {
        self.status == StatusCode::SWITCHING_PROTOCOLS
    }
}

/// Buffers reused across upgrade exchanges.
#[derive(Debug, Default)]
pub struct UpgradeState {
    head: BytesMut,
    read: BytesMut,
}

impl Recycle for UpgradeState {
    fn recycle(&mut self) {
        self.head.clear();
        self.read.clear();
        if self.head.capacity() > SHRINK_ABOVE {
            self.head = BytesMut::new();
        }
        if self.read.capacity() > SHRINK_ABOVE {
            self.read = BytesMut::new();
        }
    }
}

/// Serialize the client-facing `101` head.
///
/// Each header is written as its own `name: value` line, so repeated
/// headers come out as repeated lines.
pub fn write_switching_head(buf: &mut BytesMut, headers: &[(String, HeaderValue)]) {
    buf.put_slice(b"HTTP/1.1 101 Switching Protocols");
    for (name, value) in headers {
        buf.put_slice(b"\r\n");
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
    }
    buf.put_slice(b"\r\n\r\n");
}

/// Drives the upstream side of an upgrade exchange.
pub struct UpgradeTunnel {
    state: Pooled<UpgradeState>,
}

impl UpgradeTunnel {
    pub fn acquire(pool: &Arc<HandlerPool<UpgradeState>>) -> Self {
        Self {
            state: pool.acquire(),
        }
    }

    /// Send the upgrade request and read the upstream response head.
    ///
    /// Returns the head and any bytes read past it.
    pub async fn handshake<U>(
        &mut self,
        io: &mut U,
        spec: &OutboundRequestSpec,
    ) -> Result<(UpstreamHead, Bytes), ProxyError>
    where
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let state = self.state.get_mut().ok_or_else(closed_socket)?;

        state.head.clear();
        state.head.put_slice(spec.method.as_str().as_bytes());
        state.head.put_slice(b" ");
        state.head.put_slice(spec.path.as_bytes());
        state.head.put_slice(b" HTTP/1.1\r\n");
        for (name, value) in &spec.headers {
            state.head.put_slice(name.as_str().as_bytes());
            state.head.put_slice(b": ");
            state.head.put_slice(value.as_bytes());
            state.head.put_slice(b"\r\n");
        }
        state.head.put_slice(b"\r\n");

        io.write_all(&state.head).await?;
        io.flush().await?;

        state.read.clear();
        loop {
            let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut response = httparse::Response::new(&mut slots);
            match response.parse(&state.read) {
                Ok(httparse::Status::Complete(len)) => {
                    let status = StatusCode::from_u16(response.code.unwrap_or_default())
                        .map_err(|e| invalid_response(e.to_string()))?;
                    let mut headers = Vec::with_capacity(response.headers.len());
                    for h in response.headers.iter() {
                        let value = HeaderValue::from_bytes(h.value)
                            .map_err(|e| invalid_response(e.to_string()))?;
                        headers.push((h.name.to_string(), value));
                    }

                    let _ = state.read.split_to(len);
                    let leftover = state.read.split().freeze();
                    return Ok((UpstreamHead { status, headers }, leftover));
                }
                Ok(httparse::Status::Partial) => {
                    if state.read.len() >= MAX_HEAD_BYTES {
                        return Err(invalid_response("response head too large".into()));
                    }
                }
                Err(e) => return Err(invalid_response(e.to_string())),
            }

            state.read.reserve(4096);
            if io.read_buf(&mut state.read).await? == 0 {
                return Err(ProxyError::socket_hang_up());
            }
        }
    }

    /// Replay the `101` head to the client and pipe bytes both ways.
    ///
    /// Returns the byte counts (client→upstream, upstream→client).
    pub async fn establish<U, S>(
        &mut self,
        upstream: U,
        head: &UpstreamHead,
        pre_read: Bytes,
        client: &mut ClientSocket<S>,
    ) -> Result<(u64, u64), ProxyError>
    where
        U: AsyncRead + AsyncWrite + PrepareSocket + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        upstream.prepare()?;
        let mut upstream = PrefixedStream::new(upstream, pre_read);

        let state = self.state.get_mut().ok_or_else(closed_socket)?;
        state.head.clear();
        write_switching_head(&mut state.head, &head.headers);
        client.write_head(&state.head).await?;

        let io = client.get_mut().ok_or_else(closed_socket)?;
        let counts = tokio::io::copy_bidirectional(io, &mut upstream).await?;
        self.state.release();
        Ok(counts)
    }
}

fn invalid_response(reason: String) -> ProxyError {
    ProxyError::new(
        format!("Parse Error: {reason}"),
        Some(ErrorCode::InvalidResponse),
        None,
    )
}
