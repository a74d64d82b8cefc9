//! Client-facing response side of an exchange.
//!
//! # Responsibilities
//! - Give the proxy a writable response (`ResponseSink`) that the front-end
//!   turns into a hyper response (`PendingResponse`)
//! - Relay an upstream response: sanitize headers, run the response hook,
//!   stream the body, attach trailers
//! - Finish a failed upgrade negotiation on the raw client socket
//!
//! # Data Flow
//! ```text
//! upstream Response<Incoming>
//!     → sanitize_hop_by_hop
//!     → ResponseSink (status + headers, hook may edit)
//!     → write_head ──oneshot──▶ PendingResponse::recv ─▶ hyper
//!     → frames ─────mpsc──────▶ ChannelBody ──────────▶ hyper
//! ```
//!
//! # Design Decisions
//! - The sink is a channel pair so the proxy task owns the exchange while
//!   hyper owns the connection
//! - Dropping the hyper side closes a watch channel; that is the client
//!   hang-up signal
//! - Body frames go through a bounded channel for back-pressure

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{ErrorCode, ProxyError};
use crate::handlers::pool::{HandlerPool, Pooled, Recycle};
use crate::http::proxy::{Outcome, ResponseHook};
use crate::http::request::{ExchangeKind, RequestHead};
use crate::http::websocket::{ClientSocket, UpstreamHead};
use crate::resilience::timeouts::ActivityClock;
use crate::security::headers::sanitize_hop_by_hop;

/// Body type handed to the front-end.
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

const BODY_CHANNEL_CAPACITY: usize = 16;

/// Capabilities shared by both client response shapes.
pub trait ClientConnection: Send {
    /// Which shape this connection has.
    fn kind(&self) -> ExchangeKind;

    /// Whether a status line has already gone out.
    fn headers_sent(&self) -> bool;

    /// Whether the client side is gone.
    fn is_closed(&self) -> bool;

    /// HTTP response writer, `None` for raw sockets.
    fn writer(&mut self) -> Option<&mut ResponseSink>;

    /// Tear the connection down without a response.
    fn destroy(&mut self);
}

/// Writable HTTP response for one exchange.
pub struct ResponseSink {
    status: StatusCode,
    headers: HeaderMap,
    trailers: Option<HeaderMap>,
    head_tx: Option<oneshot::Sender<Response<ProxyBody>>>,
    body_tx: Option<mpsc::Sender<Result<Frame<Bytes>, ProxyError>>>,
    abort_tx: Option<oneshot::Sender<ProxyError>>,
    hangup: watch::Receiver<()>,
    client_clock: Option<ActivityClock>,
    headers_sent: bool,
    finished: bool,
    destroyed: bool,
}

impl ResponseSink {
    /// Create a sink and the front-end half that will receive its response.
    pub fn channel() -> (ResponseSink, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (hangup_tx, hangup_rx) = watch::channel(());
        let sink = ResponseSink {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            trailers: None,
            head_tx: Some(head_tx),
            body_tx: None,
            abort_tx: None,
            hangup: hangup_rx,
            client_clock: None,
            headers_sent: false,
            finished: false,
            destroyed: false,
        };
        let pending = PendingResponse {
            head_rx,
            hangup: hangup_tx,
        };
        (sink, pending)
    }

    /// Count writes as client-side activity on `clock`.
    pub fn set_client_clock(&mut self, clock: ActivityClock) {
        self.client_clock = Some(clock);
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Queue trailers to send when the body ends.
    pub fn add_trailers(&mut self, trailers: HeaderMap) {
        match &mut self.trailers {
            Some(existing) => existing.extend(trailers),
            None => self.trailers = Some(trailers),
        }
    }

    /// Future resolving when the client side goes away.
    pub fn hangup(&self) -> Hangup {
        Hangup(self.hangup.clone())
    }

    /// Send the status line and headers with a streaming body.
    ///
    /// Returns `false` if the head was already sent or the client is gone.
    pub fn write_head(&mut self) -> bool {
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let (abort_tx, abort_rx) = oneshot::channel();
        let body = ChannelBody {
            frames: body_rx,
            abort: Some(abort_rx),
        };
        if !self.send_head(body.boxed_unsync()) {
            return false;
        }
        self.body_tx = Some(body_tx);
        self.abort_tx = Some(abort_tx);
        true
    }

    /// Write one body chunk, sending the head first if needed.
    pub async fn write(&mut self, data: Bytes) -> bool {
        if !self.headers_sent && !self.write_head() {
            return false;
        }
        let Some(tx) = &self.body_tx else {
            return false;
        };
        if tx.send(Ok(Frame::data(data))).await.is_err() {
            self.body_tx = None;
            return false;
        }
        if let Some(clock) = &self.client_clock {
            clock.touch();
        }
        true
    }

    /// Finish the body, flushing any queued trailers.
    pub async fn end(&mut self) {
        if !self.headers_sent && !self.write_head() {
            return;
        }
        if let (Some(tx), Some(trailers)) = (&self.body_tx, self.trailers.take()) {
            let _ = tx.send(Ok(Frame::trailers(trailers))).await;
        }
        self.body_tx = None;
        self.abort_tx = None;
        self.finished = true;
    }

    /// Send a bodiless response with `status` and close the connection.
    pub fn respond_status(&mut self, status: StatusCode) -> bool {
        self.status = status;
        self.headers
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        let body = Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed_unsync();
        let sent = self.send_head(body);
        self.finished = sent;
        sent
    }

    fn send_head(&mut self, body: ProxyBody) -> bool {
        if self.headers_sent || self.destroyed {
            return false;
        }
        let Some(head_tx) = self.head_tx.take() else {
            return false;
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);

        if head_tx.send(response).is_err() {
            self.destroyed = true;
            return false;
        }
        self.headers_sent = true;
        true
    }
}

impl ClientConnection for ResponseSink {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::Web
    }

    fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    fn is_closed(&self) -> bool {
        self.destroyed || self.hangup.has_changed().is_err()
    }

    fn writer(&mut self) -> Option<&mut ResponseSink> {
        Some(self)
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.head_tx = None;
        self.body_tx = None;
        if let Some(abort_tx) = self.abort_tx.take() {
            let _ = abort_tx.send(ProxyError::new(
                "response destroyed",
                Some(ErrorCode::ConnReset),
                None,
            ));
        }
    }
}

impl std::fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseSink")
            .field("status", &self.status)
            .field("headers_sent", &self.headers_sent)
            .field("finished", &self.finished)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

/// Resolves once the client side of a [`ResponseSink`] is dropped.
#[derive(Debug, Clone)]
pub struct Hangup(watch::Receiver<()>);

impl Hangup {
    pub async fn wait(&mut self) {
        while self.0.changed().await.is_ok() {}
    }
}

/// Front-end half of a [`ResponseSink`].
#[derive(Debug)]
pub struct PendingResponse {
    head_rx: oneshot::Receiver<Response<ProxyBody>>,
    hangup: watch::Sender<()>,
}

impl PendingResponse {
    /// Wait for the proxy to produce a response head.
    ///
    /// Fails when the exchange was destroyed before any head was written.
    pub async fn recv(self) -> Result<Response<ClientBody>, ProxyError> {
        let PendingResponse { head_rx, hangup } = self;
        match head_rx.await {
            Ok(response) => Ok(response.map(|inner| ClientBody {
                inner,
                _hangup: hangup,
            })),
            Err(_) => Err(ProxyError::new(
                "response destroyed",
                Some(ErrorCode::ConnReset),
                None,
            )),
        }
    }
}

/// Response body as seen by the front-end. Dropping it signals hang-up.
pub struct ClientBody {
    inner: ProxyBody,
    _hangup: watch::Sender<()>,
}

impl Body for ClientBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ProxyError>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Streaming body fed by a [`ResponseSink`].
struct ChannelBody {
    frames: mpsc::Receiver<Result<Frame<Bytes>, ProxyError>>,
    abort: Option<oneshot::Receiver<ProxyError>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ProxyError>>> {
        if let Some(abort) = self.abort.as_mut() {
            match Pin::new(abort).poll(cx) {
                Poll::Ready(Ok(err)) => {
                    self.abort = None;
                    return Poll::Ready(Some(Err(err)));
                }
                Poll::Ready(Err(_)) => self.abort = None,
                Poll::Pending => {}
            }
        }
        self.frames.poll_recv(cx)
    }
}

/// Per-exchange record kept by the response relay.
#[derive(Debug, Default)]
pub struct ResponseState {
    status: Option<StatusCode>,
    bytes: u64,
    trailers: bool,
}

impl Recycle for ResponseState {
    fn recycle(&mut self) {
        self.status = None;
        self.bytes = 0;
        self.trailers = false;
    }
}

/// Relays the upstream response to the client.
pub struct ResponseRelay {
    state: Pooled<ResponseState>,
}

impl ResponseRelay {
    pub fn acquire(pool: &Arc<HandlerPool<ResponseState>>) -> Self {
        Self {
            state: pool.acquire(),
        }
    }

    /// Bytes of body relayed so far.
    pub fn bytes(&self) -> u64 {
        self.state.get().map_or(0, |s| s.bytes)
    }

    /// Copy an upstream HTTP response onto `sink` and stream its body.
    pub async fn relay_web(
        &mut self,
        upstream: Response<Incoming>,
        head: &RequestHead,
        sink: &mut ResponseSink,
        on_res: Option<&ResponseHook>,
    ) -> Result<Outcome, ProxyError> {
        let (mut parts, mut body) = upstream.into_parts();
        sanitize_hop_by_hop(&mut parts.headers);

        if let Some(state) = self.state.get_mut() {
            state.status = Some(parts.status);
        }
        sink.set_status(parts.status);
        sink.headers_mut().extend(parts.headers);

        if let Some(hook) = on_res {
            hook(head, sink);
        }

        if !sink.write_head() {
            return Ok(Outcome::ClientClosed);
        }

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| {
                if e.is_incomplete_message() {
                    ProxyError::socket_hang_up().with_source(e)
                } else {
                    ProxyError::from(e)
                }
            })?;

            match frame.into_data() {
                Ok(data) => {
                    let len = data.len() as u64;
                    if !sink.write(data).await {
                        return Ok(Outcome::ClientClosed);
                    }
                    if let Some(state) = self.state.get_mut() {
                        state.bytes += len;
                    }
                }
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        if let Some(state) = self.state.get_mut() {
                            state.trailers = true;
                        }
                        sink.add_trailers(trailers);
                    }
                }
            }
        }

        sink.end().await;
        tracing::debug!(
            status = %sink.status(),
            bytes = self.bytes(),
            "Upstream response relayed"
        );
        self.state.release();
        Ok(Outcome::Completed)
    }

    /// Upstream answered an upgrade request without switching protocols.
    pub async fn relay_socket<S>(
        &mut self,
        upstream: &UpstreamHead,
        head: &RequestHead,
        client: &mut ClientSocket<S>,
        on_res: Option<&ResponseHook>,
    ) -> Outcome
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if let Some(state) = self.state.get_mut() {
            state.status = Some(upstream.status);
        }

        if let Some(hook) = on_res {
            hook(head, client);
        }

        client.end().await;
        tracing::debug!(status = %upstream.status, "Upstream declined upgrade");
        self.state.release();
        Outcome::UpgradeRefused
    }
}
