//! Proxy dispatcher: the two exchange entry points.
//!
//! # Responsibilities
//! - Validate the inbound request before touching the upstream
//! - Build the outbound request and run the request hook
//! - Connect, send, and relay the response (web) or tunnel (upgrade)
//! - Race every phase against client hang-up and both idle timeouts, so
//!   exactly one terminal outcome is reported per exchange
//!
//! # Data Flow
//! ```text
//! handle_web(request, sink)                 handle_upgrade(head, socket, pre_read)
//!     → preflight                               → preflight
//!     → build_outbound_headers + on_req         → prepare socket, build headers + on_req
//!     → connect + http1 handshake               → connect + raw handshake
//!     → send_request                            → 101? establish tunnel
//!     → ResponseRelay::relay_web                  : ResponseRelay::relay_socket
//!
//! any failure → ProxyErrorHandler (classify, abort) → ErrorHandler (respond once)
//! ```

use std::fmt;
use std::future::Future;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::{Method, Request, Version};
use http_body::Body;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::AbortHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::error::{BoxError, ProxyError};
use crate::handlers::{ErrorCallback, ErrorHandler, HandlerPools, ProxyErrorHandler};
use crate::http::request::{preflight, ExchangeKind, InboundRequest, RequestHead};
use crate::http::response::{ClientConnection, ResponseRelay, ResponseSink};
use crate::http::websocket::{ClientSocket, UpgradeTunnel};
use crate::net::connector::{Connect, TcpConnector};
use crate::net::socket::{PrefixedStream, PrepareSocket};
use crate::observability::{metrics, spans};
use crate::resilience::timeouts::{idle_deadline, ActivityClock, TimedBody, TimedIo};
use crate::security::headers::build_outbound_headers;

/// Request issued to the upstream.
#[derive(Debug, Clone)]
pub struct OutboundRequestSpec {
    pub method: Method,
    pub hostname: String,
    pub port: u16,
    /// Path and query.
    pub path: String,
    pub headers: HeaderMap,
    /// Upstream idle timeout.
    pub timeout: Option<Duration>,
}

/// Hook run with the outbound request before it is sent.
pub type RequestHook = Arc<dyn Fn(&RequestHead, &mut OutboundRequestSpec) + Send + Sync>;

/// Hook run once upstream headers are known, before they are written.
pub type ResponseHook = Arc<dyn Fn(&RequestHead, &mut dyn ClientConnection) + Send + Sync>;

/// Per-proxy settings.
#[derive(Clone)]
pub struct ProxyOptions {
    /// Upstream host.
    pub hostname: String,
    /// Upstream port.
    pub port: u16,
    /// Inbound idle timeout.
    pub timeout: Option<Duration>,
    /// Outbound idle timeout.
    pub proxy_timeout: Option<Duration>,
    /// Identifier for `Via` annotation and loop detection.
    pub proxy_name: Option<String>,
    pub on_req: Option<RequestHook>,
    pub on_res: Option<ResponseHook>,
}

impl ProxyOptions {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            timeout: None,
            proxy_timeout: None,
            proxy_name: None,
            on_req: None,
            on_res: None,
        }
    }

    /// Options for a validated configuration. A zero timeout disables it.
    pub fn from_config(config: &ProxyConfig) -> Self {
        let millis = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        Self {
            hostname: config.upstream.hostname.clone(),
            port: config.upstream.port,
            timeout: millis(config.timeouts.request_ms),
            proxy_timeout: millis(config.timeouts.proxy_ms),
            proxy_name: config.proxy_name.clone().filter(|n| !n.is_empty()),
            on_req: None,
            on_res: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn proxy_timeout(mut self, timeout: Duration) -> Self {
        self.proxy_timeout = Some(timeout);
        self
    }

    pub fn proxy_name(mut self, name: impl Into<String>) -> Self {
        self.proxy_name = Some(name.into());
        self
    }

    pub fn on_req<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestHead, &mut OutboundRequestSpec) + Send + Sync + 'static,
    {
        self.on_req = Some(Arc::new(hook));
        self
    }

    pub fn on_res<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RequestHead, &mut dyn ClientConnection) + Send + Sync + 'static,
    {
        self.on_res = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ProxyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyOptions")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("proxy_timeout", &self.proxy_timeout)
            .field("proxy_name", &self.proxy_name)
            .field("on_req", &self.on_req.is_some())
            .field("on_res", &self.on_res.is_some())
            .finish()
    }
}

/// How an exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Upstream response fully relayed.
    Completed,
    /// Terminated through the error handler.
    Failed,
    /// Client went away first.
    ClientClosed,
    /// A reset caused by the proxy's own abort was dropped.
    Suppressed,
    /// Upgrade tunnel ran to completion.
    Tunneled,
    /// Upstream did not switch protocols.
    UpgradeRefused,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Failed => "failed",
            Outcome::ClientClosed => "client_closed",
            Outcome::Suppressed => "suppressed",
            Outcome::Tunneled => "tunneled",
            Outcome::UpgradeRefused => "upgrade_refused",
        }
    }
}

/// Why a raced phase stopped early.
enum Interrupt {
    Failed(ProxyError),
    Hangup,
    ClientTimeout,
    UpstreamTimeout,
}

/// Aborts the outbound connection task when the exchange ends.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Reverse proxy to a single upstream.
pub struct Proxy<C = TcpConnector> {
    options: ProxyOptions,
    pools: HandlerPools,
    connector: C,
}

impl Proxy<TcpConnector> {
    pub fn new(options: ProxyOptions) -> Self {
        Self::with_connector(options, TcpConnector)
    }
}

impl<C: Connect> Proxy<C> {
    pub fn with_connector(options: ProxyOptions, connector: C) -> Self {
        Self {
            options,
            pools: HandlerPools::default(),
            connector,
        }
    }

    pub fn pools(&self) -> &HandlerPools {
        &self.pools
    }

    /// Proxy an HTTP exchange, writing the response into `sink`.
    ///
    /// When the exchange fails and `callback` is `None`, the error is returned
    /// after the client has been answered.
    pub async fn handle_web<B>(
        &self,
        request: InboundRequest<B>,
        sink: ResponseSink,
        callback: Option<ErrorCallback>,
    ) -> Result<Outcome, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        let span = spans::exchange_span(Uuid::new_v4(), ExchangeKind::Web, request.head());
        let result = self.web(request, sink, callback).instrument(span).await;
        record(ExchangeKind::Web, &result);
        result
    }

    /// Proxy an upgrade exchange on the raw client `socket`.
    ///
    /// `pre_read` holds client bytes already read past the request head.
    pub async fn handle_upgrade<S>(
        &self,
        head: RequestHead,
        socket: S,
        pre_read: Bytes,
        callback: Option<ErrorCallback>,
    ) -> Result<Outcome, ProxyError>
    where
        S: AsyncRead + AsyncWrite + PrepareSocket + Unpin + Send,
    {
        let span = spans::exchange_span(Uuid::new_v4(), ExchangeKind::Upgrade, &head);
        let result = self
            .upgrade(head, socket, pre_read, callback)
            .instrument(span)
            .await;
        record(ExchangeKind::Upgrade, &result);
        result
    }

    async fn web<B>(
        &self,
        request: InboundRequest<B>,
        mut sink: ResponseSink,
        callback: Option<ErrorCallback>,
    ) -> Result<Outcome, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: Into<BoxError>,
    {
        let (head, body) = request.into_parts();
        let mut errors = ErrorHandler::acquire(&self.pools.error, callback);

        let spec = match preflight(&head, ExchangeKind::Web, self.proxy_name())
            .and_then(|()| self.outbound_spec(&head))
        {
            Ok(spec) => spec,
            Err(err) => return fail(&mut errors, Some(err), &head, &mut sink),
        };
        tracing::debug!(
            upstream_host = %spec.hostname,
            upstream_port = spec.port,
            "Dispatching request"
        );

        let client_clock = ActivityClock::new();
        let upstream_clock = ActivityClock::new();
        sink.set_client_clock(client_clock.clone());
        let mut hangup = sink.hangup();
        let client_limit = self.options.timeout;
        let upstream_limit = spec.timeout;

        let mut proxy_errors = ProxyErrorHandler::acquire(&self.pools.proxy_error);
        let mut relay = ResponseRelay::acquire(&self.pools.response);

        let connect = async {
            let io = self.connector.connect(&spec.hostname, spec.port).await?;
            let io = TokioIo::new(TimedIo::new(io, upstream_clock.clone()));
            let handshake = hyper::client::conn::http1::handshake::<_, TimedBody<B>>(io).await?;
            Ok::<_, ProxyError>(handshake)
        };
        let mut connect_hangup = hangup.clone();
        let (mut sender, conn) = match race(
            connect,
            connect_hangup.wait(),
            (&client_clock, client_limit),
            (&upstream_clock, upstream_limit),
        )
        .await
        {
            Ok(pair) => pair,
            Err(interrupt) => {
                return self.interrupted(interrupt, &mut errors, &mut proxy_errors, &head, &mut sink)
            }
        };

        let driver = tokio::spawn(
            async move {
                if let Err(e) = conn.await {
                    tracing::debug!(error = %e, "Upstream connection closed with error");
                }
            }
            .in_current_span(),
        );
        proxy_errors.track(driver.abort_handle());
        let _driver = AbortOnDrop(driver.abort_handle());

        let on_res = self.options.on_res.as_ref();
        let exchange = async {
            let mut outbound = Request::builder()
                .method(spec.method.clone())
                .uri(spec.path.as_str())
                .version(Version::HTTP_11)
                .body(TimedBody::new(body, client_clock.clone()))?;
            *outbound.headers_mut() = spec.headers.clone();

            let response = sender.send_request(outbound).await?;
            tracing::debug!(status = %response.status(), "Upstream responded");
            relay.relay_web(response, &head, &mut sink, on_res).await
        };
        let result = race(
            exchange,
            hangup.wait(),
            (&client_clock, client_limit),
            (&upstream_clock, upstream_limit),
        )
        .await;

        let outcome = match result {
            Ok(outcome) => Ok(outcome),
            Err(interrupt) => {
                self.interrupted(interrupt, &mut errors, &mut proxy_errors, &head, &mut sink)
            }
        };
        proxy_errors.release();
        outcome
    }

    async fn upgrade<S>(
        &self,
        head: RequestHead,
        socket: S,
        pre_read: Bytes,
        callback: Option<ErrorCallback>,
    ) -> Result<Outcome, ProxyError>
    where
        S: AsyncRead + AsyncWrite + PrepareSocket + Unpin + Send,
    {
        let mut errors = ErrorHandler::acquire(&self.pools.error, callback);
        let mut client = ClientSocket::new(PrefixedStream::new(socket, pre_read));

        let prepared = preflight(&head, ExchangeKind::Upgrade, self.proxy_name())
            .and_then(|()| match client.get_ref() {
                Some(io) => io.prepare().map_err(ProxyError::from),
                None => Ok(()),
            })
            .and_then(|()| self.outbound_spec(&head));
        let spec = match prepared {
            Ok(spec) => spec,
            Err(err) => return fail(&mut errors, Some(err), &head, &mut client),
        };

        // Upgrade sockets run without an inbound idle timeout.
        let client_clock = ActivityClock::new();
        let upstream_clock = ActivityClock::new();
        let mut proxy_errors = ProxyErrorHandler::acquire(&self.pools.proxy_error);
        let mut tunnel = UpgradeTunnel::acquire(&self.pools.upgrade);

        let negotiate = async {
            let io = self.connector.connect(&spec.hostname, spec.port).await?;
            let mut io = TimedIo::new(io, upstream_clock.clone());
            let (upstream_head, leftover) = tunnel.handshake(&mut io, &spec).await?;
            Ok::<_, ProxyError>((io, upstream_head, leftover))
        };
        let negotiated = race(
            negotiate,
            client.closed(),
            (&client_clock, None),
            (&upstream_clock, spec.timeout),
        )
        .await;

        let (io, upstream_head, leftover) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(interrupt) => {
                return self.interrupted(interrupt, &mut errors, &mut proxy_errors, &head, &mut client)
            }
        };

        if !upstream_head.is_switching_protocols() {
            let mut relay = ResponseRelay::acquire(&self.pools.response);
            let on_res = self.options.on_res.as_ref();
            return Ok(relay
                .relay_socket(&upstream_head, &head, &mut client, on_res)
                .await);
        }

        metrics::record_upgrade();
        let outcome = match tunnel
            .establish(io.into_inner(), &upstream_head, leftover, &mut client)
            .await
        {
            Ok((sent, received)) => {
                tracing::debug!(sent, received, "Tunnel closed");
                Ok(Outcome::Tunneled)
            }
            Err(err) => {
                let err = proxy_errors.handle(err);
                fail(&mut errors, err, &head, &mut client)
            }
        };
        proxy_errors.release();
        outcome
    }

    fn proxy_name(&self) -> Option<&str> {
        self.options.proxy_name.as_deref()
    }

    fn outbound_spec(&self, head: &RequestHead) -> Result<OutboundRequestSpec, ProxyError> {
        let mut headers = build_outbound_headers(head, self.proxy_name())?;
        if !headers.contains_key(header::HOST) {
            let host = default_host(&self.options.hostname, self.options.port);
            headers.insert(header::HOST, HeaderValue::from_str(&host)?);
        }

        let mut spec = OutboundRequestSpec {
            method: head.method.clone(),
            hostname: self.options.hostname.clone(),
            port: self.options.port,
            path: head.path().to_string(),
            headers,
            timeout: self.options.proxy_timeout,
        };
        if let Some(hook) = &self.options.on_req {
            hook(head, &mut spec);
        }
        Ok(spec)
    }

    fn interrupted(
        &self,
        interrupt: Interrupt,
        errors: &mut ErrorHandler,
        proxy_errors: &mut ProxyErrorHandler,
        head: &RequestHead,
        client: &mut dyn ClientConnection,
    ) -> Result<Outcome, ProxyError> {
        match interrupt {
            Interrupt::Failed(err) => {
                let err = proxy_errors.handle(err);
                fail(errors, err, head, client)
            }
            Interrupt::UpstreamTimeout => {
                let err = proxy_errors.gateway_timeout();
                fail(errors, err, head, client)
            }
            Interrupt::ClientTimeout => {
                proxy_errors.abort();
                errors.request_timeout(head, client)?;
                Ok(Outcome::Failed)
            }
            Interrupt::Hangup => {
                tracing::debug!("Client closed before exchange finished");
                proxy_errors.abort();
                Ok(Outcome::ClientClosed)
            }
        }
    }
}

impl<C> fmt::Debug for Proxy<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("options", &self.options)
            .field("pools", &self.pools)
            .finish()
    }
}

/// `Host` value used when the inbound request carried none.
fn default_host(hostname: &str, port: u16) -> String {
    let host = if hostname.parse::<Ipv6Addr>().is_ok() {
        format!("[{hostname}]")
    } else {
        hostname.to_string()
    };
    if port == 80 {
        host
    } else {
        format!("{host}:{port}")
    }
}

fn fail(
    errors: &mut ErrorHandler,
    err: Option<ProxyError>,
    head: &RequestHead,
    client: &mut dyn ClientConnection,
) -> Result<Outcome, ProxyError> {
    match err {
        Some(err) => {
            errors.handle(err, head, client)?;
            Ok(Outcome::Failed)
        }
        None => Ok(Outcome::Suppressed),
    }
}

fn record(kind: ExchangeKind, result: &Result<Outcome, ProxyError>) {
    let outcome = match result {
        Ok(outcome) => outcome.as_str(),
        Err(_) => Outcome::Failed.as_str(),
    };
    metrics::record_exchange(kind, outcome);
}

/// Run `work` until it finishes or the exchange is interrupted.
async fn race<T>(
    work: impl Future<Output = Result<T, ProxyError>>,
    hangup: impl Future<Output = ()>,
    client: (&ActivityClock, Option<Duration>),
    upstream: (&ActivityClock, Option<Duration>),
) -> Result<T, Interrupt> {
    tokio::select! {
        biased;
        result = work => result.map_err(Interrupt::Failed),
        _ = hangup => Err(Interrupt::Hangup),
        _ = idle_deadline(client.0, client.1) => Err(Interrupt::ClientTimeout),
        _ = idle_deadline(upstream.0, upstream.1) => Err(Interrupt::UpstreamTimeout),
    }
}
