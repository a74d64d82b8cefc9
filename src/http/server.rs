//! Front-end adapter: accepts client connections and feeds the proxy.
//!
//! # Responsibilities
//! - Accept connections through the bounded listener
//! - Sniff the first request head to separate upgrades from plain HTTP
//! - Hand upgrades to `Proxy::handle_upgrade` as raw sockets
//! - Serve everything else with hyper (HTTP/1.1 and HTTP/2) and
//!   `Proxy::handle_web`
//! - Drain connections on shutdown
//!
//! Only the first request on a connection is checked for an upgrade; an
//! upgrade request later on a keep-alive connection goes through the web path.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Uri, Version};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::config::ProxyConfig;
use crate::http::proxy::{Proxy, ProxyOptions};
use crate::http::request::{ConnectionInfo, InboundRequest, RequestHead};
use crate::http::response::ResponseSink;
use crate::lifecycle::shutdown::{Shutdown, DRAIN_TIMEOUT};
use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::net::connector::{Connect, TcpConnector};
use crate::net::listener::{ClientSlot, Listener, ListenerError};
use crate::net::socket::PrefixedStream;

const MAX_SNIFF_HEADERS: usize = 64;
const MAX_SNIFF_BYTES: usize = 64 * 1024;

/// HTTP server for the reverse proxy.
pub struct HttpServer<C = TcpConnector> {
    proxy: Arc<Proxy<C>>,
}

impl HttpServer<TcpConnector> {
    /// Create a server for a validated configuration.
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(Proxy::new(ProxyOptions::from_config(config)))
    }
}

impl<C: Connect> HttpServer<C> {
    pub fn new(proxy: Proxy<C>) -> Self {
        Self {
            proxy: Arc::new(proxy),
        }
    }

    /// Run the server until `shutdown` fires, then drain.
    pub async fn run(self, listener: Listener, shutdown: Shutdown) -> Result<(), ListenerError> {
        let addr = listener.local_addr().map_err(ListenerError::Bind)?;
        tracing::info!(address = %addr, "HTTP server starting");

        let tracker = ConnectionTracker::new();
        let mut stop = shutdown.subscribe();

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, slot)) => {
                        let proxy = Arc::clone(&self.proxy);
                        let guard = tracker.track();
                        let stop = shutdown.subscribe();
                        tokio::spawn(serve_connection(proxy, stream, peer, slot, guard, stop));
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => tracing::warn!(error = %e, "Accept failed"),
                },
            }
        }

        tracing::info!(active = tracker.active_count(), "Draining connections");
        if !tracker.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::warn!(active = tracker.active_count(), "Drain timed out");
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// What the first bytes of a connection turned out to be.
enum Sniffed {
    /// Upgrade request: parsed head and the byte length of that head.
    Upgrade(RequestHead, usize),
    /// Anything else, including garbage hyper should answer.
    Serve,
    /// Client closed before sending anything.
    Closed,
}

async fn serve_connection<C: Connect>(
    proxy: Arc<Proxy<C>>,
    mut stream: TcpStream,
    peer: SocketAddr,
    _slot: ClientSlot,
    guard: ConnectionGuard,
    mut stop: broadcast::Receiver<()>,
) {
    let info = match stream.local_addr() {
        Ok(local_addr) => ConnectionInfo {
            local_addr,
            remote_addr: peer,
            encrypted: false,
        },
        Err(e) => {
            tracing::debug!(error = %e, "Connection lost before setup");
            return;
        }
    };

    let mut buf = BytesMut::with_capacity(4096);
    let sniffed = match sniff(&mut stream, &mut buf, info).await {
        Ok(sniffed) => sniffed,
        Err(e) => {
            tracing::debug!(connection_id = %guard.id(), error = %e, "Read failed before request head");
            return;
        }
    };

    match sniffed {
        Sniffed::Closed => {}
        Sniffed::Upgrade(head, head_len) => {
            let pre_read = buf.split_off(head_len).freeze();
            if let Err(e) = proxy.handle_upgrade(head, stream, pre_read, None).await {
                tracing::debug!(connection_id = %guard.id(), error = %e, "Upgrade exchange failed");
            }
        }
        Sniffed::Serve => {
            let io = TokioIo::new(PrefixedStream::new(stream, buf.freeze()));
            let service = service_fn(move |req: Request<Incoming>| {
                let proxy = Arc::clone(&proxy);
                async move {
                    let (sink, pending) = ResponseSink::channel();
                    let request = InboundRequest::from_http(req, info);
                    tokio::spawn(async move {
                        if let Err(e) = proxy.handle_web(request, sink, None).await {
                            tracing::debug!(error = %e, "Web exchange failed");
                        }
                    });
                    pending.recv().await
                }
            });

            let builder = auto::Builder::new(TokioExecutor::new());
            let conn = builder.serve_connection(io, service);
            tokio::pin!(conn);

            tokio::select! {
                result = conn.as_mut() => log_connection_end(&guard, result),
                _ = stop.recv() => {
                    conn.as_mut().graceful_shutdown();
                    log_connection_end(&guard, conn.await);
                }
            }
        }
    }
}

fn log_connection_end(
    guard: &ConnectionGuard,
    result: Result<(), Box<dyn std::error::Error + Send + Sync>>,
) {
    if let Err(e) = result {
        tracing::debug!(connection_id = %guard.id(), error = %e, "Connection ended with error");
    }
}

/// Read until the first request head is complete, or until it is clear
/// hyper should take over.
async fn sniff(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    info: ConnectionInfo,
) -> Result<Sniffed, std::io::Error> {
    loop {
        if stream.read_buf(buf).await? == 0 {
            return Ok(if buf.is_empty() {
                Sniffed::Closed
            } else {
                Sniffed::Serve
            });
        }

        let mut slots = [httparse::EMPTY_HEADER; MAX_SNIFF_HEADERS];
        let mut req = httparse::Request::new(&mut slots);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                return Ok(match upgrade_head(&req, info) {
                    Some(head) => Sniffed::Upgrade(head, len),
                    None => Sniffed::Serve,
                });
            }
            Ok(httparse::Status::Partial) if buf.len() < MAX_SNIFF_BYTES => {}
            _ => return Ok(Sniffed::Serve),
        }
    }
}

/// Convert a parsed request into a `RequestHead` if it asks for an upgrade.
fn upgrade_head(req: &httparse::Request<'_, '_>, info: ConnectionInfo) -> Option<RequestHead> {
    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for h in req.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
        let value = HeaderValue::from_bytes(h.value).ok()?;
        headers.append(name, value);
    }

    let wants_upgrade = headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !wants_upgrade {
        return None;
    }

    Some(RequestHead {
        method: Method::from_bytes(req.method?.as_bytes()).ok()?,
        uri: req.path?.parse::<Uri>().ok()?,
        version: match req.version? {
            0 => Version::HTTP_10,
            _ => Version::HTTP_11,
        },
        headers,
        connection: info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            local_addr: "127.0.0.1:8080".parse().unwrap(),
            remote_addr: "127.0.0.1:40000".parse().unwrap(),
            encrypted: false,
        }
    }

    fn parse(raw: &[u8]) -> Option<RequestHead> {
        let mut slots = [httparse::EMPTY_HEADER; MAX_SNIFF_HEADERS];
        let mut req = httparse::Request::new(&mut slots);
        req.parse(raw).unwrap();
        upgrade_head(&req, info())
    }

    #[test]
    fn websocket_request_is_an_upgrade() {
        let head = parse(
            b"GET /chat HTTP/1.1\r\nHost: a\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.path(), "/chat");
        assert_eq!(head.headers["upgrade"], "websocket");
    }

    #[test]
    fn plain_request_is_served() {
        assert!(parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").is_none());
        assert!(parse(b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n").is_none());
    }
}
