//! Inbound request model and preflight validation.
//!
//! # Responsibilities
//! - Describe the inbound request head and the connection it arrived on
//! - Reject illegal exchanges before any upstream I/O (method, upgrade
//!   header, protocol version, `Via` loop)
//!
//! # Design Decisions
//! - The exchange kind is passed explicitly; nothing inspects the response
//!   object to guess it
//! - The first failing check wins

use std::net::SocketAddr;

use http::header::{self, AsHeaderName, HeaderMap};
use http::{Method, Request, StatusCode, Uri, Version};

use crate::error::ProxyError;
use crate::security::headers::joined;

/// Addressing facts about the client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Address the proxy accepted the connection on.
    pub local_addr: SocketAddr,
    /// Address of the peer.
    pub remote_addr: SocketAddr,
    /// Whether the client leg is TLS.
    pub encrypted: bool,
}

/// Everything about an inbound request except its body.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub connection: ConnectionInfo,
}

impl RequestHead {
    /// Path and query to request upstream.
    pub fn path(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    /// HTTP/2 `:authority`, carried in the URI.
    pub fn authority(&self) -> Option<&str> {
        self.uri.authority().map(|a| a.as_str())
    }

    /// First value of `name` if it is valid visible ASCII.
    pub fn header_str(&self, name: impl AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// An inbound request with its body.
#[derive(Debug)]
pub struct InboundRequest<B> {
    head: RequestHead,
    body: B,
}

impl<B> InboundRequest<B> {
    pub fn new(head: RequestHead, body: B) -> Self {
        Self { head, body }
    }

    /// Wrap an `http::Request` accepted on the connection described by `info`.
    pub fn from_http(req: Request<B>, info: ConnectionInfo) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            head: RequestHead {
                method: parts.method,
                uri: parts.uri,
                version: parts.version,
                headers: parts.headers,
                connection: info,
            },
            body,
        }
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn into_parts(self) -> (RequestHead, B) {
        (self.head, self.body)
    }
}

/// Shape of the client side of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Regular request answered with an HTTP response.
    Web,
    /// Upgrade request answered on the raw client socket.
    Upgrade,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Web => "web",
            ExchangeKind::Upgrade => "upgrade",
        }
    }
}

/// Validate `head` before contacting the upstream.
pub fn preflight(
    head: &RequestHead,
    kind: ExchangeKind,
    proxy_name: Option<&str>,
) -> Result<(), ProxyError> {
    if kind == ExchangeKind::Upgrade {
        if head.method != Method::GET {
            return Err(reject("method not allowed", StatusCode::METHOD_NOT_ALLOWED));
        }

        let is_websocket = head
            .header_str(header::UPGRADE)
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        if !is_websocket {
            return Err(reject("bad request", StatusCode::BAD_REQUEST));
        }
    }

    if !matches!(head.version, Version::HTTP_11 | Version::HTTP_2) {
        return Err(reject(
            "http version not supported",
            StatusCode::HTTP_VERSION_NOT_SUPPORTED,
        ));
    }

    if let Some(name) = proxy_name.filter(|n| !n.is_empty()) {
        if via_contains(&head.headers, name) {
            return Err(reject("loop detected", StatusCode::LOOP_DETECTED));
        }
    }

    Ok(())
}

/// Whether any `Via` hop ends with `proxy_name`, ignoring case and padding.
pub fn via_contains(headers: &HeaderMap, proxy_name: &str) -> bool {
    let Some(via) = joined(headers, header::VIA) else {
        return false;
    };
    let needle = proxy_name.to_ascii_lowercase();
    via.split(',')
        .any(|hop| hop.trim().to_ascii_lowercase().ends_with(&needle))
}

fn reject(message: &'static str, status: StatusCode) -> ProxyError {
    ProxyError::new(message, None, Some(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn head(method: Method, version: Version, headers: &[(&'static str, &'static str)]) -> RequestHead {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(*name, HeaderValue::from_static(*value));
        }
        RequestHead {
            method,
            uri: Uri::from_static("/chat"),
            version,
            headers: map,
            connection: ConnectionInfo {
                local_addr: "127.0.0.1:8080".parse().unwrap(),
                remote_addr: "127.0.0.1:40000".parse().unwrap(),
                encrypted: false,
            },
        }
    }

    fn status_of(result: Result<(), ProxyError>) -> Option<StatusCode> {
        result.err().and_then(|e| e.status())
    }

    #[test]
    fn upgrade_requires_get() {
        let h = head(Method::POST, Version::HTTP_11, &[("upgrade", "websocket")]);
        assert_eq!(
            status_of(preflight(&h, ExchangeKind::Upgrade, None)),
            Some(StatusCode::METHOD_NOT_ALLOWED)
        );
    }

    #[test]
    fn upgrade_requires_websocket_header() {
        let missing = head(Method::GET, Version::HTTP_11, &[]);
        assert_eq!(
            status_of(preflight(&missing, ExchangeKind::Upgrade, None)),
            Some(StatusCode::BAD_REQUEST)
        );

        let other = head(Method::GET, Version::HTTP_11, &[("upgrade", "h2c")]);
        assert_eq!(
            status_of(preflight(&other, ExchangeKind::Upgrade, None)),
            Some(StatusCode::BAD_REQUEST)
        );

        let mixed_case = head(Method::GET, Version::HTTP_11, &[("upgrade", "WebSocket")]);
        assert!(preflight(&mixed_case, ExchangeKind::Upgrade, None).is_ok());
    }

    #[test]
    fn web_exchange_ignores_upgrade_rules() {
        let h = head(Method::POST, Version::HTTP_11, &[]);
        assert!(preflight(&h, ExchangeKind::Web, None).is_ok());
    }

    #[test]
    fn old_versions_are_rejected() {
        for version in [Version::HTTP_09, Version::HTTP_10, Version::HTTP_3] {
            let h = head(Method::GET, version, &[]);
            assert_eq!(
                status_of(preflight(&h, ExchangeKind::Web, None)),
                Some(StatusCode::HTTP_VERSION_NOT_SUPPORTED)
            );
        }
        let h2 = head(Method::GET, Version::HTTP_2, &[]);
        assert!(preflight(&h2, ExchangeKind::Web, None).is_ok());
    }

    #[test]
    fn via_loop_is_detected() {
        let looped = head(Method::GET, Version::HTTP_11, &[("via", "1.0 edge, 1.1 P1 ")]);
        assert_eq!(
            status_of(preflight(&looped, ExchangeKind::Web, Some("p1"))),
            Some(StatusCode::LOOP_DETECTED)
        );

        let clean = head(Method::GET, Version::HTTP_11, &[("via", "1.1 other")]);
        assert!(preflight(&clean, ExchangeKind::Web, Some("p1")).is_ok());
    }

    #[test]
    fn method_check_runs_first() {
        let h = head(Method::PUT, Version::HTTP_10, &[("via", "1.1 p1")]);
        let err = preflight(&h, ExchangeKind::Upgrade, Some("p1")).unwrap_err();
        assert_eq!(err.message(), "method not allowed");
    }
}
