//! Header transformation for both legs of an exchange.
//!
//! # Responsibilities
//! - Strip hop-by-hop headers, including those named by `Connection`
//! - Build the outbound request header set
//! - Extend the `Forwarded` and `Via` chains without replacing prior hops
//!
//! `http::HeaderMap` cannot store HTTP/2 pseudo-headers, so `:authority`,
//! `:method`, `:path` and `:scheme` never reach the outbound leg. The
//! authority travels in the request URI instead (see `RequestHead::authority`).

use std::sync::LazyLock;

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use regex::Regex;

use crate::error::ProxyError;
use crate::http::request::RequestHead;

/// Headers that only describe a single transport leg.
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "upgrade",
    "proxy-authorization",
    "proxy-connection",
    "http2-settings",
];

static FORWARDED_FOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)for=\s*([^\s;,]+)").expect("static regex")
});

/// Comma-join every value of a (possibly repeated) header.
pub fn joined(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<String> {
    let mut values = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .peekable();
    values.peek()?;
    Some(values.collect::<Vec<_>>().join(", "))
}

/// Remove hop-by-hop headers in place.
///
/// Names listed in `Connection` are dropped too, unless its value is exactly
/// `close`.
pub fn sanitize_hop_by_hop(headers: &mut HeaderMap) {
    if let Some(connection) = joined(headers, header::CONNECTION) {
        if connection != "close" {
            for name in connection.split(',') {
                let name = name.trim().to_ascii_lowercase();
                if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                    headers.remove(name);
                }
            }
        }
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Build the `Forwarded` value for this hop.
///
/// Format: `by=<local>; for=<remote>[; for=<prior>...][; host=<host>]; proto=<http|https>`.
pub fn forwarded_value(head: &RequestHead) -> String {
    let info = &head.connection;
    let mut value = format!(
        "by={}; for={}",
        info.local_addr.ip(),
        info.remote_addr.ip()
    );

    if let Some(prior) = joined(&head.headers, header::FORWARDED) {
        for captures in FORWARDED_FOR.captures_iter(&prior) {
            value.push_str("; for=");
            value.push_str(&captures[1]);
        }
    }

    if let Some(host) = head.authority().or_else(|| head.header_str(header::HOST)) {
        value.push_str("; host=");
        value.push_str(host);
    }

    value.push_str(if info.encrypted {
        "; proto=https"
    } else {
        "; proto=http"
    });
    value
}

/// Extend the `Via` chain with `proxy_name`.
pub fn append_via(headers: &mut HeaderMap, proxy_name: &str) -> Result<(), ProxyError> {
    let via = match joined(headers, header::VIA) {
        Some(existing) => format!("{existing},{proxy_name}"),
        None => proxy_name.to_string(),
    };
    headers.insert(header::VIA, HeaderValue::from_str(&via)?);
    Ok(())
}

/// Build the header set sent upstream for `head`.
pub fn build_outbound_headers(
    head: &RequestHead,
    proxy_name: Option<&str>,
) -> Result<HeaderMap, ProxyError> {
    let mut headers = head.headers.clone();
    sanitize_hop_by_hop(&mut headers);

    if head.headers.contains_key(header::UPGRADE) {
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    }

    headers.insert(
        header::FORWARDED,
        HeaderValue::from_str(&forwarded_value(head))?,
    );

    if let Some(name) = proxy_name.filter(|name| !name.is_empty()) {
        append_via(&mut headers, name)?;
    }

    Ok(headers)
}
