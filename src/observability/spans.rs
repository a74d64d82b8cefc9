//! Exchange spans.
//!
//! Every exchange runs inside one `exchange` span so that log lines from the
//! dispatcher, relay and tunnel can be correlated.

use tracing::Span;
use uuid::Uuid;

use crate::http::request::{ExchangeKind, RequestHead};

/// Span covering one exchange.
pub fn exchange_span(id: Uuid, kind: ExchangeKind, head: &RequestHead) -> Span {
    tracing::info_span!(
        "exchange",
        id = %id,
        kind = kind.as_str(),
        method = %head.method,
        path = head.path(),
        peer = %head.connection.remote_addr,
    )
}
