//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (sniff first head, pick web or upgrade path)
//!     → request.rs (inbound head, preflight checks)
//!     → proxy.rs (outbound request, timeouts, error routing)
//!     → response.rs (relay upstream response to the client sink)
//!     → websocket.rs (101 handshake, byte tunnel)
//! ```

pub mod proxy;
pub mod request;
pub mod response;
pub mod server;
pub mod websocket;

pub use proxy::{OutboundRequestSpec, Outcome, Proxy, ProxyOptions};
pub use request::{ConnectionInfo, ExchangeKind, InboundRequest, RequestHead};
pub use response::{ClientConnection, PendingResponse, ResponseSink};
pub use server::HttpServer;
pub use websocket::ClientSocket;
