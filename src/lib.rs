//! Reverse proxy engine for a single upstream.
//!
//! Forwards plain HTTP exchanges and WebSocket upgrades, rewrites
//! forwarding headers, detects proxy loops through `Via`, and turns
//! transport failures into status codes.

pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::schema::ProxyConfig;
pub use error::{ErrorCode, ProxyError};
pub use handlers::ErrorCallback;
pub use http::{HttpServer, Outcome, Proxy, ProxyOptions};
pub use lifecycle::Shutdown;
