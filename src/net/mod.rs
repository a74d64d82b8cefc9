//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → connection.rs (lifecycle tracking for drain)
//!     → Hand off to HTTP layer
//!
//! Outgoing upstream connection
//!     → connector.rs (resolve, connect)
//!     → socket.rs (no-delay, keep-alive, read push-back)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Upstream connections go through the `Connect` trait so tests and
//!   embedders can supply their own transport

pub mod connection;
pub mod connector;
pub mod listener;
pub mod socket;

pub use connector::{Connect, TcpConnector};
pub use listener::Listener;
pub use socket::{PrefixedStream, PrepareSocket};
