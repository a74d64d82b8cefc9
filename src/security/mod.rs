//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request headers:
//!     → headers.rs (strip hop-by-hop, add Forwarded and Via)
//!     → Outbound request to the upstream
//! ```
//!
//! # Design Decisions
//! - Hop-by-hop headers never cross the proxy, in either direction
//! - Client-supplied `Forwarded` is kept and extended, not trusted

pub mod headers;
