//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Every exchange produces:
//!     → spans.rs (one `exchange` span with a UUID)
//!     → logging.rs (structured log events inside that span)
//!     → metrics.rs (exchange, error and upgrade counters)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Exchange ID flows through every event via the span
//! - Metrics go through the `metrics` facade; without an installed
//!   recorder they cost nothing

pub mod logging;
pub mod metrics;
pub mod spans;
