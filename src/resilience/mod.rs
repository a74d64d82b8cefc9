//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Exchange in flight:
//!     → timeouts.rs (idle clocks on the client and upstream sides)
//!     → On expiry: 408 (client idle) or 504 (upstream idle)
//! ```
//!
//! # Design Decisions
//! - Timeouts measure inactivity, not total duration
//! - A zero timeout disables the clock

pub mod timeouts;
