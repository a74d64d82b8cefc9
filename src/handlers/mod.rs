//! Per-exchange handlers and their pools.
//!
//! # Data Flow
//! ```text
//! Proxy::handle_web / handle_upgrade
//!     → HandlerPools::acquire (one lease per role)
//!     → error.rs (ErrorHandler, ProxyErrorHandler)
//!     → http::response::ResponseRelay / http::websocket::UpgradeTunnel
//!     → lease dropped → state recycled → back on the free list
//! ```
//!
//! # Design Decisions
//! - One pool per role, owned by the `Proxy` instance
//! - Release is idempotent and also happens on drop, so an exchange that is
//!   cancelled mid-flight still returns every slot

pub mod error;
pub mod pool;

use std::sync::Arc;

use crate::http::response::ResponseState;
use crate::http::websocket::UpgradeState;
use error::{ErrorState, ProxyErrorState};
use pool::{HandlerPool, HandlerRole};

pub use error::{classify, ErrorCallback, ErrorHandler, ProxyErrorHandler};
pub use pool::{Pooled, Recycle};

/// Default number of idle slots kept per role.
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// The four handler pools used by a proxy.
#[derive(Debug, Clone)]
pub struct HandlerPools {
    pub error: Arc<HandlerPool<ErrorState>>,
    pub proxy_error: Arc<HandlerPool<ProxyErrorState>>,
    pub response: Arc<HandlerPool<ResponseState>>,
    pub upgrade: Arc<HandlerPool<UpgradeState>>,
}

impl HandlerPools {
    pub fn new(max_idle: usize) -> Self {
        Self {
            error: Arc::new(HandlerPool::new(HandlerRole::Error, max_idle)),
            proxy_error: Arc::new(HandlerPool::new(HandlerRole::ProxyError, max_idle)),
            response: Arc::new(HandlerPool::new(HandlerRole::ProxyResponse, max_idle)),
            upgrade: Arc::new(HandlerPool::new(HandlerRole::ProxyUpgrade, max_idle)),
        }
    }

    /// Slots currently leased across all roles.
    pub fn leased(&self) -> usize {
        self.error.leased()
            + self.proxy_error.leased()
            + self.response.leased()
            + self.upgrade.leased()
    }

    /// Slots currently idle across all roles.
    pub fn idle(&self) -> usize {
        self.error.idle() + self.proxy_error.idle() + self.response.idle() + self.upgrade.idle()
    }
}

impl Default for HandlerPools {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE)
    }
}
