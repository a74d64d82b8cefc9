//! Error classification and the single-fire terminal handlers.
//!
//! # Responsibilities
//! - Map transport failures to client-facing status codes
//! - Deliver at most one terminal response (or teardown) per exchange
//! - Invoke the caller's completion callback exactly once, or hand the
//!   error back when there is none
//! - Abort the outbound request when the upstream side fails
//!
//! # Data Flow
//! ```text
//! upstream failure ─▶ ProxyErrorHandler ─▶ classify ─▶ ErrorHandler ─▶ client
//!                          │                    │
//!                          └─ abort outbound    └─ reset after self-abort: dropped
//! preflight / request timeout ──────────────────────▶ ErrorHandler ─▶ client
//! ```

use std::sync::Arc;

use http::StatusCode;
use tokio::task::AbortHandle;

use crate::error::{ErrorCode, ProxyError};
use crate::handlers::pool::{HandlerPool, Pooled, Recycle};
use crate::http::request::RequestHead;
use crate::http::response::ClientConnection;
use crate::observability::metrics;

/// Completion callback invoked once when an error terminates an exchange.
pub type ErrorCallback =
    Box<dyn FnOnce(ProxyError, &RequestHead, &mut dyn ClientConnection) + Send>;

/// Assign a client-facing status to `err`.
///
/// Returns `None` for a reset caused by the proxy's own abort.
pub fn classify(mut err: ProxyError, outbound_aborted: bool) -> Option<ProxyError> {
    match err.code() {
        Some(ErrorCode::ConnRefused | ErrorCode::NotFound) => {
            err.set_status(StatusCode::SERVICE_UNAVAILABLE);
        }
        Some(ErrorCode::InvalidResponse) => err.set_status(StatusCode::BAD_GATEWAY),
        Some(ErrorCode::ConnReset) if outbound_aborted => return None,
        Some(ErrorCode::ConnReset) => err.set_status(StatusCode::BAD_GATEWAY),
        None => {}
    }

    if err.status().is_none() {
        err.set_status(StatusCode::INTERNAL_SERVER_ERROR);
    }
    Some(err)
}

/// Pooled state of an [`ErrorHandler`].
#[derive(Default)]
pub struct ErrorState {
    fired: bool,
    callback: Option<ErrorCallback>,
}

impl Recycle for ErrorState {
    fn recycle(&mut self) {
        self.fired = false;
        self.callback = None;
    }
}

/// Terminal handler for one exchange.
pub struct ErrorHandler {
    state: Pooled<ErrorState>,
}

impl ErrorHandler {
    pub fn acquire(pool: &Arc<HandlerPool<ErrorState>>, callback: Option<ErrorCallback>) -> Self {
        let mut state = pool.acquire();
        if let Some(slot) = state.get_mut() {
            slot.fired = false;
            slot.callback = callback;
        }
        Self { state }
    }

    /// Whether a terminal action already happened.
    pub fn has_fired(&self) -> bool {
        self.state.get().map_or(true, |s| s.fired)
    }

    /// Terminate the exchange with `err`.
    ///
    /// Later calls are ignored. With no callback the error is returned after
    /// the client connection has been dealt with.
    pub fn handle(
        &mut self,
        err: ProxyError,
        head: &RequestHead,
        client: &mut dyn ClientConnection,
    ) -> Result<(), ProxyError> {
        let Some(state) = self.state.get_mut() else {
            return Ok(());
        };
        if state.fired {
            return Ok(());
        }
        state.fired = true;
        let callback = state.callback.take();

        let status = err.status_or_default();
        if client.is_closed() || client.headers_sent() {
            client.destroy();
        } else if let Some(writer) = client.writer() {
            if !writer.respond_status(status) {
                writer.destroy();
            }
        } else {
            client.destroy();
        }

        metrics::record_error(client.kind(), status);
        tracing::warn!(
            status = status.as_u16(),
            code = err.code().map(|c| c.as_str()),
            method = %head.method,
            path = head.path(),
            error = %err,
            "Exchange failed"
        );

        self.state.release();
        match callback {
            Some(callback) => {
                callback(err, head, client);
                Ok(())
            }
            None => Err(err),
        }
    }

    /// Terminate with `408 request timeout`.
    pub fn request_timeout(
        &mut self,
        head: &RequestHead,
        client: &mut dyn ClientConnection,
    ) -> Result<(), ProxyError> {
        self.handle(ProxyError::request_timeout(), head, client)
    }
}

/// Pooled state of a [`ProxyErrorHandler`].
#[derive(Debug, Default)]
pub struct ProxyErrorState {
    fired: bool,
    aborted: bool,
    outbound: Option<AbortHandle>,
}

impl Recycle for ProxyErrorState {
    fn recycle(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            if self.fired {
                outbound.abort();
            }
        }
        self.fired = false;
        self.aborted = false;
    }
}

/// Upstream-side error handler: classifies and aborts the outbound request.
pub struct ProxyErrorHandler {
    state: Pooled<ProxyErrorState>,
}

impl ProxyErrorHandler {
    pub fn acquire(pool: &Arc<HandlerPool<ProxyErrorState>>) -> Self {
        Self {
            state: pool.acquire(),
        }
    }

    /// Attach the task driving the outbound connection.
    pub fn track(&mut self, outbound: AbortHandle) {
        if let Some(state) = self.state.get_mut() {
            state.outbound = Some(outbound);
        }
    }

    /// Abort the outbound request.
    pub fn abort(&mut self) {
        if let Some(state) = self.state.get_mut() {
            state.aborted = true;
            if let Some(outbound) = &state.outbound {
                outbound.abort();
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.state.get().is_some_and(|s| s.aborted)
    }

    /// Classify an upstream failure.
    ///
    /// Returns the error to forward to the [`ErrorHandler`], or `None` when it
    /// was suppressed or a previous error already fired.
    pub fn handle(&mut self, err: ProxyError) -> Option<ProxyError> {
        let state = self.state.get_mut()?;
        if state.fired {
            return None;
        }
        state.fired = true;

        match classify(err, state.aborted) {
            Some(err) => {
                self.abort();
                Some(err)
            }
            None => {
                tracing::debug!("Reset after proxy abort suppressed");
                None
            }
        }
    }

    /// Upstream went idle past the proxy timeout.
    pub fn gateway_timeout(&mut self) -> Option<ProxyError> {
        self.handle(ProxyError::gateway_timeout())
    }

    /// Upstream response was cut off.
    pub fn socket_hang_up(&mut self) -> Option<ProxyError> {
        self.handle(ProxyError::socket_hang_up())
    }

    /// Return the state to the pool, aborting the outbound if an error fired.
    pub fn release(&mut self) {
        self.state.release();
    }
}
