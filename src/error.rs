//! Proxy error type.
//!
//! # Responsibilities
//! - Carry a message, an optional transport-level code and an optional status
//! - Translate io, hyper and http errors into the transport-level codes the
//!   classifier understands
//!
//! The status is left empty for transport failures; `handlers::error::classify`
//! decides the client-facing status later.

use std::borrow::Cow;
use std::fmt;
use std::io;

use http::StatusCode;

/// Boxed error used for sources and body streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Transport-level failure class attached to a [`ProxyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Upstream refused the connection.
    ConnRefused,
    /// Upstream hostname did not resolve.
    NotFound,
    /// Upstream sent a response that failed to parse.
    InvalidResponse,
    /// The connection was reset or hung up mid-exchange.
    ConnReset,
}

impl ErrorCode {
    /// Conventional socket error name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnRefused => "ECONNREFUSED",
            ErrorCode::NotFound => "ENOTFOUND",
            ErrorCode::InvalidResponse => "HPE_INVALID",
            ErrorCode::ConnReset => "ECONNRESET",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error terminating an exchange.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ProxyError {
    message: Cow<'static, str>,
    code: Option<ErrorCode>,
    status: Option<StatusCode>,
    #[source]
    source: Option<BoxError>,
}

impl ProxyError {
    /// Create an error with an optional code and status.
    pub fn new(
        message: impl Into<Cow<'static, str>>,
        code: Option<ErrorCode>,
        status: Option<StatusCode>,
    ) -> Self {
        Self {
            message: message.into(),
            code,
            status,
            source: None,
        }
    }

    /// Attach the underlying cause.
    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Inbound side went idle for longer than the configured timeout.
    pub fn request_timeout() -> Self {
        Self::new("request timeout", None, Some(StatusCode::REQUEST_TIMEOUT))
    }

    /// Upstream side went idle for longer than the configured proxy timeout.
    pub fn gateway_timeout() -> Self {
        Self::new("gateway timeout", None, Some(StatusCode::GATEWAY_TIMEOUT))
    }

    /// Upstream response was cut off before it completed.
    pub fn socket_hang_up() -> Self {
        Self::new(
            "socket hang up",
            Some(ErrorCode::ConnReset),
            Some(StatusCode::BAD_GATEWAY),
        )
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<ErrorCode> {
        self.code
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Status to respond with, 500 when none was attached.
    pub fn status_or_default(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Recover a `ProxyError` from a boxed error, mapping known transport types.
    pub fn from_boxed(err: BoxError) -> Self {
        let err = match err.downcast::<ProxyError>() {
            Ok(err) => return *err,
            Err(err) => err,
        };
        let err = match err.downcast::<hyper::Error>() {
            Ok(err) => return (*err).into(),
            Err(err) => err,
        };
        match err.downcast::<io::Error>() {
            Ok(err) => (*err).into(),
            Err(err) => Self::new(err.to_string(), None, None).with_source(err),
        }
    }
}

fn code_for_io(kind: io::ErrorKind) -> Option<ErrorCode> {
    match kind {
        io::ErrorKind::ConnectionRefused => Some(ErrorCode::ConnRefused),
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(ErrorCode::ConnReset),
        _ => None,
    }
}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<ProxyError>()) {
            if let Some(inner) = err.into_inner() {
                return Self::from_boxed(inner);
            }
            return Self::new("io error", None, None);
        }
        let code = code_for_io(err.kind());
        Self::new(err.to_string(), code, None).with_source(err)
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        let code = if err.is_parse() || err.is_parse_status() {
            Some(ErrorCode::InvalidResponse)
        } else if err.is_incomplete_message() || err.is_canceled() || err.is_closed() {
            Some(ErrorCode::ConnReset)
        } else {
            let mut source = std::error::Error::source(&err);
            let mut found = None;
            while let Some(cause) = source {
                if let Some(io_err) = cause.downcast_ref::<io::Error>() {
                    found = code_for_io(io_err.kind());
                    break;
                }
                source = cause.source();
            }
            found
        };
        Self::new(err.to_string(), code, None).with_source(err)
    }
}

impl From<http::Error> for ProxyError {
    fn from(err: http::Error) -> Self {
        Self::new(err.to_string(), None, None).with_source(err)
    }
}

impl From<http::header::InvalidHeaderValue> for ProxyError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Self::new(err.to_string(), None, None).with_source(err)
    }
}
