//! Outbound connections to the upstream.
//!
//! # Responsibilities
//! - Resolve the upstream hostname
//! - Try each resolved address until one accepts
//! - Report resolution failures and refusals with the codes the error
//!   classifier expects

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{ErrorCode, ProxyError};
use crate::net::socket::PrepareSocket;

/// Opens transport connections to the upstream.
pub trait Connect: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + PrepareSocket + Unpin + Send + 'static;

    fn connect(
        &self,
        hostname: &str,
        port: u16,
    ) -> impl Future<Output = Result<Self::Io, ProxyError>> + Send;
}

/// Plain TCP connector backed by the system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connect for TcpConnector {
    type Io = TcpStream;

    async fn connect(&self, hostname: &str, port: u16) -> Result<TcpStream, ProxyError> {
        let addrs = tokio::net::lookup_host((hostname, port)).await.map_err(|e| {
            ProxyError::new(
                format!("getaddrinfo ENOTFOUND {hostname}"),
                Some(ErrorCode::NotFound),
                None,
            )
            .with_source(e)
        })?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    tracing::trace!(upstream = %addr, "Upstream connected");
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(upstream = %addr, error = %e, "Upstream connect failed");
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) => e.into(),
            None => ProxyError::new(
                format!("getaddrinfo ENOTFOUND {hostname}"),
                Some(ErrorCode::NotFound),
                None,
            ),
        })
    }
}
