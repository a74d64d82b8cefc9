//! Front-door TCP listener for the relay server.
//!
//! # Responsibilities
//! - Bind the configured listen address
//! - Hand accepted client sockets to the server loop
//! - Cap concurrent client sockets with a semaphore
//!
//! # Design Decisions
//! - The slot is taken before `accept`, so a full relay leaves new clients
//!   in the kernel backlog instead of accepting and dropping them.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::ListenerConfig;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("cannot bind listen address: {0}")]
    Bind(std::io::Error),
    #[error("accept failed: {0}")]
    Accept(std::io::Error),
    #[error("listener closed")]
    Closed,
}

/// Client-facing listener with a bounded number of live sockets.
#[derive(Debug)]
pub struct Listener {
    tcp: TcpListener,
    slots: Arc<Semaphore>,
}

impl Listener {
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
            ListenerError::Bind(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;

        let tcp = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        Ok(Self::from_tcp(tcp, config.max_connections))
    }

    /// Wrap a listener that is already bound, e.g. to an ephemeral port.
    pub fn from_tcp(tcp: TcpListener, max_connections: usize) -> Self {
        if let Ok(addr) = tcp.local_addr() {
            tracing::info!(address = %addr, max_connections, "relay listening");
        }

        Self {
            tcp,
            slots: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Wait for a free slot, then for the next client.
    ///
    /// The returned [`ClientSlot`] must live as long as the client socket.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ClientSlot), ListenerError> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, peer) = self.tcp.accept().await.map_err(ListenerError::Accept)?;
        tracing::debug!(
            peer = %peer,
            free_slots = self.slots.available_permits(),
            "client accepted"
        );

        Ok((stream, peer, ClientSlot { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.tcp.local_addr()
    }

    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

/// One occupied client slot; released on drop.
#[derive(Debug)]
pub struct ClientSlot {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slot_is_released_on_drop() {
        let config = ListenerConfig {
            bind_address: "127.0.0.1:0".into(),
            max_connections: 2,
        };
        let listener = Listener::bind(&config).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, _peer, slot) = listener.accept().await.unwrap();
        assert_eq!(listener.free_slots(), 1);

        drop(slot);
        assert_eq!(listener.free_slots(), 2);
    }

    #[tokio::test]
    async fn unparsable_address_fails_to_bind() {
        let config = ListenerConfig {
            bind_address: "not-an-address".into(),
            max_connections: 1,
        };
        assert!(matches!(
            Listener::bind(&config).await,
            Err(ListenerError::Bind(_))
        ));
    }
}
