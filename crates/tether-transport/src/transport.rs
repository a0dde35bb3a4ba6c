//! Transport capabilities.
//!
//! Sessions only ever see these traits; which socket type backs a
//! [`DuplexConnection`] is invisible above this layer.

use crate::connection::{DuplexConnection, Lifecycle};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tether_core::TetherError;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Called once per inbound physical connection
pub type ConnectionAcceptor = Arc<dyn Fn(DuplexConnection) -> BoxFuture<()> + Send + Sync>;

/// Client side of a transport
pub trait ClientTransport: Send + Sync + 'static {
    /// Open a new physical connection
    fn connect(&self) -> BoxFuture<Result<DuplexConnection, TetherError>>;
}

/// Server side of a transport
pub trait ServerTransport: Send + Sync + 'static {
    /// Start accepting connections, handing each to `acceptor`
    fn start(&self, acceptor: ConnectionAcceptor) -> BoxFuture<Result<ServerHandle, TetherError>>;
}

/// Handle to a started server transport
#[derive(Debug, Clone)]
pub struct ServerHandle {
    lifecycle: Lifecycle,
    local_addr: Option<SocketAddr>,
}

impl ServerHandle {
    pub fn new(lifecycle: Lifecycle, local_addr: Option<SocketAddr>) -> Self {
        Self {
            lifecycle,
            local_addr,
        }
    }

    /// Bound address, for socket transports
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Stop accepting connections
    pub fn close(&self) {
        self.lifecycle.terminate(Ok(()));
    }

    pub async fn closed(&self) -> Result<(), TetherError> {
        self.lifecycle.terminated().await
    }
}
