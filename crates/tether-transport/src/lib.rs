//! Transport layer for Tether.
//!
//! This crate provides:
//! - `DuplexConnection`: a bidirectional channel of whole frames with a shared lifecycle
//! - `ClientTransport` / `ServerTransport`: the capabilities a session needs from a transport
//! - An in-memory transport for tests and embedding
//! - A TCP transport using a 24-bit length prefix per frame
//! - Connection interceptors (plugins)

pub mod connection;
pub mod local;
pub mod plugins;
pub mod tcp;
pub mod transport;

pub use connection::{
    link_lifecycles, ConnectionIo, DuplexConnection, FrameReceiver, FrameSender, Lifecycle,
    DEFAULT_BUFFER,
};
pub use plugins::{tap, ConnectionInterceptor, Direction, FrameLoggingInterceptor, PluginRegistry};
pub use tcp::{TcpClientTransport, TcpServerTransport};
pub use transport::{BoxFuture, ClientTransport, ConnectionAcceptor, ServerHandle, ServerTransport};
