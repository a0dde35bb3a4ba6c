//! Server SDK for Tether sessions.
//!
//! This crate provides server-side components:
//! - Server configuration
//! - Session establishment: SETUP validation, acceptor invocation, rejection
//! - Resumption of live sessions by resume token

pub mod config;
pub mod registry;
pub mod server;

pub use config::ServerConfig;
pub use registry::SessionRegistry;
pub use server::{FnAcceptor, SocketAcceptor, TetherServer};
