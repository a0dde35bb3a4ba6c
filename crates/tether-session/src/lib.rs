//! Session layer for Tether.
//!
//! This crate provides:
//! - `ConnectionMultiplexer`: splits one connection into control, initiator and acceptor views
//! - `ResumableConnection`: keeps a session alive across physical connections
//! - Keepalive tracking
//! - `Session`: the handle used to issue requests and serve a responder

pub mod keepalive;
pub mod multiplexer;
pub mod resumable;
pub mod session;

pub use keepalive::{KeepAliveTick, KeepAliveTracker};
pub use multiplexer::{ConnectionMultiplexer, MuxView, ViewKind, ViewSender};
pub use resumable::{ResumableConnection, ResumeStatus};
pub use session::{FnResponder, RejectingResponder, RequesterStream, Responder, Session};
