//! Client SDK for Tether sessions.
//!
//! This crate provides client-side components:
//! - Client configuration
//! - Session establishment (SETUP) over any client transport
//! - Caller-driven resumption of a session over a new connection

pub mod client;
pub mod config;

pub use client::{ClientSession, TetherClient};
pub use config::ClientConfig;
