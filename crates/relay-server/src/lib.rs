//! # relay-server
//!
//! Axum HTTP + WebSocket server for the relay chat backend.
//!
//! A client authenticates with a bearer token and upgrades to a
//! WebSocket; one connection actor (read/write pumps) runs per socket.
//! Inbound frames are rate-checked, stamped with the verified sender
//! identity, and routed by the single-writer hub either to one
//! recipient's mailbox or to every local mailbox plus the redis fan-out
//! channel. Slow consumers are disconnected, never waited on.
//!
//! Exposed as a library so integration tests can assemble the router
//! against an in-process server.

#![deny(unsafe_code)]

pub mod config;
pub mod http;
pub mod metrics;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use http::build_router;
pub use state::{build_state, AppState};
