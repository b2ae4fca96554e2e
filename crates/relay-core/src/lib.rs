//! # relay-core
//!
//! Shared vocabulary for the relay chat backend.
//!
//! This crate provides the types every other relay crate depends on:
//!
//! - **Branded IDs**: [`ids::UserId`], [`ids::ConnectionId`] as newtypes
//! - **Wire envelope**: [`envelope::Envelope`] tagged union with an explicit
//!   [`envelope::InboundFrame::Opaque`] fallback for unparseable frames
//! - **Errors**: [`errors::RelayError`] hierarchy via `thiserror`
//! - **Session tokens**: [`auth::Claims`], issue/validate over HS256
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by `relay-store` and `relay-server`.

#![deny(unsafe_code)]

pub mod auth;
pub mod envelope;
pub mod errors;
pub mod ids;

pub use auth::{AuthUser, Claims, TokenKeys};
pub use envelope::{normalize, Envelope, InboundFrame, MAX_FRAME_BYTES};
pub use errors::RelayError;
pub use ids::{ConnectionId, UserId};
