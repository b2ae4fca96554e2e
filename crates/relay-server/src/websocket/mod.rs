//! WebSocket connection management, routing, and cross-instance fan-out.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `connection` | Upgrade auth, per-connection read/write pumps |
//! | `hub` | Single-writer registry: register/unregister/broadcast/direct |
//! | `fanout` | Redis pub/sub bridge between server instances |
//!
//! ## Data Flow
//!
//! `connection` (read pump) → parse → rate check (structured frames
//! only) → sender stamp → `fanout` (broadcast) or `hub` (direct).
//! `fanout` delivers locally through the
//! hub immediately and publishes for other instances; each instance's
//! subscriber feeds remote frames back into its local hub only.

pub mod connection;
pub mod fanout;
pub mod hub;
