//! HTTP and WebSocket request handlers
//!
//! - `api` - Liveness and readiness checks
//! - `relay` - Browser audio relay WebSocket

pub mod api;
pub mod relay;

pub use relay::relay_handler;
