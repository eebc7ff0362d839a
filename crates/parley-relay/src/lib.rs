//! parley-relay: WebSocket signaling relay for peer-to-peer calls.
//!
//! Identifies each connection as an endpoint, then routes call-control
//! and negotiation envelopes between endpoints. Media never passes
//! through the relay and session descriptions are forwarded untouched.

pub mod connection;
pub mod directory;
pub mod hub;
pub mod server;

pub use directory::EndpointRegistry;
pub use hub::Relay;
pub use server::{serve, ConnectionSettings};
