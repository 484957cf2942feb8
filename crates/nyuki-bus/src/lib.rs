//! # nyuki-bus: chat-room message bus
//!
//! Topics are rooms on a MUC domain, requests are direct messages correlated
//! by message id. [`Bus`] owns one logical session at a time and reports its
//! lifecycle (`connecting`, `connected`, `connection_error`, `disconnected`)
//! and inbound traffic through an [`nyuki_events::EventManager`].
//!
//! The chat server is reached through the [`Transport`] trait;
//! [`MemoryHub`] is a complete in-process implementation.

mod bus;
mod client;
pub mod config;
pub mod memory;
mod pending;
mod response;
pub mod transport;

pub use bus::Bus;
pub use client::{BusClient, ConnectionState};
pub use config::BusConfig;
pub use memory::MemoryHub;
pub use pending::{PendingRequest, PendingRequests};
pub use response::BusResponse;
pub use transport::{Link, SessionParams, Transport, TransportEvent, TransportSession};
