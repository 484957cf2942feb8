//! # nyuki-protocol: shared nyuki types
//!
//! Contract crate shared by the bus, the HTTP exposer and the agent kernel.
//! It carries no runtime dependencies (no tokio, no axum) so every layer can
//! depend on it.
//!
//! ## Module Overview
//!
//! - [`jid`]: `user@host/resource` bus identities
//! - [`event`]: lifecycle/bus event tags and the immutable [`Event`] value
//! - [`message`]: bus messages (broadcast events, requests, replies) and [`Method`]
//! - [`error`]: `BusError`, `TransportError`

pub mod error;
pub mod event;
pub mod jid;
pub mod message;

pub use error::{BusError, BusResult, TransportError};
pub use event::{Event, EventKind};
pub use jid::{Jid, JidError};
pub use message::{
    Message, MessageBody, MessageKind, Method, MethodParseError, RequestBody, ResponseBody,
};
