//! # nyuki-api: capabilities and their HTTP exposer
//!
//! A [`Capability`] is a named endpoint template with one async handler per
//! HTTP method. The [`Exposer`] turns a set of capabilities into an axum
//! router, serves it, restarts it on another address on reload, and lets the
//! bus run requests through the same routes with [`Exposer::dispatch`].
//!
//! ## Module Overview
//!
//! - [`capability`]: `Capability` builder, `Request`, `Response`
//! - [`template`]: `/path/{param:int}` endpoint templates
//! - [`exposer`]: routing table and server lifecycle
//! - [`reporting`]: exception hook fed by the middleware
//! - [`error`]: `ExposerError`, `CapabilityError`

pub mod capability;
pub mod error;
pub mod exposer;
mod middleware;
pub mod reporting;
pub mod template;

pub use capability::{Capability, CapabilityBuilder, Handler, HandlerResult, Request, Response};
pub use error::{CapabilityError, ExposerError};
pub use exposer::{ApiConfig, DEFAULT_API_HOST, DEFAULT_API_PORT, Exposer};
pub use reporting::{Exception, ExceptionHook, ExceptionReporter};
pub use template::EndpointTemplate;
