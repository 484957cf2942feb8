//! # nyuki-kernel: agent lifecycle
//!
//! A [`Nyuki`] wires a [`nyuki_bus::Bus`], a [`nyuki_api::Exposer`] and a
//! validated [`ConfigStore`] together and drives them from one event loop:
//! start, reload on configuration change, stop on request or signal.
//!
//! ## Module Overview
//!
//! - [`config`]: JSON configuration document, schemas, CLI overrides
//! - [`logging`]: subscriber installation and live filter reload
//! - [`hooks`]: agent-specific `on_start` / `on_stop`
//!
//! Every nyuki serves `GET`/`PATCH /config` (and `/v1/config`); a successful
//! patch is persisted and triggers a reload.

pub mod config;
mod config_api;
pub mod hooks;
pub mod logging;
mod nyuki;

pub use config::{CliOverrides, ConfigError, ConfigResult, ConfigStore};
pub use hooks::{NoHooks, NyukiHooks};
pub use logging::{LogConfig, LogFormat, LogHandle, LoggingError};
pub use nyuki::{
    DEFAULT_STOP_TIMEOUT, Nyuki, NyukiBuilder, NyukiHandle, NyukiState, exception_report,
};
