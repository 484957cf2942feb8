use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, reload};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// The `log` section of a nyuki configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// An `EnvFilter` directive: `info`, `nyuki_bus=debug,warn`...
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_level() -> String {
    "info".to_owned()
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level `{level}`: {source}")]
    InvalidLevel {
        level: String,
        #[source]
        source: ParseError,
    },
    #[error("log filter could not be swapped: {0}")]
    Reload(#[from] reload::Error),
}

/// Handle on the installed subscriber's filter.
#[derive(Clone, Debug)]
pub struct LogHandle {
    filter: reload::Handle<EnvFilter, Registry>,
    format: LogFormat,
}

impl LogHandle {
    /// Swaps the active filter. The output format is fixed at startup.
    pub fn apply(&self, config: &LogConfig) -> Result<(), LoggingError> {
        self.filter.reload(filter(&config.level)?)?;
        if config.format != self.format {
            info!(
                current = ?self.format,
                requested = ?config.format,
                "log format changes apply on next start"
            );
        }
        debug!(level = %config.level, "log filter reloaded");
        Ok(())
    }
}

pub fn filter(level: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_new(level).map_err(|source| LoggingError::InvalidLevel {
        level: level.to_owned(),
        source,
    })
}

/// Installs the global subscriber. `RUST_LOG`, when set, wins over the
/// configured level until the next reload.
///
/// If a subscriber is already installed the returned handle drives nothing
/// and `apply` reports the subscriber as gone.
pub fn init(config: &LogConfig) -> Result<LogHandle, LoggingError> {
    let initial = match EnvFilter::try_from_default_env() {
        Ok(from_env) => from_env,
        Err(_) => filter(&config.level)?,
    };
    let (filter_layer, handle) = reload::Layer::new(initial);

    let output = match config.format {
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    if let Err(error) = tracing_subscriber::registry()
        .with(filter_layer)
        .with(output)
        .try_init()
    {
        debug!(%error, "global subscriber already installed");
    }

    Ok(LogHandle {
        filter: handle,
        format: config.format,
    })
}
