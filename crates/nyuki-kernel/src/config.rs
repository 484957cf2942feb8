//! Nyuki configuration: a JSON document built from defaults, a file and
//! command-line overrides, validated against JSON schemas before use.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use jsonschema::Validator;
use nyuki_api::{ApiConfig, DEFAULT_API_HOST, DEFAULT_API_PORT};
use nyuki_bus::BusConfig;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::logging::{self, LogConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuration {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not write configuration {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("invalid schema: {0}")]
    Schema(String),
    #[error("invalid `{section}` section: {source}")]
    Section {
        section: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid address `{0}`, expected host[:port]")]
    Address(String),
    #[error("unusable `{section}` section: {reason}")]
    Unusable {
        section: &'static str,
        reason: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Sections every nyuki has before the file and overrides are applied.
pub fn default_config() -> Value {
    json!({
        "bus": {},
        "api": {
            "host": DEFAULT_API_HOST,
            "port": DEFAULT_API_PORT,
        },
        "log": {
            "level": "info",
            "format": "compact",
        },
    })
}

/// Schema every nyuki configuration must satisfy.
pub fn base_schema() -> Value {
    json!({
        "type": "object",
        "required": ["bus", "api", "log"],
        "properties": {
            "bus": {
                "type": "object",
                "required": ["jid", "password"],
                "properties": {
                    "jid": {"type": "string", "minLength": 1},
                    "password": {"type": "string"},
                    "host": {"type": "string"},
                    "port": {"type": "integer", "minimum": 1, "maximum": 65535},
                    "rooms": {"type": "array", "items": {"type": "string"}},
                    "muc_domain": {"type": "string"},
                    "request_timeout_secs": {"type": "integer", "minimum": 1},
                    "connect_timeout_secs": {"type": "integer", "minimum": 1},
                },
            },
            "api": {
                "type": "object",
                "properties": {
                    "host": {"type": "string"},
                    "port": {"type": "integer", "minimum": 0, "maximum": 65535},
                },
            },
            "log": {
                "type": "object",
                "properties": {
                    "level": {"type": "string"},
                    "format": {"enum": ["compact", "json"]},
                },
            },
        },
    })
}

pub fn read_config_file(path: impl AsRef<Path>) -> ConfigResult<Value> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// Writes `config` as pretty JSON, creating missing parent directories.
pub fn write_config_file(path: impl AsRef<Path>, config: &Value) -> ConfigResult<()> {
    let path = path.as_ref();
    let write_error = |source| ConfigError::Write {
        path: path.to_owned(),
        source,
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_error)?;
    }
    let mut raw = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })?;
    raw.push('\n');
    fs::write(path, raw).map_err(write_error)
}

/// Recursively merges `patches` into `base`, left to right. Objects merge
/// key by key; any other value replaces what it lands on.
pub fn merge_configs<'a>(base: &Value, patches: impl IntoIterator<Item = &'a Value>) -> Value {
    let mut merged = base.clone();
    for patch in patches {
        merge_into(&mut merged, patch);
    }
    merged
}

fn merge_into(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Sets the value at dotted `path` (`"bus.port"`), creating intermediate
/// objects and replacing non-object values in the way.
pub fn update_config(config: &mut Value, path: &str, value: Value) {
    let mut keys: Vec<&str> = path.split('.').collect();
    let Some(last) = keys.pop() else {
        return;
    };

    let mut cursor = config;
    for key in keys {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        cursor = map
            .entry(key.to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Value::Object(map) = cursor {
        map.insert(last.to_owned(), value);
    }
}

/// Values given on the command line, applied on top of the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub jid: Option<String>,
    pub password: Option<String>,
    /// Bus server, `host[:port]`.
    pub server: Option<String>,
    /// API address, `host[:port]`.
    pub api: Option<String>,
    pub logging: Option<String>,
}

impl CliOverrides {
    pub fn apply(&self, config: &mut Value) -> ConfigResult<()> {
        if let Some(jid) = &self.jid {
            update_config(config, "bus.jid", json!(jid));
        }
        if let Some(password) = &self.password {
            update_config(config, "bus.password", json!(password));
        }
        if let Some(server) = &self.server {
            let (host, port) = split_address(server)?;
            update_config(config, "bus.host", json!(host));
            if let Some(port) = port {
                update_config(config, "bus.port", json!(port));
            }
        }
        if let Some(api) = &self.api {
            let (host, port) = split_address(api)?;
            update_config(config, "api.host", json!(host));
            if let Some(port) = port {
                update_config(config, "api.port", json!(port));
            }
        }
        if let Some(level) = &self.logging {
            update_config(config, "log.level", json!(level));
        }
        Ok(())
    }
}

fn split_address(address: &str) -> ConfigResult<(&str, Option<u16>)> {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| ConfigError::Address(address.to_owned()))?;
            if host.is_empty() {
                return Err(ConfigError::Address(address.to_owned()));
            }
            Ok((host, Some(port)))
        }
        None if address.is_empty() => Err(ConfigError::Address(address.to_owned())),
        None => Ok((address, None)),
    }
}

struct StoreInner {
    config: Value,
    path: Option<PathBuf>,
    validators: Vec<Arc<Validator>>,
}

/// The live configuration of a nyuki.
///
/// The document is only ever replaced wholesale, after it passed every
/// registered schema. Readers get copies.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl ConfigStore {
    /// Validates `config` against the base schema and takes ownership of it.
    pub fn new(config: Value) -> ConfigResult<Self> {
        let store = Self {
            inner: Arc::new(RwLock::new(StoreInner {
                config: Value::Null,
                path: None,
                validators: Vec::new(),
            })),
        };
        store.register_schema(&base_schema())?;
        store.replace(config)?;
        Ok(store)
    }

    /// Defaults, then the file at `path` if any, then `overrides`.
    #[instrument(skip(overrides))]
    pub fn load(path: Option<&Path>, overrides: &CliOverrides) -> ConfigResult<Self> {
        let mut config = default_config();
        if let Some(path) = path {
            let file = read_config_file(path)?;
            config = merge_configs(&config, [&file]);
            info!(path = %path.display(), "configuration file loaded");
        }
        overrides.apply(&mut config)?;

        let store = Self::new(config)?;
        store.inner.write().path = path.map(Path::to_path_buf);
        Ok(store)
    }

    /// Where `save` writes, if anywhere.
    pub fn with_path(self, path: impl Into<PathBuf>) -> Self {
        self.inner.write().path = Some(path.into());
        self
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner.read().path.clone()
    }

    pub fn get(&self) -> Value {
        self.inner.read().config.clone()
    }

    /// Adds a schema the configuration must satisfy from now on. The current
    /// document is not re-checked.
    pub fn register_schema(&self, schema: &Value) -> ConfigResult<()> {
        let validator =
            jsonschema::validator_for(schema).map_err(|error| ConfigError::Schema(error.to_string()))?;
        self.inner.write().validators.push(Arc::new(validator));
        debug!("configuration schema registered");
        Ok(())
    }

    pub fn validate(&self, config: &Value) -> ConfigResult<()> {
        let validators = self.inner.read().validators.clone();
        for validator in validators {
            if let Some(error) = validator.iter_errors(config).next() {
                return Err(ConfigError::Invalid(error.to_string()));
            }
        }
        Ok(())
    }

    pub fn replace(&self, config: Value) -> ConfigResult<()> {
        self.validate(&config)?;
        self.inner.write().config = config;
        Ok(())
    }

    /// Merges `patch` into a copy of the current document and swaps the
    /// result in if it validates and its sections can be applied. Returns
    /// the new document.
    pub fn patch(&self, patch: &Value) -> ConfigResult<Value> {
        let merged = merge_configs(&self.get(), [patch]);
        self.validate(&merged)?;
        check_sections(&merged)?;
        self.inner.write().config = merged.clone();
        Ok(merged)
    }

    pub fn save(&self) -> ConfigResult<()> {
        let (path, config) = {
            let inner = self.inner.read();
            (inner.path.clone(), inner.config.clone())
        };
        match path {
            Some(path) => {
                write_config_file(&path, &config)?;
                debug!(path = %path.display(), "configuration saved");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn bus_config(&self) -> ConfigResult<BusConfig> {
        self.section("bus")
    }

    pub fn api_config(&self) -> ConfigResult<ApiConfig> {
        self.section("api")
    }

    pub fn log_config(&self) -> ConfigResult<LogConfig> {
        self.section("log")
    }

    fn section<T: DeserializeOwned>(&self, section: &'static str) -> ConfigResult<T> {
        section_of(&self.inner.read().config, section)
    }
}

fn section_of<T: DeserializeOwned>(config: &Value, section: &'static str) -> ConfigResult<T> {
    let value = config
        .get(section)
        .cloned()
        .unwrap_or(Value::Object(Map::new()));
    serde_json::from_value(value).map_err(|source| ConfigError::Section { section, source })
}

/// Checks what the schemas cannot: the bus identity resolves and the log
/// level is a valid filter directive.
pub fn check_sections(config: &Value) -> ConfigResult<()> {
    let bus: BusConfig = section_of(config, "bus")?;
    bus.identity().map_err(|error| ConfigError::Unusable {
        section: "bus",
        reason: error.to_string(),
    })?;
    section_of::<ApiConfig>(config, "api")?;
    let log: LogConfig = section_of(config, "log")?;
    logging::filter(&log.level).map_err(|error| ConfigError::Unusable {
        section: "log",
        reason: error.to_string(),
    })?;
    Ok(())
}
