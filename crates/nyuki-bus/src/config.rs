use std::time::Duration;

use nyuki_protocol::{BusError, BusResult, Jid};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 5222;
pub const DEFAULT_MUC_DOMAIN: &str = "mucs.localhost";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// The `bus` section of a nyuki configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    pub jid: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Topics joined when the session starts, besides our own.
    #[serde(default)]
    pub rooms: Vec<String>,
    #[serde(default = "default_muc_domain")]
    pub muc_domain: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl BusConfig {
    pub fn new(jid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            password: password.into(),
            host: None,
            port: None,
            rooms: Vec::new(),
            muc_domain: default_muc_domain(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }

    /// Parses the JID. Without an explicit host the JID must carry a user,
    /// its domain being the server to reach.
    pub fn identity(&self) -> BusResult<Jid> {
        let jid: Jid = self.jid.parse()?;
        if self.host.is_none() && jid.user().is_none() {
            return Err(BusError::MissingUser(self.jid.clone()));
        }
        Ok(jid)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

fn default_muc_domain() -> String {
    DEFAULT_MUC_DOMAIN.to_owned()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}
