//! Bus identities.
//!
//! A JID has the shape `[user@]domain[/resource]`. Nyukis always bind with the
//! `nyuki` resource; rooms are plain `name@muc-domain` addresses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resource every nyuki session binds to.
pub const NYUKI_RESOURCE: &str = "nyuki";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    #[error("empty JID")]
    Empty,
    #[error("JID `{0}` has an empty domain")]
    EmptyDomain(String),
    #[error("JID `{0}` has an empty local part")]
    EmptyUser(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    user: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(user: Option<&str>, domain: impl Into<String>, resource: Option<&str>) -> Self {
        Self {
            user: user.map(ToOwned::to_owned),
            domain: domain.into(),
            resource: resource.map(ToOwned::to_owned),
        }
    }

    /// Address of a room (`{name}@{muc_domain}`).
    pub fn room(name: &str, muc_domain: &str) -> Self {
        Self::new(Some(name), muc_domain, None)
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_owned());
        self
    }

    /// The JID without its resource.
    pub fn bare(&self) -> Jid {
        Self {
            user: self.user.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(JidError::Empty);
        }

        let (rest, resource) = match raw.split_once('/') {
            Some((rest, resource)) if !resource.is_empty() => (rest, Some(resource)),
            Some((rest, _)) => (rest, None),
            None => (raw, None),
        };

        let (user, domain) = match rest.split_once('@') {
            Some(("", _)) => return Err(JidError::EmptyUser(raw.to_owned())),
            Some((user, domain)) => (Some(user), domain),
            None => (None, rest),
        };

        if domain.is_empty() {
            return Err(JidError::EmptyDomain(raw.to_owned()));
        }

        Ok(Self::new(user, domain, resource))
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}
