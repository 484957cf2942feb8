use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use nyuki_protocol::Method;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CapabilityError, ExposerError};
use crate::template::EndpointTemplate;

pub type HandlerResult = Result<Option<Response>, CapabilityError>;
pub type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Transport-agnostic input of a capability handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub params: HashMap<String, String>,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: HashMap::new(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn param_as<T: FromStr>(&self, name: &str) -> Option<T> {
        self.param(name)?.parse().ok()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Status plus JSON body. A response without body is sent empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Option<Value>,
}

impl Response {
    pub fn new(body: impl Serialize) -> Self {
        Self::with_status(200, body)
    }

    pub fn with_status(status: u16, body: impl Serialize) -> Self {
        Self {
            status,
            // Maps with non-string keys degrade to an empty body.
            body: serde_json::to_value(body).ok(),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self { status, body: None }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::empty(200)
    }
}

/// A named HTTP resource: an endpoint template and one handler per method.
#[derive(Clone)]
pub struct Capability {
    name: String,
    endpoint: EndpointTemplate,
    versions: Vec<String>,
    handlers: IndexMap<Method, Handler>,
}

impl Capability {
    pub fn builder(name: impl Into<String>, endpoint: impl Into<String>) -> CapabilityBuilder {
        CapabilityBuilder {
            name: name.into(),
            endpoint: endpoint.into(),
            versions: Vec::new(),
            handlers: IndexMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &EndpointTemplate {
        &self.endpoint
    }

    pub fn versions(&self) -> &[String] {
        &self.versions
    }

    pub fn methods(&self) -> impl Iterator<Item = Method> + '_ {
        self.handlers.keys().copied()
    }

    pub fn handler(&self, method: Method) -> Option<&Handler> {
        self.handlers.get(&method)
    }

    /// Templates this capability is served under: `/{version}{endpoint}` for
    /// each version, or the bare endpoint when unversioned.
    pub fn mounts(&self) -> Vec<EndpointTemplate> {
        if self.versions.is_empty() {
            vec![self.endpoint.clone()]
        } else {
            self.versions
                .iter()
                .map(|version| self.endpoint.versioned(version))
                .collect()
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint.to_string())
            .field("versions", &self.versions)
            .field("methods", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct CapabilityBuilder {
    name: String,
    endpoint: String,
    versions: Vec<String>,
    handlers: IndexMap<Method, Handler>,
}

impl CapabilityBuilder {
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.versions.push(version.into());
        self
    }

    /// Declares the handler for `method`, replacing an earlier one.
    pub fn handler<F, Fut>(mut self, method: Method, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |request| handler(request).boxed());
        self.handlers.insert(method, handler);
        self
    }

    pub fn get<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handler(Method::Get, handler)
    }

    pub fn post<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handler(Method::Post, handler)
    }

    pub fn put<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handler(Method::Put, handler)
    }

    pub fn patch<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handler(Method::Patch, handler)
    }

    pub fn delete<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handler(Method::Delete, handler)
    }

    pub fn build(self) -> Result<Capability, ExposerError> {
        if self.name.trim().is_empty() {
            return Err(ExposerError::UnnamedCapability);
        }
        if self.handlers.is_empty() {
            return Err(ExposerError::NoMethods(self.name));
        }
        for version in &self.versions {
            if version.is_empty() || version.contains(['/', '{', '}']) {
                return Err(ExposerError::InvalidTemplate {
                    endpoint: format!("/{version}{}", self.endpoint),
                    reason: "versions are plain path segments".to_owned(),
                });
            }
        }
        let endpoint = EndpointTemplate::parse(&self.endpoint)?;

        Ok(Capability {
            name: self.name,
            endpoint,
            versions: self.versions,
            handlers: self.handlers,
        })
    }
}
