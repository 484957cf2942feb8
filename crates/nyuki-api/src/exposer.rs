use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::extract::Request as HttpRequest;
use axum::http::header::CONTENT_TYPE;
use axum::response::Response as HttpResponse;
use axum::routing::{MethodFilter, MethodRouter};
use indexmap::IndexMap;
use nyuki_protocol::{Method, ResponseBody};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

use crate::capability::Capability;
use crate::error::ExposerError;
use crate::middleware::{self, BODY_LIMIT, Route};
use crate::reporting::{Exception, ExceptionReporter};

pub const DEFAULT_API_HOST: &str = "0.0.0.0";
pub const DEFAULT_API_PORT: u16 = 5558;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The `api` section of a nyuki configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl ApiConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_HOST, DEFAULT_API_PORT)
    }
}

fn default_host() -> String {
    DEFAULT_API_HOST.to_owned()
}

fn default_port() -> u16 {
    DEFAULT_API_PORT
}

struct Server {
    address: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

#[derive(Default)]
struct ExposerInner {
    router: RwLock<Option<Router>>,
    routes: RwLock<Vec<(Method, String)>>,
    server: Mutex<Option<Server>>,
    reporter: ExceptionReporter,
}

/// Owner of the routing table and of the HTTP server serving it.
///
/// The table is built once by [`Exposer::mount`] (or [`Exposer::expose`]);
/// the server can then be stopped and restarted on another address without
/// rebuilding it. Bus requests go through the same table with
/// [`Exposer::dispatch`].
#[derive(Clone, Default)]
pub struct Exposer {
    inner: Arc<ExposerInner>,
}

impl Exposer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the hook receiving handler failures.
    pub fn set_exception_hook<F>(&self, hook: F)
    where
        F: Fn(&Exception) + Send + Sync + 'static,
    {
        self.inner.reporter.set_hook(hook);
    }

    pub fn clear_exception_hook(&self) {
        self.inner.reporter.clear_hook();
    }

    /// Builds the routing table. Fails on duplicate names, or on two
    /// capabilities claiming the same method on the same path.
    pub fn mount(
        &self,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Result<(), ExposerError> {
        let mut router = self.inner.router.write();
        if router.is_some() {
            return Err(ExposerError::AlreadyExposed);
        }

        let (built, routes) = build_router(capabilities, &self.inner.reporter)?;
        for (method, path) in &routes {
            debug!(%method, %path, "route mounted");
        }
        *router = Some(built);
        *self.inner.routes.write() = routes;
        Ok(())
    }

    /// Mounts `capabilities` and starts serving them on `config`'s address.
    pub async fn expose(
        &self,
        capabilities: impl IntoIterator<Item = Capability>,
        config: &ApiConfig,
    ) -> Result<SocketAddr, ExposerError> {
        self.mount(capabilities)?;
        self.serve(config).await
    }

    #[instrument(skip(self), fields(address = %config.address()))]
    pub async fn serve(&self, config: &ApiConfig) -> Result<SocketAddr, ExposerError> {
        let router = self
            .inner
            .router
            .read()
            .clone()
            .ok_or(ExposerError::NotExposed)?;
        if let Some(address) = self.local_addr() {
            return Err(ExposerError::AlreadyRunning(address));
        }

        let bind_error = |source| ExposerError::Bind {
            address: config.address(),
            source,
        };
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(bind_error)?;
        let address = listener.local_addr().map_err(bind_error)?;

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stopped.await;
                })
                .await
        });

        let previous = self.inner.server.lock().replace(Server {
            address,
            stop,
            task,
        });
        if let Some(previous) = previous {
            warn!(address = %previous.address, "replacing a server started concurrently");
            previous.task.abort();
        }

        info!(%address, routes = self.inner.routes.read().len(), "api listening");
        Ok(address)
    }

    /// Stops the server, letting in-flight requests finish for up to the
    /// default grace period.
    pub async fn shutdown(&self) {
        self.shutdown_within(DEFAULT_SHUTDOWN_GRACE).await;
    }

    /// Returns false when the server had to be aborted.
    #[instrument(skip(self))]
    pub async fn shutdown_within(&self, grace: Duration) -> bool {
        let server = self.inner.server.lock().take();
        let Some(Server {
            address,
            stop,
            mut task,
        }) = server
        else {
            debug!("api not running");
            return true;
        };

        let _ = stop.send(());
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(Ok(()))) => {
                info!(%address, "api stopped");
                true
            }
            Ok(Ok(Err(error))) => {
                warn!(%address, %error, "api server failed");
                true
            }
            Ok(Err(error)) => {
                warn!(%address, %error, "api server task failed");
                true
            }
            Err(_) => {
                warn!(%address, ?grace, "api did not drain in time, aborting");
                task.abort();
                false
            }
        }
    }

    /// Stops the server and serves the same routes on `config`'s address.
    pub async fn restart(&self, config: &ApiConfig) -> Result<SocketAddr, ExposerError> {
        self.shutdown().await;
        self.serve(config).await
    }

    /// Runs one request through the routing table without a socket.
    #[instrument(skip(self, body))]
    pub async fn dispatch(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<ResponseBody, ExposerError> {
        let router = self
            .inner
            .router
            .read()
            .clone()
            .ok_or(ExposerError::NotExposed)?;

        let mut request = HttpRequest::builder().method(method.as_str()).uri(path);
        let body = match body {
            Some(body) => {
                request = request.header(CONTENT_TYPE, "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let request = request
            .body(body)
            .map_err(|error| ExposerError::Dispatch(error.to_string()))?;

        let response: HttpResponse = match router.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };
        let status = response.status().as_u16();
        let bytes = to_bytes(response.into_body(), BODY_LIMIT)
            .await
            .map_err(|error| ExposerError::Dispatch(error.to_string()))?;

        Ok(ResponseBody {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.lock().as_ref().map(|server| server.address)
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.router.read().is_some()
    }

    /// Mounted `(method, path)` pairs, in declaration order.
    pub fn routes(&self) -> Vec<(Method, String)> {
        self.inner.routes.read().clone()
    }
}

struct PathEntry {
    path: String,
    claims: IndexMap<Method, Arc<str>>,
    routes: Vec<(Method, Arc<Route>)>,
}

fn build_router(
    capabilities: impl IntoIterator<Item = Capability>,
    reporter: &ExceptionReporter,
) -> Result<(Router, Vec<(Method, String)>), ExposerError> {
    let mut names = HashSet::new();
    let mut paths: IndexMap<String, PathEntry> = IndexMap::new();
    let mut mounted = Vec::new();

    for capability in capabilities {
        if !names.insert(capability.name().to_owned()) {
            return Err(ExposerError::DuplicateCapability(
                capability.name().to_owned(),
            ));
        }
        let name: Arc<str> = Arc::from(capability.name());

        for template in capability.mounts() {
            let entry = paths
                .entry(template.shape())
                .or_insert_with(|| PathEntry {
                    path: template.route_path(),
                    claims: IndexMap::new(),
                    routes: Vec::new(),
                });

            for method in capability.methods() {
                if let Some(first) = entry.claims.get(&method) {
                    return Err(ExposerError::DuplicateRoute {
                        method,
                        path: template.to_string(),
                        first: first.to_string(),
                        second: name.to_string(),
                    });
                }
                let Some(handler) = capability.handler(method) else {
                    continue;
                };
                entry.claims.insert(method, Arc::clone(&name));
                entry.routes.push((
                    method,
                    Arc::new(Route {
                        capability: Arc::clone(&name),
                        template: template.clone(),
                        handler: Arc::clone(handler),
                        reporter: reporter.clone(),
                    }),
                ));
                mounted.push((method, template.to_string()));
            }
        }
    }

    let mut router = Router::new();
    for entry in paths.into_values() {
        let mut method_router: MethodRouter = MethodRouter::new();
        for (method, route) in entry.routes {
            method_router = method_router.on(method_filter(method), move |request: HttpRequest| {
                middleware::serve_request(Arc::clone(&route), request)
            });
        }
        router = router.route(&entry.path, method_router);
    }

    let router = router
        .fallback(|| async { middleware::not_found() })
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());
    Ok((router, mounted))
}

fn method_filter(method: Method) -> MethodFilter {
    match method {
        Method::Get => MethodFilter::GET,
        Method::Post => MethodFilter::POST,
        Method::Put => MethodFilter::PUT,
        Method::Patch => MethodFilter::PATCH,
        Method::Delete => MethodFilter::DELETE,
        Method::Head => MethodFilter::HEAD,
        Method::Options => MethodFilter::OPTIONS,
        Method::Trace => MethodFilter::TRACE,
        Method::Connect => MethodFilter::CONNECT,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use nyuki_protocol::Method;
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::Exposer;
    use crate::capability::{Capability, HandlerResult, Request, Response};
    use crate::error::{CapabilityError, ExposerError};

    fn echo() -> Capability {
        Capability::builder("echo", "/echo/{id:int}")
            .get(|request: Request| async move {
                HandlerResult::Ok(Some(Response::new(json!({"id": request.param("id")}))))
            })
            .post(|request: Request| async move {
                HandlerResult::Ok(Some(Response::with_status(201, request.body)))
            })
            .build()
            .unwrap()
    }

    fn failing() -> Capability {
        Capability::builder("failing", "/failing")
            .get(|_| async { HandlerResult::Err(CapabilityError::failed(anyhow::anyhow!("boom"))) })
            .put(explode)
            .delete(|_| async { HandlerResult::Err(CapabilityError::NotFound) })
            .patch(|_| async { HandlerResult::Ok(None) })
            .build()
            .unwrap()
    }

    async fn explode(_: Request) -> HandlerResult {
        panic!("kaboom")
    }

    fn json_body(text: &str) -> Value {
        serde_json::from_str(text).unwrap_or(Value::Null)
    }

    #[tokio::test]
    async fn typed_parameters_route_or_404() -> Result<()> {
        let exposer = Exposer::new();
        exposer.mount([echo()])?;

        let found = exposer.dispatch(Method::Get, "/echo/42", None).await?;
        assert_eq!(found.status, 200);
        assert_eq!(json_body(&found.body), json!({"id": "42"}));

        let mismatch = exposer.dispatch(Method::Get, "/echo/abc", None).await?;
        assert_eq!(mismatch.status, 404);

        let unknown = exposer.dispatch(Method::Get, "/nowhere", None).await?;
        assert_eq!(unknown.status, 404);
        Ok(())
    }

    #[tokio::test]
    async fn bodies_must_be_json() -> Result<()> {
        let exposer = Exposer::new();
        exposer.mount([echo()])?;

        let created = exposer
            .dispatch(Method::Post, "/echo/1", Some(&json!({"a": 1})))
            .await?;
        assert_eq!(created.status, 201);
        assert_eq!(json_body(&created.body), json!({"a": 1}));

        let router = exposer.inner.router.read().clone().unwrap();
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/echo/1")
            .body(axum::body::Body::from("{not json"))?;
        let response = tower::ServiceExt::oneshot(router, request).await?;
        assert_eq!(response.status(), 400);
        Ok(())
    }

    #[tokio::test]
    async fn undeclared_methods_answer_405() -> Result<()> {
        let exposer = Exposer::new();
        exposer.mount([echo()])?;
        let response = exposer.dispatch(Method::Delete, "/echo/1", None).await?;
        assert_eq!(response.status, 405);
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_reported_except_not_found() -> Result<()> {
        let exposer = Exposer::new();
        let reports = Arc::new(Mutex::new(Vec::new()));
        {
            let reports = Arc::clone(&reports);
            exposer.set_exception_hook(move |exception| {
                reports
                    .lock()
                    .push((exception.method, exception.message.clone()));
            });
        }
        exposer.mount([failing()])?;

        assert_eq!(exposer.dispatch(Method::Get, "/failing", None).await?.status, 500);
        assert_eq!(exposer.dispatch(Method::Put, "/failing", None).await?.status, 500);
        assert_eq!(exposer.dispatch(Method::Delete, "/failing", None).await?.status, 404);

        let empty = exposer.dispatch(Method::Patch, "/failing", None).await?;
        assert_eq!(empty.status, 200);
        assert!(empty.body.is_empty());

        assert_eq!(
            *reports.lock(),
            vec![
                (Method::Get, "boom".to_owned()),
                (Method::Put, "kaboom".to_owned())
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn duplicates_are_rejected() -> Result<()> {
        let result = Exposer::new().mount([echo(), echo()]);
        assert!(matches!(result, Err(ExposerError::DuplicateCapability(_))));

        let shadow = Capability::builder("shadow", "/echo/{other}")
            .get(|_| async { HandlerResult::Ok(None) })
            .build()?;
        let result = Exposer::new().mount([echo(), shadow]);
        assert!(matches!(result, Err(ExposerError::DuplicateRoute { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn same_path_different_methods_share_a_route() -> Result<()> {
        let reader = Capability::builder("reader", "/items")
            .get(|_| async { HandlerResult::Ok(Some(Response::new(json!(["a"])))) })
            .build()?;
        let writer = Capability::builder("writer", "/items")
            .post(|_| async { HandlerResult::Ok(Some(Response::empty(204))) })
            .build()?;
        let exposer = Exposer::new();
        exposer.mount([reader, writer])?;

        assert_eq!(exposer.dispatch(Method::Get, "/items", None).await?.status, 200);
        assert_eq!(exposer.dispatch(Method::Post, "/items", None).await?.status, 204);
        assert_eq!(exposer.routes().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn versioned_capabilities_live_under_their_version() -> Result<()> {
        let capability = Capability::builder("status", "/status")
            .version("v1")
            .get(|_| async { HandlerResult::Ok(Some(Response::new(json!({"ok": true})))) })
            .build()?;
        let exposer = Exposer::new();
        exposer.mount([capability])?;

        assert_eq!(exposer.dispatch(Method::Get, "/v1/status", None).await?.status, 200);
        assert_eq!(exposer.dispatch(Method::Get, "/status", None).await?.status, 404);
        Ok(())
    }

    #[tokio::test]
    async fn dispatch_needs_a_mounted_table() {
        let result = Exposer::new().dispatch(Method::Get, "/", None).await;
        assert!(matches!(result, Err(ExposerError::NotExposed)));
    }
}
