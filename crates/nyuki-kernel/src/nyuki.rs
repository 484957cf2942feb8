use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use nyuki_api::{ApiConfig, Capability, Exception, Exposer};
use nyuki_bus::{Bus, BusResponse, Transport};
use nyuki_events::EventManager;
use nyuki_protocol::{BusResult, Event, EventKind, Message, MessageBody, Method, ResponseBody};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConfigError, ConfigStore};
use crate::config_api::config_capabilities;
use crate::hooks::{NoHooks, NyukiHooks};
use crate::logging::LogHandle;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NyukiState {
    Created,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
enum Control {
    Stop { reason: String, timeout: Duration },
    Reload,
}

struct Shared {
    name: String,
    config: ConfigStore,
    events: EventManager,
    bus: RwLock<Bus>,
    exposer: Exposer,
    /// Address settings the API currently serves with.
    api: Mutex<ApiConfig>,
    transport: Arc<dyn Transport>,
    logging: Option<LogHandle>,
    state: Mutex<NyukiState>,
    control: mpsc::UnboundedSender<Control>,
    stop_timeout: Duration,
}

#[derive(Clone)]
pub struct NyukiBuilder {
    config: ConfigStore,
    transport: Arc<dyn Transport>,
    capabilities: Vec<Capability>,
    hooks: Arc<dyn NyukiHooks>,
    logging: Option<LogHandle>,
    stop_timeout: Duration,
}

impl NyukiBuilder {
    pub fn new(config: ConfigStore, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            capabilities: Vec::new(),
            hooks: Arc::new(NoHooks),
            logging: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities.extend(capabilities);
        self
    }

    pub fn hooks(mut self, hooks: impl NyukiHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Lets `reload` swap the log filter.
    pub fn logging(mut self, logging: LogHandle) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Bound for the bus disconnect and the API drain when stopping.
    pub fn stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn build(self) -> Result<Nyuki> {
        let events = EventManager::new();
        let bus_config = self
            .config
            .bus_config()
            .context("invalid bus configuration")?;
        let bus = Bus::new(&bus_config, Arc::clone(&self.transport), events.clone())
            .context("could not create the bus")?;
        let (control, receiver) = mpsc::unbounded_channel();

        let shared = Shared {
            name: bus.nick().to_owned(),
            config: self.config,
            events,
            bus: RwLock::new(bus),
            exposer: Exposer::new(),
            api: Mutex::new(ApiConfig::default()),
            transport: self.transport,
            logging: self.logging,
            state: Mutex::new(NyukiState::Created),
            control,
            stop_timeout: self.stop_timeout,
        };

        Ok(Nyuki {
            handle: NyukiHandle {
                inner: Arc::new(shared),
            },
            capabilities: self.capabilities,
            hooks: self.hooks,
            control: receiver,
        })
    }
}

/// An agent: one bus session, one HTTP API, one event loop.
pub struct Nyuki {
    handle: NyukiHandle,
    capabilities: Vec<Capability>,
    hooks: Arc<dyn NyukiHooks>,
    control: mpsc::UnboundedReceiver<Control>,
}

impl Nyuki {
    pub fn builder(config: ConfigStore, transport: Arc<dyn Transport>) -> NyukiBuilder {
        NyukiBuilder::new(config, transport)
    }

    pub fn handle(&self) -> NyukiHandle {
        self.handle.clone()
    }

    pub fn add_capability(&mut self, capability: Capability) {
        self.capabilities.push(capability);
    }

    /// Runs the agent on a fresh single-threaded runtime until it stops.
    pub fn start(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("could not build the event loop")?;
        runtime.block_on(self.run())
    }

    /// Starts the agent on the current runtime and returns once it stopped.
    #[instrument(skip(self), fields(nyuki = %self.handle.name()))]
    pub async fn run(self) -> Result<()> {
        let Nyuki {
            handle,
            mut capabilities,
            hooks,
            mut control,
        } = self;
        let api = handle
            .inner
            .config
            .api_config()
            .context("invalid api configuration")?;
        capabilities.extend(config_capabilities(&handle).context("invalid /config capability")?);

        handle.set_state(NyukiState::Running);
        let signals = tokio::spawn(forward_signals(handle.clone()));
        handle.bridge_requests();
        handle.bus().connect();

        if let Err(error) = handle.inner.exposer.expose(capabilities, &api).await {
            signals.abort();
            handle.bus().disconnect(handle.inner.stop_timeout).await;
            handle.set_state(NyukiState::Stopped);
            return Err(error).context("could not expose capabilities");
        }
        *handle.inner.api.lock() = api;
        handle.report_exceptions();
        info!(api = ?handle.inner.exposer.local_addr(), "nyuki started");

        if let Err(error) = hooks.on_start(&handle).await {
            error!(%error, "on_start hook failed");
        }

        let mut stop_timeout = handle.inner.stop_timeout;
        while let Some(command) = control.recv().await {
            match command {
                Control::Reload => {
                    if let Err(error) = handle.reload().await {
                        error!(error = ?error, "reload failed");
                    }
                }
                Control::Stop { reason, timeout } => {
                    info!(%reason, ?timeout, "stopping");
                    stop_timeout = timeout;
                    break;
                }
            }
        }

        signals.abort();
        handle.shutdown(hooks.as_ref(), stop_timeout).await;
        Ok(())
    }
}

/// Cheap, cloneable access to a nyuki from capabilities, hooks and tests.
#[derive(Clone)]
pub struct NyukiHandle {
    inner: Arc<Shared>,
}

/// Non-owning handle, for closures stored inside the nyuki itself.
#[derive(Clone)]
pub(crate) struct WeakHandle(Weak<Shared>);

impl WeakHandle {
    pub(crate) fn upgrade(&self) -> Option<NyukiHandle> {
        self.0.upgrade().map(|inner| NyukiHandle { inner })
    }
}

impl NyukiHandle {
    pub(crate) fn downgrade(&self) -> WeakHandle {
        WeakHandle(Arc::downgrade(&self.inner))
    }

    /// Local part of the bus JID.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> NyukiState {
        *self.inner.state.lock()
    }

    pub fn config(&self) -> Value {
        self.inner.config.get()
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.inner.config
    }

    /// Validates and applies `patch` without reloading.
    pub fn update_config(&self, patch: &Value) -> Result<Value, ConfigError> {
        self.inner.config.patch(patch)
    }

    pub fn register_schema(&self, schema: &Value) -> Result<(), ConfigError> {
        self.inner.config.register_schema(schema)
    }

    pub fn events(&self) -> &EventManager {
        &self.inner.events
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.events.register(kind, handler);
    }

    /// The current bus. Replaced on reload; do not keep it around.
    pub fn bus(&self) -> Bus {
        self.inner.bus.read().clone()
    }

    pub fn exposer(&self) -> &Exposer {
        &self.inner.exposer
    }

    pub async fn publish(&self, payload: Value) -> BusResult<()> {
        self.bus().publish(payload).await
    }

    pub async fn request(
        &self,
        recipient: &str,
        endpoint: &str,
        method: Method,
        data: Option<Value>,
    ) -> BusResult<BusResponse> {
        self.bus().request(recipient, endpoint, method, data).await
    }

    /// Asks the event loop to stop within the configured stop timeout.
    pub fn stop(&self) {
        self.stop_within(self.inner.stop_timeout);
    }

    /// Asks the event loop to stop; the API drain and the bus disconnect
    /// are each bounded by `timeout`.
    pub fn stop_within(&self, timeout: Duration) {
        self.send_control(Control::Stop {
            reason: "stop requested".to_owned(),
            timeout,
        });
    }

    pub fn abort(&self, signal: &str) {
        warn!(signal, "caught signal");
        self.send_control(Control::Stop {
            reason: format!("caught {signal}"),
            timeout: self.inner.stop_timeout,
        });
    }

    /// Asks the event loop to reload once the current work yields.
    pub fn request_reload(&self) {
        self.send_control(Control::Reload);
    }

    /// Replaces the bus, re-applies logging and restarts the API with the
    /// current settings, then persists the configuration.
    ///
    /// An API that cannot be served on its new address goes back to the
    /// previous one, in the configuration as well.
    #[instrument(skip(self), fields(nyuki = %self.name()))]
    pub async fn reload(&self) -> Result<()> {
        let store = &self.inner.config;
        let bus_config = store.bus_config().context("invalid bus configuration")?;
        let api = store.api_config().context("invalid api configuration")?;
        let log = store.log_config().context("invalid log configuration")?;

        let bus = Bus::new(
            &bus_config,
            Arc::clone(&self.inner.transport),
            self.inner.events.clone(),
        )
        .context("could not create the bus")?;

        let previous = self.bus();
        previous.disconnect(self.inner.stop_timeout).await;
        for topic in previous.runtime_topics() {
            bus.subscribe(&topic).await?;
        }
        *self.inner.bus.write() = bus.clone();
        bus.connect();

        if let Some(logging) = &self.inner.logging {
            if let Err(error) = logging.apply(&log) {
                warn!(%error, "log configuration not applied");
            }
        }

        let restarted = self.restart_api(api).await;
        if let Err(error) = store.save() {
            warn!(%error, "configuration not persisted");
        }
        let address = restarted?;
        info!(%address, "nyuki reloaded");
        Ok(())
    }

    async fn restart_api(&self, api: ApiConfig) -> Result<SocketAddr> {
        let error = match self.inner.exposer.restart(&api).await {
            Ok(address) => {
                *self.inner.api.lock() = api;
                return Ok(address);
            }
            Err(error) => error,
        };

        let previous = self.inner.api.lock().clone();
        warn!(%error, requested = %api.address(), restored = %previous.address(), "api restart failed");
        self.inner
            .config
            .patch(&json!({ "api": serde_json::to_value(&previous)? }))
            .context("could not restore the api configuration")?;
        self.inner
            .exposer
            .serve(&previous)
            .await
            .context("could not serve the api on its previous address")?;
        Err(error).context(format!("could not serve the api on {}", api.address()))
    }

    fn send_control(&self, command: Control) {
        if self.inner.control.send(command).is_err() {
            debug!("event loop already gone");
        }
    }

    fn set_state(&self, state: NyukiState) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), state);
        debug!(?previous, current = ?state, "nyuki state changed");
    }

    async fn shutdown(&self, hooks: &dyn NyukiHooks, timeout: Duration) {
        self.set_state(NyukiState::Stopping);
        if let Err(error) = hooks.on_stop(self).await {
            error!(%error, "on_stop hook failed");
        }

        self.inner.exposer.clear_exception_hook();
        self.inner.exposer.shutdown_within(timeout).await;
        self.bus().disconnect(timeout).await;

        self.set_state(NyukiState::Stopped);
        info!("nyuki stopped");
    }

    /// Answers bus requests through the API routes.
    fn bridge_requests(&self) {
        let weak = self.downgrade();
        self.inner
            .events
            .register(EventKind::RequestReceived, move |event| {
                let Some(nyuki) = weak.upgrade() else {
                    return Ok(());
                };
                let payload = event
                    .payload()
                    .cloned()
                    .context("request event without payload")?;
                let message: Message =
                    serde_json::from_value(payload).context("malformed request event")?;
                tokio::spawn(async move { nyuki.answer(message).await });
                Ok(())
            });
    }

    async fn answer(&self, message: Message) {
        let MessageBody::Request(request) = &message.body else {
            return;
        };
        let reply = match self
            .inner
            .exposer
            .dispatch(request.method, &request.endpoint, request.json.as_ref())
            .await
        {
            Ok(reply) => reply,
            Err(error) => {
                warn!(id = %message.id, %error, "bus request not dispatched");
                ResponseBody {
                    status: 500,
                    body: json!({ "error": error.to_string() }).to_string(),
                }
            }
        };

        debug!(id = %message.id, from = %message.from, status = reply.status, "answering bus request");
        if let Err(error) = self.bus().reply(&message, reply.status, reply.body).await {
            warn!(id = %message.id, %error, "bus reply failed");
        }
    }

    /// Publishes capability exceptions on our topic.
    fn report_exceptions(&self) {
        let weak = self.downgrade();
        self.inner.exposer.set_exception_hook(move |exception| {
            let Some(nyuki) = weak.upgrade() else {
                return;
            };
            let report = exception_report(nyuki.name(), exception);
            tokio::spawn(async move {
                if let Err(error) = nyuki.publish(report).await {
                    debug!(%error, "exception report not published");
                }
            });
        });
    }
}

pub fn exception_report(author: &str, exception: &Exception) -> Value {
    json!({
        "type": "exception",
        "author": author,
        "date": Utc::now().to_rfc3339(),
        "data": {
            "code": exception.capability,
            "message": exception.message,
        },
    })
}

async fn forward_signals(nyuki: NyukiHandle) {
    let signal = shutdown_signal().await;
    nyuki.abort(signal);
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "SIGINT",
            Err(error) => {
                error!(%error, "failed to install Ctrl+C handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                "SIGTERM"
            }
            Err(error) => {
                error!(%error, "failed to install SIGTERM handler");
                std::future::pending().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&'static str>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}
