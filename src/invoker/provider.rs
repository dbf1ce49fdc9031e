//! Provider side of a service: export and unexport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use super::controller::{ConfigController, Lifecycle, Transition};
use super::dispatch::ServiceDispatcher;
use super::server::ShareServer;
use super::Runtime;
use crate::config::{keys, Params};
use crate::discovery::{ConfigEvent, ConfigHandler, Registry};
use crate::error::{Result, RpcError};
use crate::event::EventPublisher;
use crate::protocol::service_key;
use crate::status::Status;
use crate::transport::BoxFuture;
use crate::url::Url;

pub(crate) type ServerTable = DashMap<u16, Arc<ShareServer>>;

/// Runs before a provider starts serving.
#[async_trait]
pub trait Warmup: Send + Sync + 'static {
    async fn warmup(&self, url: &Url) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterEventKind {
    /// Created, not yet open.
    Initial,
    Open,
    Close,
}

/// Lifecycle notification of one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterEvent {
    pub kind: ExporterEventKind,
    pub name: String,
    pub port: u16,
}

/// Settings of one exported service.
#[derive(Clone)]
pub struct ProviderConfig {
    pub interface: String,
    pub alias: String,
    pub protocol: String,
    pub host: String,
    /// `0` binds an ephemeral port shared by every provider exported on `0`.
    pub port: u16,
    pub registries: Vec<Arc<dyn Registry>>,
    /// Publish the provider url to the registries.
    pub register: bool,
    /// Wait for and follow dynamic configuration.
    pub subscribe: bool,
    pub warmup: Option<Arc<dyn Warmup>>,
    pub dispatcher: Arc<ServiceDispatcher>,
    pub params: Params,
}

impl ProviderConfig {
    /// Export `dispatcher` under its own interface name.
    pub fn new(dispatcher: ServiceDispatcher) -> Self {
        Self {
            interface: dispatcher.interface().to_string(),
            alias: String::new(),
            protocol: "joy".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            registries: Vec::new(),
            register: true,
            subscribe: false,
            warmup: None,
            dispatcher: Arc::new(dispatcher),
            params: Params::new(),
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = alias.to_string();
        self
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registries.push(registry);
        self
    }

    pub fn with_register(mut self, register: bool) -> Self {
        self.register = register;
        self
    }

    pub fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    pub fn with_warmup(mut self, warmup: Arc<dyn Warmup>) -> Self {
        self.warmup = Some(warmup);
        self
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    /// `{protocol}://{host}:{port}/{interface}?alias={alias}&role=provider`
    pub fn name(&self) -> String {
        format!(
            "{}://{}:{}/{}?{}={}&{}=provider",
            self.protocol,
            self.host,
            self.port,
            self.interface,
            keys::ALIAS,
            self.alias,
            keys::ROLE
        )
    }

    pub fn url(&self) -> Url {
        Url::new(&self.protocol, Some(&self.host), self.port, &self.interface)
            .with_params(&self.params)
            .with_param(keys::ALIAS, &self.alias)
            .with_param(keys::ROLE, "provider")
            .with_param(keys::REGISTER, self.register)
            .with_param(keys::SUBSCRIBE, self.subscribe)
    }
}

/// An exported service.
///
/// Created by [`InvokerRegistry::export`](super::InvokerRegistry::export).
pub struct Provider {
    name: String,
    key: String,
    url: Url,
    config: ProviderConfig,
    runtime: Runtime,
    lifecycle: Lifecycle,
    settings: Arc<ConfigController>,
    server: Arc<ShareServer>,
    servers: Weak<ServerTable>,
    server_released: AtomicBool,
    events: Arc<EventPublisher<ExporterEvent>>,
    registered: Mutex<Vec<(Arc<dyn Registry>, Url)>>,
    config_handler: ConfigHandler,
    on_closed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Provider {
    pub(crate) fn new(
        config: ProviderConfig,
        server: Arc<ShareServer>,
        servers: Weak<ServerTable>,
        runtime: Runtime,
        events: Arc<EventPublisher<ExporterEvent>>,
    ) -> Arc<Self> {
        let url = config.url();
        let name = config.name();
        let settings = Arc::new(ConfigController::new(
            &name,
            url.clone(),
            runtime.context.clone(),
            runtime.update_delay,
        ));
        let config_settings = settings.clone();
        let config_handler: ConfigHandler =
            Arc::new(move |event: ConfigEvent| config_settings.on_event(event));

        let provider = Arc::new(Self {
            key: service_key(&config.interface, &config.alias),
            name,
            url,
            config,
            runtime,
            lifecycle: Lifecycle::new("Provider"),
            settings,
            server,
            servers,
            server_released: AtomicBool::new(false),
            events,
            registered: Mutex::new(Vec::new()),
            config_handler,
            on_closed: Mutex::new(None),
        });

        let weak = Arc::downgrade(&provider);
        provider.settings.on_apply(Box::new(move |url| -> BoxFuture<'static, Result<()>> {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(provider) => provider.reregister(url).await,
                    None => Ok(()),
                }
            })
        }));
        provider.publish(ExporterEventKind::Initial);
        provider
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `interface/alias`, the route key on the shared server.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Configured port; `0` until bound when exported on an ephemeral port.
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Actually bound address once open.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.local_addr()
    }

    pub fn status(&self) -> Status {
        self.lifecycle.status()
    }

    pub fn effective_url(&self) -> Url {
        self.settings.effective()
    }

    /// Urls currently registered, one per registry.
    pub fn registered(&self) -> Vec<Url> {
        self.registered.lock().iter().map(|(_, u)| u.clone()).collect()
    }

    pub(crate) fn registries(&self) -> &[Arc<dyn Registry>] {
        &self.config.registries
    }

    pub(crate) fn set_on_closed(&self, f: Box<dyn FnOnce() + Send>) {
        *self.on_closed.lock() = Some(f);
    }

    fn publish(&self, kind: ExporterEventKind) {
        self.events.publish(ExporterEvent {
            kind,
            name: self.name.clone(),
            port: self.config.port,
        });
    }

    /// Open the provider. Concurrent callers share one open.
    pub async fn export(self: &Arc<Self>) -> Result<()> {
        match self.lifecycle.begin_open() {
            Transition::Join(promise) => promise.wait().await,
            Transition::Drive(promise) => {
                let outcome = self.do_open().await;
                let result = self.lifecycle.finish_open(&promise, outcome);
                if let Err(e) = &result {
                    tracing::warn!("Export {} failed: {}", self.name, e);
                    self.settings.broken();
                    self.unsubscribe().await;
                    // A close racing the open may already have released the port.
                    self.server.remove_route(&self.key);
                    self.release_server(false).await;
                }
                result
            }
        }
    }

    async fn do_open(&self) -> Result<()> {
        if let Some(warmup) = &self.config.warmup {
            warmup
                .warmup(&self.url)
                .await
                .map_err(|e| RpcError::init_caused("Error occurs while warmup", e))?;
            self.lifecycle.ensure_opening()?;
        }

        self.server
            .open()
            .await
            .map_err(|e| RpcError::init_caused("Error occurs while open server", e))?;
        self.lifecycle.ensure_opening()?;

        let url = if self.config.subscribe {
            let registry = self
                .config
                .registries
                .first()
                .ok_or_else(|| RpcError::init("No registry to subscribe config from."))?;
            registry.open().await.map_err(|e| {
                RpcError::init_caused(format!("Open registry {} error", registry.name()), e)
            })?;
            registry
                .subscribe_config(&self.url, self.config_handler.clone())
                .await
                .map_err(|e| RpcError::init_caused("Subscribe config error", e))?;
            self.settings.wait_config().await?
        } else {
            self.settings.refresh()
        };

        self.lifecycle.ensure_opening()?;
        self.server.add_route(&self.key, self.config.dispatcher.clone());

        if self.config.register {
            let url = self.bound(url);
            let attempts = self.config.registries.iter().map(|registry| {
                let url = url.clone();
                async move {
                    let outcome = match registry.open().await {
                        Ok(()) => registry.register(&url).await,
                        Err(e) => Err(e),
                    };
                    (registry.clone(), url, outcome)
                }
            });
            let mut failure = None;
            for (registry, url, outcome) in futures::future::join_all(attempts).await {
                match outcome {
                    Ok(()) => self.registered.lock().push((registry, url)),
                    Err(e) if failure.is_none() => {
                        failure = Some(RpcError::init_caused(
                            format!("Open registry {} error", registry.name()),
                            e,
                        ));
                    }
                    Err(e) => tracing::warn!("Register {} failed: {}", self.name, e),
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }
            self.lifecycle.ensure_opening()?;
        }

        self.publish(ExporterEventKind::Open);
        tracing::info!("Exported {} on {:?}", self.name, self.server.local_addr());
        Ok(())
    }

    /// `url` with the port the server is actually bound to.
    fn bound(&self, url: Url) -> Url {
        match self.server.local_addr() {
            Some(addr) => url.with_port(addr.port()),
            None => url,
        }
    }

    /// Replace registered urls with one carrying updated configuration.
    async fn reregister(&self, url: Url) -> Result<()> {
        if !self.config.register || self.lifecycle.status() != Status::Opened {
            return Ok(());
        }
        let url = self.bound(url);
        let current = std::mem::take(&mut *self.registered.lock());
        let mut updated = Vec::with_capacity(current.len());
        let mut result = Ok(());
        for (registry, old) in current {
            if old == url {
                updated.push((registry, old));
                continue;
            }
            if let Err(e) = registry.deregister(&old, 1).await {
                tracing::warn!("Deregister {} from {} failed: {}", old, registry.name(), e);
            }
            match registry.register(&url).await {
                Ok(()) => updated.push((registry, url.clone())),
                Err(e) => result = Err(e),
            }
        }
        self.registered.lock().extend(updated);
        result
    }

    /// Close the provider. Repeated calls share one close.
    ///
    /// With `gracefully`, the last provider on a port sends offline notices
    /// to connected consumers before the port closes.
    pub async fn unexport(self: &Arc<Self>, gracefully: bool) -> Result<()> {
        match self.lifecycle.begin_close() {
            Transition::Join(promise) => promise.wait().await,
            Transition::Drive(promise) => {
                self.publish(ExporterEventKind::Close);
                self.settings.broken();
                self.unsubscribe().await;
                self.deregister_all().await;
                self.release_server(gracefully).await;
                tracing::info!("Unexported {}", self.name);
                self.lifecycle.finish_close(&promise);
                let on_closed = self.on_closed.lock().take();
                if let Some(on_closed) = on_closed {
                    on_closed();
                }
                Ok(())
            }
        }
    }

    async fn unsubscribe(&self) {
        if !self.config.subscribe {
            return;
        }
        if let Some(registry) = self.config.registries.first() {
            if let Err(e) = registry
                .unsubscribe_config(&self.url, &self.config_handler)
                .await
            {
                tracing::warn!("Unsubscribe config of {} failed: {}", self.name, e);
            }
        }
    }

    /// Best-effort removal of every registration.
    pub(crate) async fn deregister_all(&self) {
        let registered = std::mem::take(&mut *self.registered.lock());
        for (registry, url) in registered {
            if let Err(e) = registry.deregister(&url, 1).await {
                tracing::warn!("Deregister {} from {} failed: {}", url, registry.name(), e);
            }
        }
    }

    /// Drop the route and this provider's claim on the port.
    async fn release_server(&self, gracefully: bool) {
        if self.server_released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.server.remove_route(&self.key);
        let port = self.server.port();
        let last = match self.servers.upgrade() {
            Some(table) => table
                .remove_if(&port, |_, s| Arc::ptr_eq(s, &self.server) && s.release())
                .is_some(),
            None => self.server.release(),
        };
        if last {
            if gracefully {
                self.server.offline(self.runtime.offline_timeout).await;
            }
            self.server.close().await;
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}
