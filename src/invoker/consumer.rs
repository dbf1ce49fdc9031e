//! Consumer side of a service: refer, invoke, unrefer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

use super::controller::{ConfigController, Lifecycle, Transition};
use super::Runtime;
use crate::channel::{ChannelEvent, PooledChannel};
use crate::codec::{MSGPACK_ID, NONE_ID};
use crate::config::{keys, Params};
use crate::discovery::{
    ClusterEvent, ClusterEventKind, ClusterHandler, ConfigEvent, ConfigHandler, Registry,
};
use crate::error::{Result, RpcError};
use crate::protocol::{Body, Header, Invocation, Message, MsgType};
use crate::status::Status;
use crate::transport::TcpConnector;
use crate::url::Url;

/// Picks one endpoint among the candidates.
pub trait LoadBalance: Send + Sync + 'static {
    fn select<'a>(&self, candidates: &'a [Url]) -> Option<&'a Url>;
}

/// Cycles through candidates in order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalance for RoundRobin {
    fn select<'a>(&self, candidates: &'a [Url]) -> Option<&'a Url> {
        if candidates.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        candidates.get(i % candidates.len())
    }
}

/// Settings of one referred service.
#[derive(Clone)]
pub struct ConsumerConfig {
    pub interface: String,
    pub alias: String,
    pub protocol: String,
    pub registry: Arc<dyn Registry>,
    /// Wait for and follow dynamic configuration.
    pub subscribe: bool,
    /// Falls back to the registry's request timeout.
    pub timeout: Option<Duration>,
    pub serialization: String,
    pub compression: Option<String>,
    pub load_balance: Arc<dyn LoadBalance>,
    pub params: Params,
}

impl ConsumerConfig {
    pub fn new(interface: &str, registry: Arc<dyn Registry>) -> Self {
        Self {
            interface: interface.to_string(),
            alias: String::new(),
            protocol: "joy".to_string(),
            registry,
            subscribe: false,
            timeout: None,
            serialization: "msgpack".to_string(),
            compression: None,
            load_balance: Arc::new(RoundRobin::default()),
            params: Params::new(),
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = alias.to_string();
        self
    }

    pub fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_serialization(mut self, name: &str) -> Self {
        self.serialization = name.to_string();
        self
    }

    pub fn with_compression(mut self, name: &str) -> Self {
        self.compression = Some(name.to_string());
        self
    }

    pub fn with_load_balance(mut self, load_balance: Arc<dyn LoadBalance>) -> Self {
        self.load_balance = load_balance;
        self
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    /// `{protocol}://{interface}?alias={alias}&role=consumer`
    pub fn name(&self) -> String {
        format!(
            "{}://{}?{}={}&{}=consumer",
            self.protocol,
            self.interface,
            keys::ALIAS,
            self.alias,
            keys::ROLE
        )
    }

    /// The consumer url carrying every explicit setting.
    pub fn url(&self) -> Url {
        let mut url = Url::new(&self.protocol, None, 0, &self.interface)
            .with_params(&self.params)
            .with_param(keys::ALIAS, &self.alias)
            .with_param(keys::ROLE, "consumer")
            .with_param(keys::SERIALIZATION, &self.serialization)
            .with_param(keys::SUBSCRIBE, self.subscribe);
        if let Some(timeout) = self.timeout {
            url = url.with_param(keys::TIMEOUT, timeout.as_millis());
        }
        if let Some(compression) = &self.compression {
            url = url.with_param(keys::COMPRESSION, compression);
        }
        url
    }
}

/// A referred service.
///
/// Created by [`InvokerRegistry::refer`](super::InvokerRegistry::refer).
pub struct Consumer {
    name: String,
    key: String,
    url: Url,
    config: ConsumerConfig,
    runtime: Runtime,
    lifecycle: Lifecycle,
    settings: Arc<ConfigController>,
    endpoints: RwLock<Vec<Url>>,
    channels: DashMap<String, Arc<PooledChannel>>,
    cluster_handler: ClusterHandler,
    config_handler: ConfigHandler,
    on_closed: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    this: Weak<Consumer>,
}

impl Consumer {
    pub(crate) fn new(config: ConsumerConfig, key: String, runtime: Runtime) -> Arc<Self> {
        let url = config.url();
        let name = config.name();
        let settings = Arc::new(ConfigController::new(
            &name,
            url.clone(),
            runtime.context.clone(),
            runtime.update_delay,
        ));

        Arc::new_cyclic(|weak: &Weak<Consumer>| {
            let cluster_weak = weak.clone();
            let cluster_handler: ClusterHandler = Arc::new(move |event: ClusterEvent| {
                if let Some(consumer) = cluster_weak.upgrade() {
                    consumer.on_cluster(event);
                }
            });
            let config_settings = settings.clone();
            let config_handler: ConfigHandler =
                Arc::new(move |event: ConfigEvent| config_settings.on_event(event));

            Self {
                name,
                key,
                url,
                config,
                runtime,
                lifecycle: Lifecycle::new("Consumer"),
                settings,
                endpoints: RwLock::new(Vec::new()),
                channels: DashMap::new(),
                cluster_handler,
                config_handler,
                on_closed: Mutex::new(None),
                this: weak.clone(),
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identity key in the registry's refer table.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> Status {
        self.lifecycle.status()
    }

    /// The url with every configuration layer applied.
    pub fn effective_url(&self) -> Url {
        self.settings.effective()
    }

    pub fn endpoints(&self) -> Vec<Url> {
        self.endpoints.read().clone()
    }

    pub(crate) fn registry(&self) -> Arc<dyn Registry> {
        self.config.registry.clone()
    }

    pub(crate) fn set_on_closed(&self, f: Box<dyn FnOnce() + Send>) {
        *self.on_closed.lock() = Some(f);
    }

    fn on_cluster(self: Arc<Self>, event: ClusterEvent) {
        let mut removed = Vec::new();
        {
            let mut endpoints = self.endpoints.write();
            match event.kind {
                ClusterEventKind::Full => {
                    removed = endpoints
                        .iter()
                        .filter(|old| !event.endpoints.iter().any(|u| u.address() == old.address()))
                        .map(Url::address)
                        .collect();
                    *endpoints = event.endpoints;
                }
                ClusterEventKind::Add => {
                    for url in event.endpoints {
                        endpoints.retain(|u| u.address() != url.address());
                        endpoints.push(url);
                    }
                }
                ClusterEventKind::Remove => {
                    for url in &event.endpoints {
                        endpoints.retain(|u| u.address() != url.address());
                        removed.push(url.address());
                    }
                }
            }
        }
        tracing::debug!(
            "{} endpoints of {} after {:?}",
            self.endpoints.read().len(),
            self.name,
            event.kind
        );

        for address in removed {
            if let Some((_, channel)) = self.channels.remove(&address) {
                tokio::spawn(async move {
                    if let Err(e) = channel.close().await {
                        tracing::debug!("Closing channel to {}: {}", address, e);
                    }
                });
            }
        }
    }

    /// Stop routing to `address` once its provider announces it is leaving.
    ///
    /// The channel itself stays until the cluster removes the endpoint or the
    /// provider closes the connection.
    fn watch_offline(&self, address: String, channel: &PooledChannel) {
        let Some(mut events) = channel.events() else {
            return;
        };
        let weak = self.this.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Offline { .. }) => {
                        if let Some(consumer) = weak.upgrade() {
                            consumer.endpoints.write().retain(|u| u.address() != address);
                            tracing::info!(
                                "Provider {} of {} went offline",
                                address,
                                consumer.name
                            );
                        }
                        return;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            }
        });
    }

    /// Open the consumer. Concurrent callers share one open.
    pub async fn refer(self: &Arc<Self>) -> Result<()> {
        match self.lifecycle.begin_open() {
            Transition::Join(promise) => promise.wait().await,
            Transition::Drive(promise) => {
                let outcome = self.do_open().await;
                let result = self.lifecycle.finish_open(&promise, outcome);
                if let Err(e) = &result {
                    tracing::warn!("Refer {} failed: {}", self.name, e);
                    self.release().await;
                }
                result
            }
        }
    }

    async fn do_open(&self) -> Result<()> {
        if self.config.interface.is_empty() {
            return Err(RpcError::init("Interface name is empty."));
        }
        let registry = &self.config.registry;
        registry.open().await.map_err(|e| {
            RpcError::init_caused(format!("Open registry {} error", registry.name()), e)
        })?;
        registry
            .subscribe_cluster(&self.url, self.cluster_handler.clone())
            .await
            .map_err(|e| RpcError::init_caused("Subscribe cluster error", e))?;

        if self.config.subscribe {
            registry
                .subscribe_config(&self.url, self.config_handler.clone())
                .await
                .map_err(|e| RpcError::init_caused("Subscribe config error", e))?;
            self.settings.wait_config().await?;
        } else {
            self.settings.refresh();
        }
        tracing::info!("Referred {}", self.name);
        Ok(())
    }

    /// Call `method` on one provider and decode its result.
    pub async fn invoke<R: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<R> {
        if self.lifecycle.status() != Status::Opened {
            return Err(self.lifecycle.state_error());
        }
        let url = self.settings.effective();
        let endpoint = {
            let endpoints = self.endpoints.read();
            self.config.load_balance.select(&endpoints).cloned()
        }
        .ok_or_else(|| RpcError::Connection(format!("No provider available for {}", self.name)))?;

        let channel = self.channel_to(&endpoint).await?;

        let timeout_ms = url.get_u64(keys::TIMEOUT, self.runtime.request_timeout.as_millis() as u64);
        let codec = &self.runtime.codec;
        let serialization = codec
            .serialization_id(url.get_str(keys::SERIALIZATION, "msgpack"))
            .unwrap_or(MSGPACK_ID);
        let compression = url
            .param(keys::COMPRESSION)
            .and_then(|name| codec.compression_id(name))
            .unwrap_or(NONE_ID);
        let header = Header::new(MsgType::BizReq, 0)
            .with_serialization(serialization)
            .with_compression(compression)
            .with_timeout(timeout_ms.min(u32::MAX as u64) as u32);
        let invocation =
            Invocation::new(&self.config.interface, &self.config.alias, method, args);

        let response = channel
            .request(
                Message::new(header, Body::Invocation(invocation)),
                Duration::from_millis(timeout_ms),
            )
            .await?;
        match response.body {
            Body::Response(payload) => match payload.exception {
                Some(exception) => Err(RpcError::Invocation(exception)),
                None => Ok(serde_json::from_value(payload.result.unwrap_or(Value::Null))?),
            },
            other => Err(RpcError::Invocation(format!(
                "unexpected {:?} body in response to {}",
                other.kind(),
                method
            ))),
        }
    }

    /// Pooled channel to `endpoint`, dialing on first use.
    async fn channel_to(&self, endpoint: &Url) -> Result<Arc<PooledChannel>> {
        let address = endpoint.address();
        if let Some(channel) = self.channels.get(&address) {
            if channel.status() == Status::Opened {
                return Ok(channel.clone());
            }
        }

        let connector = Arc::new(TcpConnector::new(
            address.clone(),
            self.runtime.codec.clone(),
            self.runtime.transport.clone(),
        ));
        let fresh = Arc::new(self.runtime.pool.get_channel(&address, connector).await?);

        // Keep one handle per address; extra handles go back to the pool.
        let (kept, surplus) = match self.channels.entry(address.clone()) {
            Entry::Occupied(mut e) => {
                if e.get().status() == Status::Opened {
                    (e.get().clone(), Some(fresh))
                } else {
                    let stale = e.insert(fresh.clone());
                    self.watch_offline(address, &fresh);
                    (fresh, Some(stale))
                }
            }
            Entry::Vacant(e) => {
                e.insert(fresh.clone());
                self.watch_offline(address, &fresh);
                (fresh, None)
            }
        };
        if let Some(surplus) = surplus {
            surplus.close().await?;
        }
        if self.lifecycle.status() != Status::Opened {
            self.release().await;
            return Err(self.lifecycle.state_error());
        }
        Ok(kept)
    }

    /// Close the consumer. Repeated calls share one close.
    ///
    /// With `gracefully` the call returns once in-flight requests drained and
    /// channels were given back; otherwise channels are given back in the
    /// background.
    pub async fn unrefer(self: &Arc<Self>, gracefully: bool) -> Result<()> {
        match self.lifecycle.begin_close() {
            Transition::Join(promise) => promise.wait().await,
            Transition::Drive(promise) => {
                self.settings.broken();
                if gracefully {
                    self.release().await;
                } else {
                    let consumer = self.clone();
                    tokio::spawn(async move { consumer.release().await });
                }
                tracing::info!("Unreferred {}", self.name);
                self.lifecycle.finish_close(&promise);
                let on_closed = self.on_closed.lock().take();
                if let Some(on_closed) = on_closed {
                    on_closed();
                }
                Ok(())
            }
        }
    }

    /// Unsubscribe and hand every channel back to the pool.
    async fn release(&self) {
        let registry = &self.config.registry;
        if let Err(e) = registry
            .unsubscribe_cluster(&self.url, &self.cluster_handler)
            .await
        {
            tracing::warn!("Unsubscribe cluster of {} failed: {}", self.name, e);
        }
        if self.config.subscribe {
            if let Err(e) = registry
                .unsubscribe_config(&self.url, &self.config_handler)
                .await
            {
                tracing::warn!("Unsubscribe config of {} failed: {}", self.name, e);
            }
        }

        let addresses: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            if let Some((_, channel)) = self.channels.remove(&address) {
                if let Err(e) = channel.close().await {
                    tracing::debug!("Closing channel to {}: {}", address, e);
                }
            }
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}
