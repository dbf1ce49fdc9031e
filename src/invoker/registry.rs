//! Process-wide table of live consumers, providers and listening ports.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::consumer::{Consumer, ConsumerConfig};
use super::provider::{ExporterEvent, Provider, ProviderConfig, ServerTable};
use super::server::ShareServer;
use super::Runtime;
use crate::channel::{ChannelPool, PoolConfig};
use crate::config::{keys, GlobalContext, DEFAULT_OFFLINE_TIMEOUT, DEFAULT_TIMEOUT, DEFAULT_UPDATE_DELAY};
use crate::discovery::Registry;
use crate::error::{Result, RpcError};
use crate::event::EventPublisher;
use crate::protocol::{service_key, CodecConfig, FrameCodec};
use crate::transport::TransportConfig;
use crate::url::Url;

type ConsumerTable = DashMap<String, Arc<Consumer>>;
type ExportTable = DashMap<String, DashMap<u16, Arc<Provider>>>;

/// Tunables of an [`InvokerRegistry`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Longest wait for peers to acknowledge an offline notice.
    pub offline_timeout: Duration,
    /// Request timeout used when a consumer sets none.
    pub request_timeout: Duration,
    /// Debounce delay of configuration updates.
    pub update_delay: Duration,
    pub pool: PoolConfig,
    pub codec: CodecConfig,
    pub transport: TransportConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            offline_timeout: DEFAULT_OFFLINE_TIMEOUT,
            request_timeout: DEFAULT_TIMEOUT,
            update_delay: DEFAULT_UPDATE_DELAY,
            pool: PoolConfig::default(),
            codec: CodecConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn with_offline_timeout(mut self, timeout: Duration) -> Self {
        self.offline_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_update_delay(mut self, delay: Duration) -> Self {
        self.update_delay = delay;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }
}

struct Inner {
    config: RegistryConfig,
    runtime: Runtime,
    refers: Arc<ConsumerTable>,
    systems: Arc<ConsumerTable>,
    exports: Arc<ExportTable>,
    servers: Arc<ServerTable>,
    interface_ids: DashMap<i64, String>,
    events: Arc<EventPublisher<ExporterEvent>>,
    shutdown: AtomicBool,
}

/// Deduplicates consumers and providers and shares listening ports.
///
/// Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct InvokerRegistry {
    inner: Arc<Inner>,
}

impl Default for InvokerRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Refer table key: the url without host, plus its content hash.
pub fn refer_key(url: &Url) -> String {
    let url = url.clone().with_host(None).with_port(0);
    let hash = url.content_hash();
    url.with_param(keys::HASH_CODE, hash).to_string()
}

impl InvokerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let runtime = Runtime {
            context: Arc::new(GlobalContext::new()),
            codec: Arc::new(FrameCodec::new(config.codec.clone())),
            pool: Arc::new(ChannelPool::new(config.pool.clone())),
            transport: config.transport.clone(),
            update_delay: config.update_delay,
            request_timeout: config.request_timeout,
            offline_timeout: config.offline_timeout,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                refers: Arc::new(DashMap::new()),
                systems: Arc::new(DashMap::new()),
                exports: Arc::new(DashMap::new()),
                servers: Arc::new(DashMap::new()),
                interface_ids: DashMap::new(),
                events: Arc::new(EventPublisher::new()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Process-level configuration layers applied to every url.
    pub fn context(&self) -> &Arc<GlobalContext> {
        &self.inner.runtime.context
    }

    pub fn codec(&self) -> &Arc<FrameCodec> {
        &self.inner.runtime.codec
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.inner.runtime.pool
    }

    /// Exporter lifecycle events. `None` after close.
    pub fn exporter_events(&self) -> Option<tokio::sync::broadcast::Receiver<ExporterEvent>> {
        self.inner.events.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            Err(RpcError::Shutdown("invoker registry is closed".into()))
        } else {
            Ok(())
        }
    }

    /// Map a numeric interface id to its interface name.
    pub fn put_interface_id(&self, id: i64, interface: &str) {
        self.inner.interface_ids.insert(id, interface.to_string());
    }

    pub fn interface_name(&self, id: i64) -> Option<String> {
        self.inner.interface_ids.get(&id).map(|e| e.value().clone())
    }

    /// Live consumer with this refer key.
    pub fn consumer(&self, key: &str) -> Option<Arc<Consumer>> {
        self.inner.refers.get(key).map(|e| e.value().clone())
    }

    /// Live provider of `interface/alias` on `port`.
    pub fn provider(&self, service_key: &str, port: u16) -> Option<Arc<Provider>> {
        self.inner
            .exports
            .get(service_key)
            .and_then(|ports| ports.get(&port).map(|e| e.value().clone()))
    }

    pub fn refer_count(&self) -> usize {
        self.inner.refers.len()
    }

    pub fn export_count(&self) -> usize {
        self.inner.exports.iter().map(|e| e.value().len()).sum()
    }

    /// Listening ports currently shared by providers.
    pub fn server_ports(&self) -> Vec<u16> {
        self.inner.servers.iter().map(|e| *e.key()).collect()
    }

    /// Refer a service and wait until it is open.
    pub async fn refer(&self, config: ConsumerConfig) -> Result<Arc<Consumer>> {
        self.refer_into(&self.inner.refers, config).await
    }

    /// Refer an internal service. System consumers are closed last.
    pub async fn refer_system(&self, config: ConsumerConfig) -> Result<Arc<Consumer>> {
        let config = config.with_param(keys::SYSTEM, true);
        self.refer_into(&self.inner.systems, config).await
    }

    async fn refer_into(&self, table: &Arc<ConsumerTable>, config: ConsumerConfig) -> Result<Arc<Consumer>> {
        self.ensure_running()?;
        let key = refer_key(&config.url());

        let consumer = match table.entry(key.clone()) {
            Entry::Occupied(_) => {
                return Err(RpcError::DuplicateRegistration(format!(
                    "Duplicate consumer config with key {}",
                    key
                )));
            }
            Entry::Vacant(e) => {
                let consumer = Consumer::new(config, key.clone(), self.inner.runtime.clone());
                e.insert(consumer.clone());
                consumer
            }
        };

        let weak = Arc::downgrade(table);
        let removal = Arc::downgrade(&consumer);
        let removal_key = key.clone();
        consumer.set_on_closed(Box::new(move || {
            if let Some(table) = weak.upgrade() {
                table.remove_if(&removal_key, |_, c| std::ptr::eq(Arc::as_ptr(c), removal.as_ptr()));
            }
        }));

        match consumer.refer().await {
            Ok(()) => Ok(consumer),
            Err(e) => {
                table.remove_if(&key, |_, c| Arc::ptr_eq(c, &consumer));
                Err(e)
            }
        }
    }

    /// Export a service and wait until it is open and registered.
    pub async fn export(&self, config: ProviderConfig) -> Result<Arc<Provider>> {
        self.ensure_running()?;
        let key = service_key(&config.interface, &config.alias);
        let port = config.port;
        if let Some(id) = config.params.get(keys::INTERFACE_ID).and_then(|v| v.parse().ok()) {
            self.put_interface_id(id, &config.interface);
        }

        let provider = {
            let ports = self.inner.exports.entry(key.clone()).or_default();
            let provider = match ports.entry(port) {
                Entry::Occupied(_) => {
                    return Err(RpcError::DuplicateRegistration(format!(
                        "Duplicate provider config with key {} and port {}",
                        key, port
                    )));
                }
                Entry::Vacant(e) => {
                    let server = self.share_server(&config.host, port);
                    let provider = Provider::new(
                        config,
                        server,
                        Arc::downgrade(&self.inner.servers),
                        self.inner.runtime.clone(),
                        self.inner.events.clone(),
                    );
                    e.insert(provider.clone());
                    provider
                }
            };
            provider
        };

        let weak = Arc::downgrade(&self.inner.exports);
        let removal = Arc::downgrade(&provider);
        let removal_key = key.clone();
        provider.set_on_closed(Box::new(move || {
            if let Some(exports) = weak.upgrade() {
                remove_export(&exports, &removal_key, port, |p| {
                    std::ptr::eq(Arc::as_ptr(p), removal.as_ptr())
                });
            }
        }));

        match provider.export().await {
            Ok(()) => Ok(provider),
            Err(e) => {
                provider.deregister_all().await;
                remove_export(&self.inner.exports, &key, port, |p| Arc::ptr_eq(p, &provider));
                Err(e)
            }
        }
    }

    /// The shared server of `port`, retained for one more provider.
    fn share_server(&self, host: &str, port: u16) -> Arc<ShareServer> {
        let runtime = &self.inner.runtime;
        let server = self.inner.servers.entry(port).or_insert_with(|| {
            Arc::new(ShareServer::new(
                host,
                port,
                runtime.codec.clone(),
                runtime.transport.clone(),
            ))
        });
        server.retain();
        server.value().clone()
    }

    /// Tear everything down. Later calls return immediately.
    ///
    /// Stages run in order and each tolerates failures of single entries:
    /// offline notices, controllers, listening ports, registry backends.
    pub async fn close(&self, gracefully: bool) -> Result<()> {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!("Closing invoker registry, gracefully: {}", gracefully);
        let inner = &self.inner;

        let servers: Vec<Arc<ShareServer>> = inner.servers.iter().map(|e| e.value().clone()).collect();
        if gracefully {
            let offline_timeout = inner.config.offline_timeout;
            futures::future::join_all(servers.iter().map(|s| s.offline(offline_timeout))).await;
        }

        let providers: Vec<Arc<Provider>> = inner
            .exports
            .iter()
            .flat_map(|ports| ports.value().iter().map(|p| p.value().clone()).collect::<Vec<_>>())
            .collect();
        let consumers: Vec<Arc<Consumer>> = inner.refers.iter().map(|e| e.value().clone()).collect();
        let systems: Vec<Arc<Consumer>> = inner.systems.iter().map(|e| e.value().clone()).collect();

        let mut backends: Vec<Arc<dyn Registry>> = Vec::new();
        let mut collect = |registry: Arc<dyn Registry>| {
            if !backends.iter().any(|r| std::ptr::addr_eq(Arc::as_ptr(r), Arc::as_ptr(&registry))) {
                backends.push(registry);
            }
        };
        for provider in &providers {
            provider.registries().iter().cloned().for_each(&mut collect);
        }
        for consumer in consumers.iter().chain(systems.iter()) {
            collect(consumer.registry());
        }

        // Offline notices already went out above.
        let unexports = providers.iter().map(|p| p.unexport(false));
        let unrefers = consumers.iter().map(|c| c.unrefer(gracefully));
        let (exported, referred) = futures::future::join(
            futures::future::join_all(unexports),
            futures::future::join_all(unrefers),
        )
        .await;
        for e in exported.into_iter().chain(referred).filter_map(Result::err) {
            tracing::warn!("Error closing invoker: {}", e);
        }

        let servers: Vec<Arc<ShareServer>> = inner.servers.iter().map(|e| e.value().clone()).collect();
        inner.servers.clear();
        futures::future::join_all(servers.iter().map(|s| s.close())).await;

        for result in futures::future::join_all(systems.iter().map(|c| c.unrefer(gracefully))).await {
            if let Err(e) = result {
                tracing::warn!("Error closing system invoker: {}", e);
            }
        }

        for backend in backends {
            if let Err(e) = backend.close().await {
                tracing::warn!("Error closing registry {}: {}", backend.name(), e);
            }
        }

        inner.events.close();
        tracing::info!("Invoker registry closed");
        Ok(())
    }
}

fn remove_export(exports: &ExportTable, key: &str, port: u16, is_self: impl Fn(&Arc<Provider>) -> bool) {
    if let Some(ports) = exports.get(key) {
        ports.remove_if(&port, |_, p| is_self(p));
    }
    exports.remove_if(key, |_, ports| ports.is_empty());
}

impl std::fmt::Debug for InvokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerRegistry")
            .field("refers", &self.refer_count())
            .field("exports", &self.export_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
