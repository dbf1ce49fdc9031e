//! Registry backend contract and an in-process implementation.
//!
//! Providers register their urls with one or more [`Registry`] backends;
//! consumers subscribe to the cluster of a service to learn its endpoints.
//! Both sides may subscribe to dynamic configuration of an interface.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::{keys, Params};
use crate::error::{Result, RpcError};
use crate::url::Url;

/// A configuration snapshot for one interface.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigEvent {
    pub version: i64,
    pub data: Params,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterEventKind {
    /// The complete endpoint set.
    Full,
    Add,
    Remove,
}

/// A change of a service's endpoint set.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterEvent {
    pub version: i64,
    pub kind: ClusterEventKind,
    pub endpoints: Vec<Url>,
}

pub type ConfigHandler = Arc<dyn Fn(ConfigEvent) + Send + Sync>;
pub type ClusterHandler = Arc<dyn Fn(ClusterEvent) + Send + Sync>;

/// A service discovery and configuration backend.
///
/// Every operation is asynchronous and `close` is idempotent.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn open(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn register(&self, url: &Url) -> Result<()>;

    async fn deregister(&self, url: &Url, retry_times: u32) -> Result<()>;

    async fn subscribe_config(&self, url: &Url, handler: ConfigHandler) -> Result<()>;

    async fn unsubscribe_config(&self, url: &Url, handler: &ConfigHandler) -> Result<()>;

    async fn subscribe_cluster(&self, url: &Url, handler: ClusterHandler) -> Result<()>;

    async fn unsubscribe_cluster(&self, url: &Url, handler: &ClusterHandler) -> Result<()>;
}

/// Cluster key of a service url: interface plus alias.
pub fn cluster_key(url: &Url) -> String {
    crate::protocol::service_key(url.path(), url.get_str(keys::ALIAS, ""))
}

fn same_handler<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Registry living inside the process.
///
/// Subscribers receive the current snapshot as soon as they subscribe.
pub struct MemoryRegistry {
    name: String,
    opened: AtomicBool,
    version: AtomicI64,
    services: DashMap<String, Vec<Url>>,
    configs: DashMap<String, ConfigEvent>,
    config_subs: DashMap<String, Vec<ConfigHandler>>,
    cluster_subs: DashMap<String, Vec<ClusterHandler>>,
    closes: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            opened: AtomicBool::new(false),
            version: AtomicI64::new(0),
            services: DashMap::new(),
            configs: DashMap::new(),
            config_subs: DashMap::new(),
            cluster_subs: DashMap::new(),
            closes: AtomicUsize::new(0),
        }
    }

    fn next_version(&self) -> i64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RpcError::Registry(format!("registry {} is not open", self.name)))
        }
    }

    /// Publish new configuration for `interface` to its subscribers.
    pub fn publish_config(&self, interface: &str, data: Params) -> i64 {
        let event = ConfigEvent {
            version: self.next_version(),
            data,
        };
        self.configs.insert(interface.to_string(), event.clone());
        let handlers = self
            .config_subs
            .get(interface)
            .map(|h| h.value().clone())
            .unwrap_or_default();
        for handler in handlers {
            handler(event.clone());
        }
        event.version
    }

    /// Urls currently registered under `url`'s cluster key.
    pub fn endpoints(&self, url: &Url) -> Vec<Url> {
        self.services
            .get(&cluster_key(url))
            .map(|v| v.value().clone())
            .unwrap_or_default()
    }

    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// How many times `close` took effect.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    fn notify_cluster(&self, key: &str, kind: ClusterEventKind, endpoints: Vec<Url>) {
        let event = ClusterEvent {
            version: self.next_version(),
            kind,
            endpoints,
        };
        let handlers = self
            .cluster_subs
            .get(key)
            .map(|h| h.value().clone())
            .unwrap_or_default();
        for handler in handlers {
            handler(event.clone());
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> Result<()> {
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.opened.swap(false, Ordering::AcqRel) {
            self.closes.fetch_add(1, Ordering::AcqRel);
            self.config_subs.clear();
            self.cluster_subs.clear();
            tracing::debug!("Registry {} closed", self.name);
        }
        Ok(())
    }

    async fn register(&self, url: &Url) -> Result<()> {
        self.ensure_open()?;
        let key = cluster_key(url);
        let address = url.address();
        {
            let mut endpoints = self.services.entry(key.clone()).or_default();
            endpoints.retain(|u| u.address() != address);
            endpoints.push(url.clone());
        }
        tracing::debug!("Registered {} in {}", url, self.name);
        self.notify_cluster(&key, ClusterEventKind::Add, vec![url.clone()]);
        Ok(())
    }

    async fn deregister(&self, url: &Url, _retry_times: u32) -> Result<()> {
        let key = cluster_key(url);
        let address = url.address();
        let removed = match self.services.get_mut(&key) {
            Some(mut endpoints) => {
                let before = endpoints.len();
                endpoints.retain(|u| u.address() != address);
                before != endpoints.len()
            }
            None => false,
        };
        if removed {
            tracing::debug!("Deregistered {} from {}", url, self.name);
            self.notify_cluster(&key, ClusterEventKind::Remove, vec![url.clone()]);
        }
        Ok(())
    }

    async fn subscribe_config(&self, url: &Url, handler: ConfigHandler) -> Result<()> {
        self.ensure_open()?;
        let interface = url.path().to_string();
        self.config_subs
            .entry(interface.clone())
            .or_default()
            .push(handler.clone());
        let snapshot = self
            .configs
            .get(&interface)
            .map(|e| e.value().clone())
            .unwrap_or(ConfigEvent {
                version: 0,
                data: Params::new(),
            });
        handler(snapshot);
        Ok(())
    }

    async fn unsubscribe_config(&self, url: &Url, handler: &ConfigHandler) -> Result<()> {
        if let Some(mut handlers) = self.config_subs.get_mut(url.path()) {
            handlers.retain(|h| !same_handler(h, handler));
        }
        Ok(())
    }

    async fn subscribe_cluster(&self, url: &Url, handler: ClusterHandler) -> Result<()> {
        self.ensure_open()?;
        let key = cluster_key(url);
        self.cluster_subs
            .entry(key)
            .or_default()
            .push(handler.clone());
        handler(ClusterEvent {
            version: self.version.load(Ordering::Acquire),
            kind: ClusterEventKind::Full,
            endpoints: self.endpoints(url),
        });
        Ok(())
    }

    async fn unsubscribe_cluster(&self, url: &Url, handler: &ClusterHandler) -> Result<()> {
        if let Some(mut handlers) = self.cluster_subs.get_mut(&cluster_key(url)) {
            handlers.retain(|h| !same_handler(h, handler));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn provider_url(port: u16) -> Url {
        Url::new("joy", Some("127.0.0.1"), port, "demo.Echo").with_param(keys::ALIAS, "a")
    }

    #[tokio::test]
    async fn test_cluster_subscription() {
        let registry = MemoryRegistry::default();
        registry.open().await.unwrap();
        registry.register(&provider_url(1)).await.unwrap();

        let seen: Arc<Mutex<Vec<ClusterEvent>>> = Arc::default();
        let sink = seen.clone();
        let handler: ClusterHandler = Arc::new(move |e| sink.lock().push(e));
        let consumer = Url::new("joy", None, 0, "demo.Echo").with_param(keys::ALIAS, "a");
        registry.subscribe_cluster(&consumer, handler.clone()).await.unwrap();

        registry.register(&provider_url(2)).await.unwrap();
        registry.deregister(&provider_url(1), 0).await.unwrap();
        registry.unsubscribe_cluster(&consumer, &handler).await.unwrap();
        registry.register(&provider_url(3)).await.unwrap();

        let events = seen.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, ClusterEventKind::Full);
        assert_eq!(events[0].endpoints.len(), 1);
        assert_eq!(events[1].kind, ClusterEventKind::Add);
        assert_eq!(events[2].kind, ClusterEventKind::Remove);
        assert!(events[1].version < events[2].version);
        assert_eq!(registry.endpoints(&consumer).len(), 2);
    }

    #[tokio::test]
    async fn test_config_snapshot_and_updates() {
        let registry = MemoryRegistry::default();
        registry.open().await.unwrap();
        let seen: Arc<Mutex<Vec<ConfigEvent>>> = Arc::default();
        let sink = seen.clone();
        let url = Url::new("joy", None, 0, "demo.Echo");
        registry
            .subscribe_config(&url, Arc::new(move |e| sink.lock().push(e)))
            .await
            .unwrap();

        let mut data = Params::new();
        data.insert(keys::TIMEOUT.into(), "100".into());
        let version = registry.publish_config("demo.Echo", data.clone());

        let events = seen.lock();
        assert_eq!(events[0].version, 0);
        assert!(events[0].data.is_empty());
        assert_eq!(events[1], ConfigEvent { version, data });
    }

    #[tokio::test]
    async fn test_closed_registry_rejects_and_close_is_idempotent() {
        let registry = MemoryRegistry::default();
        assert!(registry.register(&provider_url(1)).await.is_err());
        registry.open().await.unwrap();
        registry.close().await.unwrap();
        registry.close().await.unwrap();
        assert_eq!(registry.close_count(), 1);
    }
}
