//! Configuration keys, tunables and the layered configuration merge.
//!
//! Effective service parameters are built by [`GlobalContext::configure`],
//! which applies layers in a fixed order; later layers win on conflicts:
//!
//! 1. process-wide context (allow-listed keys only)
//! 2. settings applying to every interface
//! 3. the service url's own parameters, minus data-center/region
//! 4. per-interface settings
//! 5. each [`Configurator`]'s overrides (allow-listed keys only)
//! 6. the update just received from a subscription

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::url::Url;

/// Well-known url parameter keys.
pub mod keys {
    pub const ALIAS: &str = "alias";
    pub const TIMEOUT: &str = "timeout";
    pub const REGISTER: &str = "register";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const WARMUP: &str = "warmup";
    pub const DATA_CENTER: &str = "dataCenter";
    pub const REGION: &str = "region";
    pub const COUNTER: &str = "counter";
    pub const HASH_CODE: &str = "hashCode";
    pub const ROLE: &str = "role";
    pub const SERIALIZATION: &str = "serialization";
    pub const COMPRESSION: &str = "compression";
    pub const WEIGHT: &str = "weight";
    pub const INTERFACE_ID: &str = "interfaceId";
    pub const SYSTEM: &str = "system";
    pub const HEARTBEAT_MODE: &str = "heartbeatMode";
    pub const HEARTBEAT_INTERVAL: &str = "heartbeatInterval";
}

/// Context keys allowed to flow from the process-wide layer.
pub const GLOBAL_ALLOWED: &[&str] = &[
    keys::TIMEOUT,
    keys::SERIALIZATION,
    keys::COMPRESSION,
    keys::WARMUP,
];

/// Keys a [`Configurator`] is allowed to override.
pub const CONFIG_ALLOWED: &[&str] = &[
    keys::TIMEOUT,
    keys::SERIALIZATION,
    keys::COMPRESSION,
    keys::WEIGHT,
    keys::WARMUP,
];

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between a config event and applying it.
pub const DEFAULT_UPDATE_DELAY: Duration = Duration::from_millis(200);

/// Upper bound on the best-effort offline notification during shutdown.
pub const DEFAULT_OFFLINE_TIMEOUT: Duration = Duration::from_secs(2);

/// Parameter map used for configuration layers.
pub type Params = BTreeMap<String, String>;

/// Dynamic per-interface overrides, e.g. from a config center.
pub trait Configurator: Send + Sync + 'static {
    /// Overrides for the interface at `path`, if any.
    fn configure(&self, path: &str) -> Option<Params>;
}

/// Process-level configuration layers owned by an
/// [`InvokerRegistry`](crate::invoker::InvokerRegistry).
#[derive(Default)]
pub struct GlobalContext {
    context: RwLock<Params>,
    global_settings: RwLock<Params>,
    interfaces: RwLock<HashMap<String, Params>>,
    configurators: RwLock<Vec<Arc<dyn Configurator>>>,
}

impl GlobalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a process-wide parameter.
    pub fn put(&self, key: &str, value: impl ToString) {
        self.context.write().insert(key.to_string(), value.to_string());
    }

    /// Set a parameter applying to every interface.
    pub fn put_global_setting(&self, key: &str, value: impl ToString) {
        self.global_settings
            .write()
            .insert(key.to_string(), value.to_string());
    }

    /// Set a parameter for one interface.
    pub fn put_interface_setting(&self, interface: &str, key: &str, value: impl ToString) {
        self.interfaces
            .write()
            .entry(interface.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn add_configurator(&self, configurator: Arc<dyn Configurator>) {
        self.configurators.write().push(configurator);
    }

    /// Merge every layer over `url`, then `updates`.
    pub fn configure(&self, url: &Url, updates: Option<&Params>) -> Url {
        let mut result = Params::new();

        for (k, v) in self.context.read().iter() {
            if GLOBAL_ALLOWED.contains(&k.as_str()) {
                result.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in self.global_settings.read().iter() {
            result.insert(k.clone(), v.clone());
        }
        for (k, v) in url.params() {
            if k != keys::DATA_CENTER && k != keys::REGION {
                result.insert(k.clone(), v.clone());
            }
        }
        if let Some(settings) = self.interfaces.read().get(url.path()) {
            result.extend(settings.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for configurator in self.configurators.read().iter() {
            if let Some(overrides) = configurator.configure(url.path()) {
                for (k, v) in overrides {
                    if CONFIG_ALLOWED.contains(&k.as_str()) {
                        result.insert(k, v);
                    }
                }
            }
        }
        if let Some(updates) = updates {
            result.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        url.clone().with_all_params(result)
    }
}
