//! Invocation layer: consumers, providers and the registry that owns them.
//!
//! - [`Consumer`] - a referred service; resolves endpoints and invokes methods
//! - [`Provider`] - an exported service served from a shared port
//! - [`InvokerRegistry`] - deduplicates both and shares listening ports
//! - [`ServiceDispatcher`] - method table of an exported service

use std::sync::Arc;
use std::time::Duration;

use crate::channel::ChannelPool;
use crate::config::GlobalContext;
use crate::protocol::FrameCodec;
use crate::transport::TransportConfig;

mod consumer;
mod controller;
mod dispatch;
mod provider;
mod registry;
mod server;

pub use consumer::{Consumer, ConsumerConfig, LoadBalance, RoundRobin};
pub use dispatch::{MethodHandler, ServiceDispatcher, TypedMethod};
pub use provider::{ExporterEvent, ExporterEventKind, Provider, ProviderConfig, Warmup};
pub use registry::{refer_key, InvokerRegistry, RegistryConfig};
pub use server::ShareServer;

/// Collaborators shared by every controller of one registry.
#[derive(Clone)]
pub(crate) struct Runtime {
    pub context: Arc<GlobalContext>,
    pub codec: Arc<FrameCodec>,
    pub pool: Arc<ChannelPool>,
    pub transport: TransportConfig,
    pub update_delay: Duration,
    pub request_timeout: Duration,
    pub offline_timeout: Duration,
}
