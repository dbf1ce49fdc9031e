//! Connect-once, share-many channel pool.
//!
//! Every endpoint key maps to one [`SharedChannel`]. The first caller dials;
//! callers arriving while the dial is in flight queue up and are answered in
//! FIFO order when it completes. Each successful acquire adds one owner and
//! every [`PooledChannel`] handle gives its ownership back exactly once. The
//! physical connection closes when the last owner leaves, after in-flight
//! requests drain.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};

use super::heartbeat::{self, HeartbeatStrategy};
use crate::error::{Result, RpcError};
use crate::event::EventPublisher;
use crate::protocol::{Body, Message, MsgType};
use crate::status::{AtomicStatus, Status};
use crate::transport::{BoxFuture, Channel, Connector, MessageHandler};

/// Default interval between drain checks of a closing channel.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(400);

/// Pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How often a closing channel re-checks for in-flight requests.
    pub drain_interval: Duration,
    /// Heartbeat applied to every channel opened by the pool.
    pub heartbeat: Option<HeartbeatStrategy>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            heartbeat: Some(HeartbeatStrategy::default()),
        }
    }
}

impl PoolConfig {
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Option<HeartbeatStrategy>) -> Self {
        self.heartbeat = heartbeat;
        self
    }
}

/// Lifecycle events of one pooled channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected { address: String },
    ConnectFailed { address: String, error: String },
    Inactive { address: String },
    HeartbeatFailed { address: String, failures: u32 },
    Reconnected { address: String },
    /// The peer announced it is going offline.
    Offline { address: String },
    Closed { address: String },
}

type ChannelMap = DashMap<String, Arc<SharedChannel>>;

/// Owner count and connect waiters, guarded together.
struct Owners {
    refs: usize,
    waiters: VecDeque<oneshot::Sender<Result<()>>>,
}

/// One physical connection shared by every holder of its key.
pub struct SharedChannel {
    pub(super) key: String,
    pub(super) status: AtomicStatus,
    owners: Mutex<Owners>,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    connector: Arc<dyn Connector>,
    pub(super) heartbeat: Option<HeartbeatStrategy>,
    pub(super) heartbeat_fails: AtomicU32,
    /// Bumped on reconnect and close so stale heartbeat timers stop.
    pub(super) epoch: AtomicU64,
    pub(super) events: EventPublisher<ChannelEvent>,
    /// Set once removed from the pool; never dialed again.
    retired: AtomicBool,
    drain_interval: Duration,
    pool: Weak<ChannelMap>,
}

impl SharedChannel {
    fn new(
        key: &str,
        connector: Arc<dyn Connector>,
        config: &PoolConfig,
        pool: Weak<ChannelMap>,
    ) -> Self {
        Self {
            key: key.to_string(),
            status: AtomicStatus::new(Status::Closed),
            owners: Mutex::new(Owners {
                refs: 0,
                waiters: VecDeque::new(),
            }),
            channel: RwLock::new(None),
            connector,
            heartbeat: config.heartbeat.clone(),
            heartbeat_fails: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            events: EventPublisher::new(),
            retired: AtomicBool::new(false),
            drain_interval: config.drain_interval,
            pool,
        }
    }

    /// The live transport channel, if connected.
    pub(super) fn current(&self) -> Option<Arc<dyn Channel>> {
        self.channel.read().clone()
    }

    fn closed_error(&self, status: Status) -> RpcError {
        RpcError::ChannelClosed(format!("channel {} is {}", self.key, status))
    }

    /// Become an owner, dialing first if nobody has.
    async fn acquire(self: &Arc<Self>) -> Result<()> {
        loop {
            if self.retired.load(Ordering::Acquire) {
                return Err(self.closed_error(Status::Closed));
            }

            if self.status.transition(Status::Closed, Status::Opening) {
                let (tx, rx) = oneshot::channel();
                self.owners.lock().waiters.push_back(tx);
                // Dial on its own task so a cancelled caller cannot strand the queue.
                tokio::spawn(self.clone().open());
                return Self::await_waiter(rx).await;
            }

            let rx = {
                let mut owners = self.owners.lock();
                match self.status.get() {
                    Status::Opened => {
                        owners.refs += 1;
                        return Ok(());
                    }
                    Status::Opening => {
                        let (tx, rx) = oneshot::channel();
                        owners.waiters.push_back(tx);
                        rx
                    }
                    // Lost a race with a failed dial; try to dial again.
                    Status::Closed => continue,
                    status @ Status::Closing => return Err(self.closed_error(status)),
                }
            };
            return Self::await_waiter(rx).await;
        }
    }

    async fn await_waiter(rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        rx.await
            .unwrap_or_else(|_| Err(RpcError::ChannelClosed("connect abandoned".into())))
    }

    /// Settle the current dial and answer every queued waiter in order.
    ///
    /// Each delivered success adds one owner.
    fn settle(&self, outcome: Result<()>) -> usize {
        let mut owners = self.owners.lock();
        self.status.set(if outcome.is_ok() {
            Status::Opened
        } else {
            Status::Closed
        });
        while let Some(tx) = owners.waiters.pop_front() {
            if tx.send(outcome.clone()).is_ok() && outcome.is_ok() {
                owners.refs += 1;
            }
        }
        owners.refs
    }

    fn inbound_handler(self: &Arc<Self>) -> Arc<dyn MessageHandler> {
        Arc::new(PoolInbound {
            shared: Arc::downgrade(self),
        })
    }

    async fn open(self: Arc<Self>) {
        match self.connector.connect(self.inbound_handler()).await {
            Ok(channel) => {
                *self.channel.write() = Some(channel);
                let refs = self.settle(Ok(()));
                tracing::info!("Connected to {} ({} owners)", self.key, refs);
                self.events.publish(ChannelEvent::Connected {
                    address: self.key.clone(),
                });
                heartbeat::start(&self);
                if refs == 0 {
                    // Every waiter went away before the dial finished.
                    self.release_last().await;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to connect to {}: {}", self.key, e);
                self.settle(Err(e.clone()));
                self.events.publish(ChannelEvent::ConnectFailed {
                    address: self.key.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Replace the transport channel after repeated heartbeat failures.
    pub(super) async fn reconnect(self: &Arc<Self>) {
        if !self.status.transition(Status::Opened, Status::Opening) {
            return;
        }
        self.epoch.fetch_add(1, Ordering::AcqRel);
        tracing::info!("Reconnecting to {}", self.key);

        let old = self.channel.write().take();
        if let Some(old) = old {
            if let Err(e) = old.close().await {
                tracing::debug!("Closing stale channel to {}: {}", self.key, e);
            }
        }

        match self.connector.connect(self.inbound_handler()).await {
            Ok(channel) => {
                *self.channel.write() = Some(channel);
                self.settle(Ok(()));
                self.events.publish(ChannelEvent::Reconnected {
                    address: self.key.clone(),
                });
                if self.retired.load(Ordering::Acquire) {
                    self.do_close().await;
                } else {
                    heartbeat::start(self);
                }
            }
            Err(e) => {
                tracing::warn!("Reconnect to {} failed: {}", self.key, e);
                self.settle(Err(e.clone()));
                self.events.publish(ChannelEvent::ConnectFailed {
                    address: self.key.clone(),
                    error: e.to_string(),
                });
                if self.retired.load(Ordering::Acquire) {
                    self.do_close().await;
                }
            }
        }
    }

    /// Give back one ownership; the last one tears the connection down.
    async fn release(self: &Arc<Self>) {
        let last = {
            let mut owners = self.owners.lock();
            owners.refs = owners.refs.saturating_sub(1);
            owners.refs == 0
        };
        if last {
            self.release_last().await;
        }
    }

    async fn release_last(self: &Arc<Self>) {
        {
            let owners = self.owners.lock();
            // A new owner arrived between the decrement and here.
            if owners.refs > 0 || self.retired.swap(true, Ordering::AcqRel) {
                return;
            }
            if let Some(pool) = self.pool.upgrade() {
                pool.remove_if(&self.key, |_, v| std::ptr::eq(v.as_ref(), self.as_ref()));
            }
            if !self.status.transition(Status::Opened, Status::Closing) {
                // A reconnect in flight closes the channel once it settles.
                if self.status.get() == Status::Opening {
                    return;
                }
            }
        }

        self.drain().await;
        self.do_close().await;
    }

    /// Wait until no request is in flight or the transport is gone.
    async fn drain(&self) {
        loop {
            let busy = match self.current() {
                Some(channel) if channel.is_active() => channel.futures().len(),
                _ => 0,
            };
            if busy == 0 {
                return;
            }
            tracing::debug!(
                "Waiting for {} in-flight requests on {} before closing",
                busy,
                self.key
            );
            tokio::time::sleep(self.drain_interval).await;
        }
    }

    async fn do_close(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                tracing::warn!("Error closing channel to {}: {}", self.key, e);
            }
        }
        self.status.set(Status::Closed);
        tracing::info!("Closed channel to {}", self.key);
        self.events.publish(ChannelEvent::Closed {
            address: self.key.clone(),
        });
        self.events.close();
    }

    fn ref_count(&self) -> usize {
        self.owners.lock().refs
    }
}

/// Answers requests a provider sends over a pooled client channel.
struct PoolInbound {
    shared: Weak<SharedChannel>,
}

impl MessageHandler for PoolInbound {
    fn handle(&self, channel: Arc<dyn Channel>, message: Message) -> BoxFuture<'static, ()> {
        let shared = self.shared.clone();
        Box::pin(async move {
            let reply = match message.msg_type() {
                MsgType::HbReq => message.reply(Body::Empty),
                MsgType::OfflineReq => {
                    if let Some(shared) = shared.upgrade() {
                        tracing::info!("Provider {} is going offline", shared.key);
                        shared.events.publish(ChannelEvent::Offline {
                            address: shared.key.clone(),
                        });
                    }
                    message.reply(Body::Empty)
                }
                other => {
                    tracing::debug!("Ignoring {:?} from {}", other, channel.remote_address());
                    return;
                }
            };
            if let Err(e) = channel.send(reply).await {
                tracing::debug!("Reply to {} failed: {}", channel.remote_address(), e);
            }
        })
    }

    fn inactive(&self, remote: &str) {
        if let Some(shared) = self.shared.upgrade() {
            tracing::debug!("Channel to {} became inactive", remote);
            shared.events.publish(ChannelEvent::Inactive {
                address: shared.key.clone(),
            });
        }
    }
}

/// A counted handle on a pooled channel.
///
/// Call [`close`](Self::close) to give the ownership back; repeated calls are
/// no-ops.
pub struct PooledChannel {
    shared: Arc<SharedChannel>,
    released: AtomicBool,
}

impl PooledChannel {
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn status(&self) -> Status {
        self.shared.status.get()
    }

    /// Owners of the underlying connection, this handle included.
    pub fn ref_count(&self) -> usize {
        self.shared.ref_count()
    }

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.shared.current()
    }

    /// Subscribe to this connection's lifecycle events.
    pub fn events(&self) -> Option<broadcast::Receiver<ChannelEvent>> {
        self.shared.events.subscribe()
    }

    fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        let status = self.shared.status.get();
        if self.released.load(Ordering::Acquire) || status != Status::Opened {
            return Err(self.shared.closed_error(status));
        }
        self.shared
            .current()
            .ok_or_else(|| self.shared.closed_error(status))
    }

    /// Send without waiting for a reply. Fails at once unless opened.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.open_channel()?.send(message).await
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Message> {
        self.open_channel()?.request(message, timeout).await
    }

    /// Give back this handle's ownership.
    pub async fn close(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.release().await;
        Ok(())
    }
}

impl std::fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledChannel")
            .field("key", &self.shared.key)
            .field("status", &self.status())
            .finish()
    }
}

/// Endpoint key to shared connection.
pub struct ChannelPool {
    channels: Arc<ChannelMap>,
    config: PoolConfig,
}

impl ChannelPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get a handle on the connection for `key`, dialing with `connector` if
    /// no connection exists yet.
    pub async fn get_channel(&self, key: &str, connector: Arc<dyn Connector>) -> Result<PooledChannel> {
        let shared = self
            .channels
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(SharedChannel::new(
                    key,
                    connector,
                    &self.config,
                    Arc::downgrade(&self.channels),
                ))
            })
            .clone();

        shared.acquire().await?;
        Ok(PooledChannel {
            shared,
            released: AtomicBool::new(false),
        })
    }

    /// Status of the connection for `key`, if pooled.
    pub fn status(&self, key: &str) -> Option<Status> {
        self.channels.get(key).map(|s| s.status.get())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

impl Default for ChannelPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
