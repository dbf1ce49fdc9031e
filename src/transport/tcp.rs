//! TCP channels, connector and accept loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use super::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};
use super::{BoxFuture, Channel, Connector, FutureManager, IdleTrigger, MessageHandler};
use crate::error::{Result, RpcError};
use crate::protocol::{Body, FrameCodec, Message, ResponsePayload, SessionManager};

/// Default timeout for establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default maximum concurrently running inbound handlers per channel.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// How long [`TcpChannel::close`] waits for queued frames to flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Settings shared by connectors and servers.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub writer: WriterConfig,
    pub connect_timeout: Duration,
    pub max_concurrent_handlers: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            writer: WriterConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
        }
    }
}

/// A framed TCP connection.
///
/// Writes go through a dedicated writer task; a read task splits inbound
/// bytes into frames, completes pending requests with responses and hands
/// requests to the [`MessageHandler`].
pub struct TcpChannel {
    local: String,
    remote: String,
    codec: Arc<FrameCodec>,
    writer: Mutex<Option<WriterHandle>>,
    writer_task: Mutex<Option<JoinHandle<Result<()>>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
    futures: FutureManager,
    sessions: SessionManager,
    idle: Mutex<Option<(Duration, IdleTrigger)>>,
    /// Wakes the read loop so a new idle trigger takes effect while blocked.
    idle_changed: Arc<Notify>,
}

impl TcpChannel {
    /// Wrap a connected stream and start its reader and writer tasks.
    pub fn spawn(
        stream: TcpStream,
        codec: Arc<FrameCodec>,
        handler: Arc<dyn MessageHandler>,
        config: &TransportConfig,
    ) -> Arc<Self> {
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let remote = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay on {}: {}", remote, e);
        }

        let (read_half, write_half) = stream.into_split();
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer.clone());

        let channel = Arc::new(Self {
            local,
            remote,
            codec: codec.clone(),
            writer: Mutex::new(Some(writer)),
            writer_task: Mutex::new(Some(writer_task)),
            reader_task: Mutex::new(None),
            active: AtomicBool::new(true),
            futures: FutureManager::new(),
            sessions: SessionManager::new(),
            idle: Mutex::new(None),
            idle_changed: Arc::new(Notify::new()),
        });

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_handlers));
        let reader = tokio::spawn(read_loop(
            Arc::downgrade(&channel),
            read_half,
            codec,
            handler,
            semaphore,
        ));
        *channel.reader_task.lock() = Some(reader);
        channel
    }

    fn mark_inactive(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            self.futures
                .fail_all(RpcError::ChannelClosed(format!("{} closed", self.remote)));
        }
    }

    /// Route one inbound frame.
    fn dispatch(
        self: &Arc<Self>,
        frame: Bytes,
        handler: &Arc<dyn MessageHandler>,
        semaphore: &Arc<Semaphore>,
    ) {
        let message = match self.codec.decode(frame, Some(&self.sessions)) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Decode error from {}: {}", self.remote, e);
                match e.header.as_deref() {
                    Some(h) if h.msg_type.is_request() => {
                        let reply = Message::new(
                            h.response(),
                            Body::Response(ResponsePayload::error(e.to_string())),
                        );
                        self.reply_detached(reply);
                    }
                    Some(h) => {
                        self.futures.complete(h.msg_id, Err(e.into()));
                    }
                    None => {}
                }
                return;
            }
        };

        if !message.is_request() {
            let msg_id = message.msg_id();
            if !self.futures.complete(msg_id, Ok(message)) {
                tracing::debug!("Dropping response {} with no pending request", msg_id);
            }
            return;
        }

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!(
                    "Handler capacity reached, dropping request {} from {}",
                    message.msg_id(),
                    self.remote
                );
                return;
            }
        };

        let handler = handler.clone();
        let channel: Arc<dyn Channel> = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handler.handle(channel, message).await;
        });
    }

    fn reply_detached(self: &Arc<Self>, message: Message) {
        let channel = self.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.send(message).await {
                tracing::debug!("Failed to reply to {}: {}", channel.remote, e);
            }
        });
    }
}

#[async_trait]
impl Channel for TcpChannel {
    fn local_address(&self) -> &str {
        &self.local
    }

    fn remote_address(&self) -> &str {
        &self.remote
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn futures(&self) -> &FutureManager {
        &self.futures
    }

    fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn set_idle_trigger(&self, interval: Duration, trigger: IdleTrigger) {
        *self.idle.lock() = Some((interval, trigger));
        self.idle_changed.notify_one();
    }

    async fn send(&self, message: Message) -> Result<()> {
        if !self.is_active() {
            return Err(RpcError::ChannelClosed(self.remote.clone()));
        }
        let writer = self
            .writer
            .lock()
            .clone()
            .ok_or_else(|| RpcError::ChannelClosed(self.remote.clone()))?;
        if writer.is_closed() {
            // The writer died on a socket error the reader has not seen yet.
            self.mark_inactive();
            return Err(RpcError::ChannelClosed(self.remote.clone()));
        }

        let mut buf = BytesMut::new();
        self.codec.encode(&message, &mut buf)?;
        writer.send(OutboundFrame::new(buf.freeze())).await
    }

    async fn close(&self) -> Result<()> {
        self.mark_inactive();
        // Dropping the last handle lets the writer drain its queue and shut down.
        self.writer.lock().take();
        let writer_task = self.writer_task.lock().take();
        if let Some(task) = writer_task {
            match tokio::time::timeout(FLUSH_TIMEOUT, task).await {
                Ok(Ok(Err(e))) => tracing::debug!("Writer for {} ended with: {}", self.remote, e),
                Ok(_) => {}
                Err(_) => tracing::debug!("Writer for {} did not flush in time", self.remote),
            }
        }
        if let Some(reader) = self.reader_task.lock().take() {
            reader.abort();
        }
        Ok(())
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        if let Some(reader) = self.reader_task.get_mut().take() {
            reader.abort();
        }
    }
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn read_loop(
    weak: Weak<TcpChannel>,
    mut reader: OwnedReadHalf,
    codec: Arc<FrameCodec>,
    handler: Arc<dyn MessageHandler>,
    semaphore: Arc<Semaphore>,
) {
    let mut frames = codec.frame_buffer();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let (idle, idle_changed) = match weak.upgrade() {
            Some(channel) => (channel.idle.lock().clone(), channel.idle_changed.clone()),
            None => return,
        };
        let read = match idle {
            Some((interval, trigger)) => {
                match tokio::time::timeout(interval, reader.read(&mut buf)).await {
                    Ok(read) => read,
                    Err(_) => {
                        trigger();
                        continue;
                    }
                }
            }
            None => tokio::select! {
                read = reader.read(&mut buf) => read,
                _ = idle_changed.notified() => continue,
            },
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Read error: {}", e);
                break;
            }
        };

        let batch = match frames.push(&buf[..n]) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("Frame error: {}", e);
                break;
            }
        };

        let Some(channel) = weak.upgrade() else {
            return;
        };
        for frame in batch {
            channel.dispatch(frame, &handler, &semaphore);
        }
    }

    if let Some(channel) = weak.upgrade() {
        channel.mark_inactive();
        handler.inactive(&channel.remote);
    }
}

/// Opens [`TcpChannel`]s to one address.
pub struct TcpConnector {
    address: String,
    codec: Arc<FrameCodec>,
    config: TransportConfig,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, codec: Arc<FrameCodec>, config: TransportConfig) -> Self {
        Self {
            address: address.into(),
            codec,
            config,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self, handler: Arc<dyn MessageHandler>) -> Result<Arc<dyn Channel>> {
        let stream =
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&self.address))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    return Err(RpcError::Connection(format!(
                        "connect to {} failed: {}",
                        self.address, e
                    )))
                }
                Err(_) => {
                    return Err(RpcError::Connection(format!(
                        "connect to {} timed out after {:?}",
                        self.address, self.config.connect_timeout
                    )))
                }
            };
        tracing::debug!("Connected to {}", self.address);
        let channel: Arc<dyn Channel> =
            TcpChannel::spawn(stream, self.codec.clone(), handler, &self.config);
        Ok(channel)
    }
}

/// Accepts connections and tracks the resulting channels.
pub struct TcpServer {
    local: std::net::SocketAddr,
    connections: Arc<DashMap<String, Arc<TcpChannel>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    /// Bind `address` and start accepting.
    pub async fn bind(
        address: &str,
        codec: Arc<FrameCodec>,
        handler: Arc<dyn MessageHandler>,
        config: TransportConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        let local = listener.local_addr()?;
        let connections: Arc<DashMap<String, Arc<TcpChannel>>> = Arc::new(DashMap::new());

        let tracked = connections.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                let handler = Arc::new(Untrack {
                    inner: handler.clone(),
                    connections: Arc::downgrade(&tracked),
                });
                let channel = TcpChannel::spawn(stream, codec.clone(), handler, &config);
                tracing::debug!("Accepted connection from {}", peer);
                tracked.insert(channel.remote.clone(), channel);
            }
        });

        Ok(Self {
            local,
            connections,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local
    }

    /// Channels of currently connected peers.
    pub fn connections(&self) -> Vec<Arc<TcpChannel>> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }

    /// Stop accepting and close every connection.
    pub async fn close(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let channels = self.connections();
        self.connections.clear();
        for channel in channels {
            if let Err(e) = channel.close().await {
                tracing::debug!("Closing connection from {}: {}", channel.remote, e);
            }
        }
    }
}

/// Drops a connection from the server's table once it stops reading.
struct Untrack {
    inner: Arc<dyn MessageHandler>,
    connections: Weak<DashMap<String, Arc<TcpChannel>>>,
}

impl MessageHandler for Untrack {
    fn handle(&self, channel: Arc<dyn Channel>, message: Message) -> BoxFuture<'static, ()> {
        self.inner.handle(channel, message)
    }

    fn inactive(&self, remote: &str) {
        if let Some(connections) = self.connections.upgrade() {
            connections.remove(remote);
        }
        self.inner.inactive(remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CodecConfig, Header, MsgType};
    use std::sync::atomic::AtomicUsize;

    struct Pong;

    impl MessageHandler for Pong {
        fn handle(&self, channel: Arc<dyn Channel>, message: Message) -> BoxFuture<'static, ()> {
            Box::pin(async move {
                let _ = channel.send(message.reply(Body::Empty)).await;
            })
        }
    }

    fn codec() -> Arc<FrameCodec> {
        Arc::new(FrameCodec::new(CodecConfig::default()))
    }

    #[tokio::test]
    async fn test_request_response_over_tcp() {
        let server = TcpServer::bind("127.0.0.1:0", codec(), Arc::new(Pong), TransportConfig::default())
            .await
            .unwrap();
        let connector = TcpConnector::new(
            server.local_addr().to_string(),
            codec(),
            TransportConfig::default(),
        );
        let channel = connector.connect(Arc::new(Pong)).await.unwrap();
        assert!(channel.is_active());

        let resp = channel
            .request(
                Message::empty(Header::new(MsgType::HbReq, 0)),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(resp.msg_type(), MsgType::HbResp);
        assert!(channel.futures().is_empty());

        channel.close().await.unwrap();
        assert!(!channel.is_active());
        assert!(matches!(
            channel.send(Message::empty(Header::new(MsgType::HbReq, 9))).await,
            Err(RpcError::ChannelClosed(_))
        ));
        server.close().await;
    }

    #[tokio::test]
    async fn test_idle_trigger_fires_on_quiet_channel() {
        let server = TcpServer::bind("127.0.0.1:0", codec(), Arc::new(Pong), TransportConfig::default())
            .await
            .unwrap();
        let connector = TcpConnector::new(
            server.local_addr().to_string(),
            codec(),
            TransportConfig::default(),
        );
        let channel = connector.connect(Arc::new(Pong)).await.unwrap();

        // Installed while the read loop is already waiting on the socket.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        channel.set_idle_trigger(
            Duration::from_millis(30),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            }),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::Acquire) >= 2);

        channel.close().await.unwrap();
        server.close().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let connector = TcpConnector::new(addr, codec(), TransportConfig::default());
        assert!(matches!(
            connector.connect(Arc::new(Pong)).await,
            Err(RpcError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_close_fails_pending() {
        struct Silent;
        impl MessageHandler for Silent {
            fn handle(&self, _c: Arc<dyn Channel>, _m: Message) -> BoxFuture<'static, ()> {
                Box::pin(async {})
            }
        }

        let server = TcpServer::bind("127.0.0.1:0", codec(), Arc::new(Silent), TransportConfig::default())
            .await
            .unwrap();
        let connector = TcpConnector::new(
            server.local_addr().to_string(),
            codec(),
            TransportConfig::default(),
        );
        let channel = connector.connect(Arc::new(Silent)).await.unwrap();
        let pending = {
            let channel = channel.clone();
            tokio::spawn(async move {
                channel
                    .request(
                        Message::empty(Header::new(MsgType::HbReq, 0)),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close().await;
        assert!(matches!(
            pending.await.unwrap(),
            Err(RpcError::ChannelClosed(_))
        ));
    }
}
