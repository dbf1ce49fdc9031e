//! Listening port shared by every service exported on it.
//!
//! Requests are routed to a [`ServiceDispatcher`] by the `interface/alias`
//! key carried in the invocation, so any number of services can be exported
//! on one port over one listener.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::dispatch::ServiceDispatcher;
use crate::error::{Result, RpcError};
use crate::protocol::{
    Body, FrameCodec, Header, Message, MsgType, Negotiation, ResponsePayload, Session,
};
use crate::promise::Promise;
use crate::status::{AtomicStatus, Status};
use crate::transport::{BoxFuture, Channel, MessageHandler, TcpServer, TransportConfig};

type Routes = DashMap<String, Arc<ServiceDispatcher>>;

/// One listening port and its service routes.
pub struct ShareServer {
    host: String,
    port: u16,
    codec: Arc<FrameCodec>,
    transport: TransportConfig,
    routes: Arc<Routes>,
    status: AtomicStatus,
    open_future: Mutex<Option<Promise<()>>>,
    listener: Mutex<Option<Arc<TcpServer>>>,
    users: AtomicUsize,
}

impl ShareServer {
    pub fn new(host: &str, port: u16, codec: Arc<FrameCodec>, transport: TransportConfig) -> Self {
        Self {
            host: host.to_string(),
            port,
            codec,
            transport,
            routes: Arc::new(DashMap::new()),
            status: AtomicStatus::new(Status::Closed),
            open_future: Mutex::new(None),
            listener: Mutex::new(None),
            users: AtomicUsize::new(0),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> Status {
        self.status.get()
    }

    /// Bound address once open.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.lock().as_ref().map(|l| l.local_addr())
    }

    /// Add one user of this port.
    pub fn retain(&self) {
        self.users.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one user. Returns `true` for the last one.
    pub fn release(&self) -> bool {
        let prev = self
            .users
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev <= 1
    }

    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }

    pub fn add_route(&self, key: &str, dispatcher: Arc<ServiceDispatcher>) {
        self.routes.insert(key.to_string(), dispatcher);
    }

    pub fn remove_route(&self, key: &str) {
        self.routes.remove(key);
    }

    /// Bind the listener; concurrent callers share one bind.
    pub async fn open(&self) -> Result<()> {
        if self.status.transition(Status::Closed, Status::Opening) {
            let promise = Promise::new();
            *self.open_future.lock() = Some(promise.clone());

            let handler = Arc::new(ServerHandler {
                routes: self.routes.clone(),
                codec: self.codec.clone(),
            });
            let address = format!("{}:{}", self.host, self.port);
            let outcome = match TcpServer::bind(
                &address,
                self.codec.clone(),
                handler,
                self.transport.clone(),
            )
            .await
            {
                Ok(listener) => {
                    tracing::info!("Server listening on {}", listener.local_addr());
                    *self.listener.lock() = Some(Arc::new(listener));
                    self.status.set(Status::Opened);
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("Failed to bind {}: {}", address, e);
                    self.status.set(Status::Closed);
                    Err(e)
                }
            };
            promise.complete(outcome.clone());
            return outcome;
        }

        let promise = self.open_future.lock().clone();
        match promise {
            Some(p) if self.status.get() != Status::Closing => p.wait().await,
            _ => Err(RpcError::IllegalState(format!(
                "server on port {} is {}",
                self.port,
                self.status.get()
            ))),
        }
    }

    /// Ask every connected peer to stop sending, waiting at most `timeout`.
    pub async fn offline(&self, timeout: Duration) {
        let listener = self.listener.lock().clone();
        let Some(listener) = listener else {
            return;
        };
        let notices = listener.connections().into_iter().map(|channel| async move {
            let notice = Message::empty(Header::new(MsgType::OfflineReq, 0));
            if let Err(e) = channel.request(notice, timeout).await {
                tracing::debug!("Offline notice to {} failed: {}", channel.remote_address(), e);
            }
        });
        if tokio::time::timeout(timeout, futures::future::join_all(notices))
            .await
            .is_err()
        {
            tracing::debug!("Offline notices on port {} timed out", self.port);
        }
    }

    /// Stop listening and drop every connection.
    pub async fn close(&self) {
        if !self.status.transition(Status::Opened, Status::Closing) {
            return;
        }
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.close().await;
        }
        self.routes.clear();
        self.status.set(Status::Closed);
        tracing::info!("Server on port {} closed", self.port);
    }
}

/// Handles requests arriving at a [`ShareServer`].
struct ServerHandler {
    routes: Arc<Routes>,
    codec: Arc<FrameCodec>,
}

impl ServerHandler {
    fn negotiate(&self, channel: &dyn Channel, header: &Header, offer: Negotiation) -> Negotiation {
        let serialization = offer
            .serializations
            .iter()
            .find_map(|name| self.codec.serialization_id(name).map(|id| (id, name.clone())));
        let compression = offer
            .compressions
            .iter()
            .find_map(|name| self.codec.compression_id(name).map(|id| (id, name.clone())));

        if header.session_id > 0 {
            channel.sessions().put(Session {
                session_id: header.session_id,
                serialization: serialization.as_ref().map_or(header.serialization, |s| s.0),
                compression: compression.as_ref().map_or(0, |c| c.0),
            });
        }

        Negotiation {
            serializations: offer.serializations,
            compressions: offer.compressions,
            serialization: serialization.map(|s| s.1),
            compression: compression.map(|c| c.1),
            attributes: offer.attributes,
        }
    }
}

impl MessageHandler for ServerHandler {
    fn handle(&self, channel: Arc<dyn Channel>, message: Message) -> BoxFuture<'static, ()> {
        let reply = match message.msg_type() {
            MsgType::HbReq | MsgType::SessionbeatReq => Some(message.reply(Body::Empty)),
            MsgType::NegotiationReq => {
                let offer = match &message.body {
                    Body::Negotiation(n) => n.clone(),
                    _ => Negotiation::default(),
                };
                let answer = self.negotiate(channel.as_ref(), &message.header, offer);
                Some(message.reply(Body::Negotiation(answer)))
            }
            MsgType::BizReq | MsgType::CallbackReq => None,
            other => {
                tracing::debug!("Ignoring {:?} from {}", other, channel.remote_address());
                return Box::pin(async {});
            }
        };

        if let Some(reply) = reply {
            return Box::pin(async move {
                if let Err(e) = channel.send(reply).await {
                    tracing::debug!("Reply to {} failed: {}", channel.remote_address(), e);
                }
            });
        }

        let routes = self.routes.clone();
        Box::pin(async move {
            let payload = match &message.body {
                Body::Invocation(invocation) => {
                    let key = invocation.service_key();
                    let dispatcher = routes.get(&key).map(|d| d.value().clone());
                    match dispatcher {
                        Some(dispatcher) => dispatcher.dispatch(invocation.clone()).await,
                        None => ResponsePayload::error(format!("service {} not found", key)),
                    }
                }
                _ => ResponsePayload::error("request carries no invocation"),
            };
            if let Err(e) = channel.send(message.reply(Body::Response(payload))).await {
                tracing::debug!("Response to {} failed: {}", channel.remote_address(), e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CodecConfig, Invocation};
    use crate::transport::{Connector, TcpConnector};
    use serde_json::json;

    struct NoInbound;

    impl MessageHandler for NoInbound {
        fn handle(&self, _c: Arc<dyn Channel>, _m: Message) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    fn codec() -> Arc<FrameCodec> {
        Arc::new(FrameCodec::new(CodecConfig::default()))
    }

    #[tokio::test]
    async fn test_routes_by_service_key() {
        let server = ShareServer::new("127.0.0.1", 0, codec(), TransportConfig::default());
        server.add_route(
            "demo.Echo/a",
            Arc::new(ServiceDispatcher::new("demo.Echo").method("echo", |s: String| async move { Ok(s) })),
        );
        server.add_route(
            "demo.Echo/b",
            Arc::new(
                ServiceDispatcher::new("demo.Echo")
                    .method("echo", |s: String| async move { Ok(s.to_uppercase()) }),
            ),
        );
        server.open().await.unwrap();
        server.open().await.unwrap();

        let addr = server.local_addr().unwrap().to_string();
        let channel = TcpConnector::new(addr, codec(), TransportConfig::default())
            .connect(Arc::new(NoInbound))
            .await
            .unwrap();

        for (alias, expected) in [("a", "hi"), ("b", "HI")] {
            let req = Message::new(
                Header::new(MsgType::BizReq, 0).with_serialization(1),
                Body::Invocation(Invocation::new("demo.Echo", alias, "echo", vec![json!("hi")])),
            );
            let resp = channel.request(req, Duration::from_secs(2)).await.unwrap();
            assert_eq!(resp.body, Body::Response(ResponsePayload::ok(json!(expected))));
        }

        let missing = Message::new(
            Header::new(MsgType::BizReq, 0).with_serialization(1),
            Body::Invocation(Invocation::new("demo.Other", "", "x", vec![])),
        );
        let resp = channel.request(missing, Duration::from_secs(2)).await.unwrap();
        assert!(matches!(resp.body, Body::Response(ref p) if p.is_error()));

        server.close().await;
        assert_eq!(server.status(), Status::Closed);
    }

    #[tokio::test]
    async fn test_bind_conflict_fails_open() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = ShareServer::new("127.0.0.1", port, codec(), TransportConfig::default());
        assert!(server.open().await.is_err());
        assert_eq!(server.status(), Status::Closed);
    }

    #[test]
    fn test_user_counting() {
        let server = ShareServer::new("127.0.0.1", 0, codec(), TransportConfig::default());
        server.retain();
        server.retain();
        assert!(!server.release());
        assert!(server.release());
        assert_eq!(server.users(), 0);
    }
}
