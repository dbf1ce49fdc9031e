//! Integration tests for joywire.
//!
//! These tests run providers and consumers against each other over loopback
//! TCP with an in-process registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use serde_json::json;

use joywire::channel::{ChannelEvent, PooledChannel};
use joywire::codec::{MSGPACK_ID, ZLIB_ID};
use joywire::config::{keys, Params};
use joywire::discovery::{ClusterHandler, ConfigHandler, MemoryRegistry, Registry};
use joywire::invoker::{
    ConsumerConfig, ExporterEventKind, InvokerRegistry, ProviderConfig, RegistryConfig,
    ServiceDispatcher, Warmup,
};
use joywire::protocol::{
    service_key, Body, FrameCodec, Header, Invocation, Message, MsgType, ResponsePayload,
};
use joywire::transport::{TcpConnector, TransportConfig};
use joywire::url::Url;
use joywire::{RpcError, Status};

fn echo_service() -> ServiceDispatcher {
    ServiceDispatcher::new("demo.Echo")
        .method("echo", |text: String| async move { Ok(text) })
        .method("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
        .method("sleep", |ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
        .method("fail", |_: ()| async move {
            Err::<(), _>(RpcError::Invocation("refused".into()))
        })
}

/// Test several frames split across arbitrary read boundaries.
#[test]
fn test_fragmented_stream() {
    let codec = FrameCodec::default();
    let mut stream = BytesMut::new();
    for i in 1u32..=3 {
        let message = Message::new(
            Header::new(MsgType::BizReq, i)
                .with_serialization(MSGPACK_ID)
                .with_compression(ZLIB_ID),
            Body::Invocation(Invocation::new(
                "demo.Echo",
                "",
                "echo",
                vec![json!("x".repeat(1000 * i as usize))],
            )),
        );
        codec.encode(&message, &mut stream).unwrap();
    }

    let mut buffer = codec.frame_buffer();
    let mut frames = Vec::new();
    for chunk in stream.chunks(7) {
        frames.extend(buffer.push(chunk).unwrap());
    }
    assert_eq!(frames.len(), 3);
    assert!(buffer.is_empty());

    for (i, frame) in frames.into_iter().enumerate() {
        let decoded = codec.decode(frame, None).unwrap();
        assert_eq!(decoded.msg_id(), i as u32 + 1);
        match decoded.body {
            Body::Invocation(invocation) => {
                assert_eq!(invocation.args, vec![json!("x".repeat(1000 * (i + 1)))]);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }
}

/// Test a consumer invoking a provider discovered through the registry.
#[tokio::test]
async fn test_end_to_end_invoke() {
    let discovery = Arc::new(MemoryRegistry::default());
    let invokers = InvokerRegistry::default();

    let provider = invokers
        .export(ProviderConfig::new(echo_service()).with_registry(discovery.clone()))
        .await
        .unwrap();
    assert_eq!(provider.status(), Status::Opened);
    let bound = provider.local_addr().unwrap();
    assert_eq!(provider.registered()[0].port(), bound.port());

    let consumer = invokers
        .refer(ConsumerConfig::new("demo.Echo", discovery.clone()))
        .await
        .unwrap();
    assert_eq!(consumer.endpoints().len(), 1);

    let text: String = consumer.invoke("echo", vec![json!("hello")]).await.unwrap();
    assert_eq!(text, "hello");
    let sum: i64 = consumer.invoke("add", vec![json!(2), json!(40)]).await.unwrap();
    assert_eq!(sum, 42);

    let err = consumer.invoke::<()>("fail", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Invocation(ref m) if m.contains("refused")));
    let err = consumer.invoke::<()>("missing", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Invocation(_)));

    // One pooled connection serves every call.
    assert_eq!(invokers.pool().len(), 1);

    invokers.close(true).await.unwrap();
    assert_eq!(consumer.status(), Status::Closed);
    assert_eq!(provider.status(), Status::Closed);
    assert_eq!(discovery.close_count(), 1);
}

/// Test that a live key cannot be referred twice but can after close.
#[tokio::test]
async fn test_duplicate_refer() {
    let discovery = Arc::new(MemoryRegistry::default());
    let invokers = InvokerRegistry::default();
    let config = ConsumerConfig::new("demo.Echo", discovery.clone()).with_alias("blue");

    let first = invokers.refer(config.clone()).await.unwrap();
    let err = invokers.refer(config.clone()).await.unwrap_err();
    assert!(matches!(err, RpcError::DuplicateRegistration(_)));

    // A different alias is a different key.
    invokers
        .refer(config.clone().with_alias("green"))
        .await
        .unwrap();
    assert_eq!(invokers.refer_count(), 2);

    first.unrefer(true).await.unwrap();
    first.unrefer(true).await.unwrap();
    assert_eq!(invokers.refer_count(), 1);

    let again = invokers.refer(config).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &again));
    assert_eq!(again.status(), Status::Opened);

    let err = first.invoke::<String>("echo", vec![json!("x")]).await.unwrap_err();
    assert!(matches!(err, RpcError::IllegalState(ref m) if m == "Consumer config is closed."));
}

/// Test that a failed bind leaves nothing behind.
#[tokio::test]
async fn test_export_bind_failure() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let discovery = Arc::new(MemoryRegistry::default());
    let invokers = InvokerRegistry::default();

    let err = invokers
        .export(
            ProviderConfig::new(echo_service())
                .with_port(port)
                .with_registry(discovery.clone()),
        )
        .await
        .unwrap_err();
    match err {
        RpcError::Initialization { message, cause } => {
            assert_eq!(message, "Error occurs while open server");
            assert!(cause.is_some());
        }
        other => panic!("expected initialization error, got {:?}", other),
    }
    assert_eq!(invokers.export_count(), 0);
    assert!(invokers.server_ports().is_empty());
    assert!(discovery
        .endpoints(&Url::new("joy", None, 0, "demo.Echo"))
        .is_empty());

    // The key is free again once the port is.
    drop(taken);
    let provider = invokers
        .export(
            ProviderConfig::new(echo_service())
                .with_port(port)
                .with_registry(discovery),
        )
        .await
        .unwrap();
    assert_eq!(provider.local_addr().unwrap().port(), port);
    invokers.close(false).await.unwrap();
}

/// Test two services multiplexed over one listening port.
#[tokio::test]
async fn test_shared_port() {
    let discovery = Arc::new(MemoryRegistry::default());
    let invokers = InvokerRegistry::default();

    let upper = ServiceDispatcher::new("demo.Echo")
        .method("echo", |text: String| async move { Ok(text.to_uppercase()) });
    let a = invokers
        .export(ProviderConfig::new(echo_service()).with_registry(discovery.clone()))
        .await
        .unwrap();
    let b = invokers
        .export(
            ProviderConfig::new(upper)
                .with_alias("loud")
                .with_registry(discovery.clone()),
        )
        .await
        .unwrap();
    assert_eq!(a.local_addr(), b.local_addr());
    assert_eq!(invokers.server_ports().len(), 1);

    let err = invokers
        .export(ProviderConfig::new(echo_service()).with_registry(discovery.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::DuplicateRegistration(_)));

    let quiet = invokers
        .refer(ConsumerConfig::new("demo.Echo", discovery.clone()))
        .await
        .unwrap();
    let loud = invokers
        .refer(ConsumerConfig::new("demo.Echo", discovery.clone()).with_alias("loud"))
        .await
        .unwrap();
    let x: String = quiet.invoke("echo", vec![json!("hi")]).await.unwrap();
    let y: String = loud.invoke("echo", vec![json!("hi")]).await.unwrap();
    assert_eq!((x.as_str(), y.as_str()), ("hi", "HI"));

    // The port stays open until its last provider leaves.
    a.unexport(false).await.unwrap();
    assert_eq!(invokers.server_ports().len(), 1);
    let y: String = loud.invoke("echo", vec![json!("again")]).await.unwrap();
    assert_eq!(y, "AGAIN");
    b.unexport(false).await.unwrap();
    assert!(invokers.server_ports().is_empty());
    assert_eq!(invokers.export_count(), 0);

    invokers.close(false).await.unwrap();
}

/// Test that a graceful unrefer waits for the in-flight request.
#[tokio::test]
async fn test_graceful_drain() {
    let discovery = Arc::new(MemoryRegistry::default());
    let invokers = InvokerRegistry::default();
    invokers
        .export(ProviderConfig::new(echo_service()).with_registry(discovery.clone()))
        .await
        .unwrap();
    let consumer = invokers
        .refer(ConsumerConfig::new("demo.Echo", discovery))
        .await
        .unwrap();

    let started = Instant::now();
    let caller = consumer.clone();
    let call = tokio::spawn(async move { caller.invoke::<u64>("sleep", vec![json!(300)]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    consumer.unrefer(true).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(call.await.unwrap().unwrap(), 300);
    assert!(invokers.pool().is_empty());

    invokers.close(true).await.unwrap();
}

/// Test that a burst of config updates is applied once, with the newest data.
#[tokio::test(start_paused = true)]
async fn test_config_burst_coalesced() {
    let discovery = Arc::new(MemoryRegistry::default());
    let invokers =
        InvokerRegistry::new(RegistryConfig::default().with_update_delay(Duration::from_millis(100)));

    let consumer = invokers
        .refer(ConsumerConfig::new("demo.Echo", discovery.clone()).with_subscribe(true))
        .await
        .unwrap();
    assert_eq!(consumer.effective_url().param(keys::COUNTER), Some("0"));

    let versions: Vec<i64> = [100, 200, 300]
        .iter()
        .map(|timeout| {
            let data: Params = [(keys::TIMEOUT.to_string(), timeout.to_string())].into();
            discovery.publish_config("demo.Echo", data)
        })
        .collect();
    let last = versions[2];
    tokio::time::sleep(Duration::from_secs(1)).await;

    let url = consumer.effective_url();
    assert_eq!(url.param(keys::TIMEOUT), Some("300"));
    assert_eq!(url.param(keys::COUNTER), Some(last.to_string().as_str()));

    invokers.close(false).await.unwrap();
}

/// Registry whose config subscription never delivers.
struct SilentRegistry;

#[async_trait]
impl Registry for SilentRegistry {
    fn name(&self) -> &str {
        "silent"
    }
    async fn open(&self) -> joywire::Result<()> {
        Ok(())
    }
    async fn close(&self) -> joywire::Result<()> {
        Ok(())
    }
    async fn register(&self, _url: &Url) -> joywire::Result<()> {
        Ok(())
    }
    async fn deregister(&self, _url: &Url, _retry_times: u32) -> joywire::Result<()> {
        Ok(())
    }
    async fn subscribe_config(&self, _url: &Url, _handler: ConfigHandler) -> joywire::Result<()> {
        Ok(())
    }
    async fn unsubscribe_config(&self, _url: &Url, _handler: &ConfigHandler) -> joywire::Result<()> {
        Ok(())
    }
    async fn subscribe_cluster(&self, _url: &Url, _handler: ClusterHandler) -> joywire::Result<()> {
        Ok(())
    }
    async fn unsubscribe_cluster(&self, _url: &Url, _handler: &ClusterHandler) -> joywire::Result<()> {
        Ok(())
    }
}

/// Test that closing interrupts a refer still waiting for its config.
#[tokio::test]
async fn test_close_interrupts_config_wait() {
    let invokers = InvokerRegistry::default();
    let pending = {
        let invokers = invokers.clone();
        tokio::spawn(async move {
            invokers
                .refer(ConsumerConfig::new("demo.Echo", Arc::new(SilentRegistry)).with_subscribe(true))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(invokers.refer_count(), 1);

    invokers.close(false).await.unwrap();
    let err = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RpcError::Initialization { .. }));
    assert_eq!(invokers.refer_count(), 0);

    let err = invokers
        .refer(ConsumerConfig::new("demo.Echo", Arc::new(SilentRegistry)))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Shutdown(_)));
}

/// Test exporter lifecycle events.
#[tokio::test]
async fn test_exporter_events() {
    let discovery = Arc::new(MemoryRegistry::default());
    let invokers = InvokerRegistry::default();
    let mut events = invokers.exporter_events().unwrap();

    let provider = invokers
        .export(ProviderConfig::new(echo_service()).with_registry(discovery.clone()))
        .await
        .unwrap();
    provider.unexport(true).await.unwrap();

    let kinds: Vec<ExporterEventKind> = (0..3)
        .map(|_| events.try_recv().unwrap().kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            ExporterEventKind::Initial,
            ExporterEventKind::Open,
            ExporterEventKind::Close
        ]
    );
    assert!(discovery
        .endpoints(&Url::new("joy", None, 0, "demo.Echo"))
        .is_empty());

    invokers.close(true).await.unwrap();
}

/// Another handle on the pooled connection a consumer uses for `address`.
async fn pooled(invokers: &InvokerRegistry, address: &str) -> PooledChannel {
    let connector = Arc::new(TcpConnector::new(
        address,
        invokers.codec().clone(),
        TransportConfig::default(),
    ));
    invokers.pool().get_channel(address, connector).await.unwrap()
}

fn echo_request(alias: &str, text: &str) -> Message {
    Message::new(
        Header::new(MsgType::BizReq, 0).with_serialization(MSGPACK_ID),
        Body::Invocation(Invocation::new("demo.Echo", alias, "echo", vec![json!(text)])),
    )
}

struct SlowWarmup(Duration);

#[async_trait]
impl Warmup for SlowWarmup {
    async fn warmup(&self, _url: &Url) -> joywire::Result<()> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

/// Test that an unexport racing the export leaves no route behind on a shared port.
#[tokio::test]
async fn test_unexport_during_export_removes_route() {
    let discovery = Arc::new(MemoryRegistry::default());
    let invokers = InvokerRegistry::default();
    let keeper = invokers
        .export(
            ProviderConfig::new(echo_service())
                .with_alias("keeper")
                .with_registry(discovery.clone()),
        )
        .await
        .unwrap();
    let address = keeper.local_addr().unwrap().to_string();

    let late = ServiceDispatcher::new("demo.Echo")
        .method("echo", |text: String| async move { Ok(format!("late:{}", text)) });
    let exporting = {
        let invokers = invokers.clone();
        let discovery = discovery.clone();
        tokio::spawn(async move {
            invokers
                .export(
                    ProviderConfig::new(late)
                        .with_warmup(Arc::new(SlowWarmup(Duration::from_millis(300))))
                        .with_registry(discovery),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let provider = invokers.provider(&service_key("demo.Echo", ""), 0).unwrap();
    provider.unexport(false).await.unwrap();

    let err = exporting.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        RpcError::Initialization { ref message, .. } if message == "Provider was closed while opening."
    ));
    assert_eq!(provider.status(), Status::Closed);
    assert_eq!(invokers.export_count(), 1);
    assert!(discovery
        .endpoints(&Url::new("joy", None, 0, "demo.Echo"))
        .is_empty());

    // The port is still served, but not for the closed provider.
    let channel = pooled(&invokers, &address).await;
    let resp = channel
        .request(echo_request("", "hi"), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(matches!(resp.body, Body::Response(ref p) if p.is_error()));
    let resp = channel
        .request(echo_request("keeper", "hi"), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(resp.body, Body::Response(ResponsePayload::ok(json!("hi"))));

    channel.close().await.unwrap();
    invokers.close(false).await.unwrap();
}

/// Test that a graceful unexport tells connected consumers before the port closes.
#[tokio::test]
async fn test_graceful_unexport_sends_offline_notice() {
    let discovery = Arc::new(MemoryRegistry::default());
    let invokers = InvokerRegistry::default();
    // Registered by hand so unexport does not also withdraw the endpoint.
    let provider = invokers
        .export(ProviderConfig::new(echo_service()).with_register(false))
        .await
        .unwrap();
    let address = provider.local_addr().unwrap().to_string();
    let url = ProviderConfig::new(echo_service())
        .with_port(provider.local_addr().unwrap().port())
        .url();
    discovery.open().await.unwrap();
    discovery.register(&url).await.unwrap();

    let consumer = invokers
        .refer(ConsumerConfig::new("demo.Echo", discovery.clone()))
        .await
        .unwrap();
    let text: String = consumer.invoke("echo", vec![json!("before")]).await.unwrap();
    assert_eq!(text, "before");

    let channel = pooled(&invokers, &address).await;
    assert_eq!(channel.ref_count(), 2);
    let mut events = channel.events().unwrap();

    let closing = {
        let provider = provider.clone();
        tokio::spawn(async move { provider.unexport(true).await })
    };
    let first = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, ChannelEvent::Offline { address: address.clone() });
    closing.await.unwrap().unwrap();
    loop {
        match events.recv().await.unwrap() {
            ChannelEvent::Inactive { address: a } => {
                assert_eq!(a, address);
                break;
            }
            ChannelEvent::HeartbeatFailed { .. } => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    // The consumer stops picking the provider without a cluster update.
    for _ in 0..100 {
        if consumer.endpoints().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(consumer.endpoints().is_empty());
    assert_eq!(discovery.endpoints(&url).len(), 1);
    let err = consumer.invoke::<String>("echo", vec![json!("after")]).await.unwrap_err();
    assert!(matches!(err, RpcError::Connection(_)));

    channel.close().await.unwrap();
    invokers.close(true).await.unwrap();
}
