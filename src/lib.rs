//! # joywire
//!
//! RPC transport and invocation engine.
//!
//! ## Architecture
//!
//! - **Protocol**: a binary frame with a fixed header, TLV attributes and a
//!   serialized, optionally compressed body ([`protocol::FrameCodec`])
//! - **Transport**: tokio TCP channels with a dedicated writer task and
//!   request/response correlation ([`transport`])
//! - **Channel pool**: one reference-counted connection per remote address,
//!   kept alive by heartbeats and drained before close ([`channel`])
//! - **Invokers**: consumer and provider lifecycles, hot configuration and a
//!   process-wide registry sharing listening ports ([`invoker`])
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use joywire::discovery::MemoryRegistry;
//! use joywire::invoker::{ConsumerConfig, InvokerRegistry, ProviderConfig, ServiceDispatcher};
//!
//! #[tokio::main]
//! async fn main() -> joywire::Result<()> {
//!     let discovery = Arc::new(MemoryRegistry::default());
//!     let invokers = InvokerRegistry::default();
//!
//!     let echo = ServiceDispatcher::new("demo.Echo")
//!         .method("echo", |text: String| async move { Ok(text) });
//!     invokers
//!         .export(ProviderConfig::new(echo).with_registry(discovery.clone()))
//!         .await?;
//!
//!     let consumer = invokers
//!         .refer(ConsumerConfig::new("demo.Echo", discovery))
//!         .await?;
//!     let reply: String = consumer.invoke("echo", vec!["hi".into()]).await?;
//!     assert_eq!(reply, "hi");
//!
//!     invokers.close(true).await
//! }
//! ```

pub mod channel;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod event;
pub mod invoker;
pub mod promise;
pub mod protocol;
pub mod status;
pub mod transport;
pub mod url;

pub use error::{CodecError, Result, RpcError};
pub use invoker::{Consumer, ConsumerConfig, InvokerRegistry, Provider, ProviderConfig};
pub use status::Status;
