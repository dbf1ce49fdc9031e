//! Transport layer: channel abstraction and the TCP implementation.
//!
//! A [`Channel`] is one live connection able to send [`Message`]s and to
//! correlate responses with outstanding requests. A [`Connector`] opens
//! channels to one remote address; inbound requests on a channel go to a
//! [`MessageHandler`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, RpcError};
use crate::protocol::{Message, SessionManager};

mod future;
mod tcp;
mod writer;

pub use future::FutureManager;
pub use tcp::{TcpChannel, TcpConnector, TcpServer, TransportConfig, DEFAULT_CONNECT_TIMEOUT};
pub use writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Callback fired when a channel has read nothing for its idle interval.
pub type IdleTrigger = Arc<dyn Fn() + Send + Sync>;

/// One live connection.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    fn local_address(&self) -> &str;

    fn remote_address(&self) -> &str;

    /// Whether the connection can still carry traffic.
    fn is_active(&self) -> bool;

    /// Requests awaiting a response on this channel.
    fn futures(&self) -> &FutureManager;

    fn sessions(&self) -> &SessionManager;

    /// Fire `trigger` whenever nothing has been read for `interval`.
    fn set_idle_trigger(&self, interval: Duration, trigger: IdleTrigger);

    /// Queue a message. Send order on one channel is preserved.
    async fn send(&self, message: Message) -> Result<()>;

    /// Close the connection, flushing frames already queued.
    async fn close(&self) -> Result<()>;

    /// Send a request and wait up to `timeout` for the matching response.
    ///
    /// The message id is allocated here.
    async fn request(&self, mut message: Message, timeout: Duration) -> Result<Message> {
        let msg_id = self.futures().next_id();
        message.header.msg_id = msg_id;
        let rx = self.futures().register(msg_id);
        if let Err(e) = self.send(message).await {
            self.futures().remove(msg_id);
            return Err(e);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RpcError::ChannelClosed(self.remote_address().to_string())),
            Err(_) => {
                self.futures().remove(msg_id);
                Err(RpcError::Timeout(format!(
                    "request {} to {} timed out after {:?}",
                    msg_id,
                    self.remote_address(),
                    timeout
                )))
            }
        }
    }
}

/// Receives requests arriving on a channel.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, channel: Arc<dyn Channel>, message: Message) -> BoxFuture<'static, ()>;

    /// The channel to `remote` stopped reading.
    fn inactive(&self, _remote: &str) {}
}

/// Opens channels to one remote address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    fn address(&self) -> &str;

    async fn connect(&self, handler: Arc<dyn MessageHandler>) -> Result<Arc<dyn Channel>>;
}
