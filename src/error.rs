//! Error types for joywire.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::protocol::Header;

/// Main error type for all joywire operations.
///
/// Cloneable so a single failure can be handed to every waiter queued on a
/// connect or cached inside a shared completion.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// Payload serialization/deserialization error.
    #[error("Serializer error: {0}")]
    Serializer(String),

    /// Frame encode/decode error, classified by kind.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Dial or transport failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Send attempted on a channel that is not open.
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Refer/export key collision with a live entry.
    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// Failure in an open sequence.
    #[error("Initialization error: {message}")]
    Initialization {
        message: String,
        #[source]
        cause: Option<Box<RpcError>>,
    },

    /// Operation attempted after shutdown.
    #[error("Shutdown: {0}")]
    Shutdown(String),

    /// Operation not valid in the current state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Request or wait exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Registry backend failure.
    #[error("Registry error: {0}")]
    Registry(String),

    /// Remote invocation failed on the provider.
    #[error("Invocation error: {0}")]
    Invocation(String),
}

impl RpcError {
    /// Build an initialization error without a cause.
    pub fn init(message: impl Into<String>) -> Self {
        RpcError::Initialization {
            message: message.into(),
            cause: None,
        }
    }

    /// Build an initialization error wrapping `cause`.
    pub fn init_caused(message: impl Into<String>, cause: RpcError) -> Self {
        RpcError::Initialization {
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        RpcError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        RpcError::Serializer(format!("json: {}", e))
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RpcError::Serializer(format!("msgpack encode: {}", e))
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RpcError::Serializer(format!("msgpack decode: {}", e))
    }
}

/// Classification of codec failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecErrorKind {
    /// Unknown serializer or payload (de)serialization failure.
    Serializer,
    /// Stream failure while reading or writing the frame.
    Io,
    /// Malformed header: bad magic, unknown message type, bad attribute tag.
    HeaderFormat,
    /// Anything else.
    Default,
}

impl fmt::Display for CodecErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CodecErrorKind::Serializer => "CODEC_SERIALIZER",
            CodecErrorKind::Io => "CODEC_IO",
            CodecErrorKind::HeaderFormat => "CODEC_HEADER_FORMAT",
            CodecErrorKind::Default => "CODEC_DEFAULT",
        };
        f.write_str(s)
    }
}

/// Codec error annotated with the offending header when one was parsed.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct CodecError {
    pub kind: CodecErrorKind,
    pub message: String,
    pub header: Option<Box<Header>>,
}

impl CodecError {
    pub fn new(kind: CodecErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            header: None,
        }
    }

    pub fn header_format(message: impl Into<String>) -> Self {
        Self::new(CodecErrorKind::HeaderFormat, message)
    }

    pub fn serializer(message: impl Into<String>) -> Self {
        Self::new(CodecErrorKind::Serializer, message)
    }

    /// Reclassify an arbitrary failure raised while encoding or decoding.
    ///
    /// An existing codec error keeps its kind; serializer and I/O failures map
    /// to their kinds; anything else becomes [`CodecErrorKind::Default`].
    pub fn classify(context: &str, err: RpcError) -> Self {
        match err {
            RpcError::Codec(e) => e,
            RpcError::Serializer(msg) => {
                Self::new(CodecErrorKind::Serializer, format!("{} {}", context, msg))
            }
            RpcError::Io(e) => Self::new(CodecErrorKind::Io, format!("{} {}", context, e)),
            other => Self::new(CodecErrorKind::Default, format!("{} {}", context, other)),
        }
    }

    /// Attach the header for diagnostics.
    pub fn with_header(mut self, header: Option<&Header>) -> Self {
        if let Some(h) = header {
            self.header = Some(Box::new(h.clone()));
        }
        self
    }

    /// Message id of the attached header, if any.
    pub fn msg_id(&self) -> Option<u32> {
        self.header.as_ref().map(|h| h.msg_id)
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
