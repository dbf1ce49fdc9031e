//! Message types carried by frames.
//!
//! A [`Message`] pairs a [`Header`] with a [`Body`] whose schema is implied
//! by the header's message type.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::session::Session;
use super::wire_format::{Header, MsgType, PayloadKind};

/// Request payload of a business or callback call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub class_name: String,
    pub alias: String,
    pub method_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub attachments: BTreeMap<String, String>,
}

impl Invocation {
    pub fn new(class_name: &str, alias: &str, method_name: &str, args: Vec<Value>) -> Self {
        Self {
            class_name: class_name.to_string(),
            alias: alias.to_string(),
            method_name: method_name.to_string(),
            args,
            attachments: BTreeMap::new(),
        }
    }

    /// Routing key of the target service (`interface/alias`).
    pub fn service_key(&self) -> String {
        service_key(&self.class_name, &self.alias)
    }
}

/// Routing key shared by exporters and invocations.
pub fn service_key(interface: &str, alias: &str) -> String {
    format!("{}/{}", interface, alias)
}

/// Response payload: a result value or the provider's exception text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub exception: Option<String>,
}

impl ResponsePayload {
    pub fn ok(value: Value) -> Self {
        Self {
            result: Some(value),
            exception: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: None,
            exception: Some(message.into()),
        }
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.exception.is_some()
    }
}

/// Serialization/compression negotiation payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Negotiation {
    #[serde(default)]
    pub serializations: Vec<String>,
    #[serde(default)]
    pub compressions: Vec<String>,
    #[serde(default)]
    pub serialization: Option<String>,
    #[serde(default)]
    pub compression: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Invocation(Invocation),
    Response(ResponsePayload),
    Negotiation(Negotiation),
}

impl Body {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Body::Empty => PayloadKind::None,
            Body::Invocation(_) => PayloadKind::Invocation,
            Body::Response(_) => PayloadKind::Response,
            Body::Negotiation(_) => PayloadKind::Negotiation,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

/// One wire message.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub body: Body,
    /// Session resolved from `header.session_id` on decode.
    pub session: Option<Arc<Session>>,
    /// Set on decoded requests.
    pub receive_time: Option<Instant>,
}

impl Message {
    pub fn new(header: Header, body: Body) -> Self {
        Self {
            header,
            body,
            session: None,
            receive_time: None,
        }
    }

    /// Message with no payload (heartbeats, offline notices).
    pub fn empty(header: Header) -> Self {
        Self::new(header, Body::Empty)
    }

    #[inline]
    pub fn msg_type(&self) -> MsgType {
        self.header.msg_type
    }

    #[inline]
    pub fn msg_id(&self) -> u32 {
        self.header.msg_id
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.header.msg_type.is_request()
    }

    /// Build the response to this request, carrying `body`.
    pub fn reply(&self, body: Body) -> Message {
        let mut response = Message::new(self.header.response(), body);
        response.session = self.session.clone();
        response
    }
}
