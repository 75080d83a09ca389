use super::Acknowledgement;
use std::collections::HashMap;
use std::fmt;

/// Content type of JSON encoded payloads
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Routing behaviour of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Routes on exact equality of routing key and binding key
    Direct,
    /// Routes on dot separated binding patterns where `*` matches one word and `#` matches zero or more words
    Topic,
    /// Routes to every bound queue regardless of the routing key
    Fanout,
}

impl Default for ExchangeKind {
    fn default() -> Self {
        ExchangeKind::Direct
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Topic => write!(f, "topic"),
            ExchangeKind::Fanout => write!(f, "fanout"),
        }
    }
}

/// Value of an application header
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    /// Boolean flag
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        HeaderValue::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

/// Application headers attached to a message
pub type Headers = HashMap<String, HeaderValue>;

/// Metadata travelling alongside a payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    /// MIME type of the payload
    pub content_type: Option<String>,
    /// Encoding applied to the payload (e.g. `gzip`)
    pub content_encoding: Option<String>,
    /// Arbitrary application headers
    pub headers: Headers,
    /// Identifier assigned by the publisher, unique per logical request
    pub message_id: Option<String>,
    /// Queue responses to this message should be routed to
    pub reply_to: Option<String>,
    /// Identifier of the request this message is a response to
    pub correlation_id: Option<String>,
}

/// Message which is about to be published
///
/// The payload can not be modified once the envelope has been created.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEnvelope {
    exchange: String,
    routing_key: String,
    kind: ExchangeKind,
    properties: Properties,
    payload: Vec<u8>,
}

impl OutboundEnvelope {
    /// Creates a new envelope for a direct exchange without any properties
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            kind: ExchangeKind::default(),
            properties: Properties::default(),
            payload: payload.into(),
        }
    }

    /// Sets the kind of exchange the message is published to
    pub fn with_kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Declares the content type of the payload
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    /// Declares the encoding of the payload
    pub fn with_content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.properties.content_encoding = Some(content_encoding.into());
        self
    }

    /// Adds an application header, replacing any previous value with the same name
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.properties.headers.insert(name.into(), value.into());
        self
    }

    /// Assigns a message identifier
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.properties.message_id = Some(message_id.into());
        self
    }

    /// Sets the address responses should be routed to
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }

    /// Marks the message as a response to the request with the given identifier
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    /// Exchange the message will be published to
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Key used for routing within the exchange
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Kind of the target exchange
    pub fn kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Metadata of the message
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Opaque message body
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Message data as it has been delivered by a bus
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveredMessage {
    exchange: String,
    routing_key: String,
    properties: Properties,
    payload: Vec<u8>,
    redelivered: bool,
}

impl DeliveredMessage {
    /// Creates a new instance from raw parts
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        properties: Properties,
        payload: Vec<u8>,
        redelivered: bool,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            properties,
            payload,
            redelivered,
        }
    }

    /// Exchange the message was published to
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Routing key the message was published with
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Metadata of the message
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Opaque message body
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the message and returns its body
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Whether the message has been delivered before and was requeued
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Shorthand for [`Properties::message_id`]
    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    /// Shorthand for [`Properties::reply_to`]
    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }

    /// Shorthand for [`Properties::correlation_id`]
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    /// Shorthand for [`Properties::content_type`]
    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type.as_deref()
    }
}

/// Message delivered by a bus together with the means to settle it
///
/// The [`Acknowledgement`] has to be settled exactly once, by either acknowledging,
/// negatively acknowledging or rejecting the delivery.
#[derive(Debug)]
pub struct InboundEnvelope {
    /// Delivered message data
    pub message: DeliveredMessage,
    /// Handle to settle the delivery with the bus
    pub acknowledgement: Acknowledgement,
}

impl InboundEnvelope {
    /// Creates a new instance from raw parts
    pub fn new(message: DeliveredMessage, acknowledgement: Acknowledgement) -> Self {
        Self {
            message,
            acknowledgement,
        }
    }

    /// Splits the envelope so that the message can be handed off while the delivery is settled separately
    pub fn into_parts(self) -> (DeliveredMessage, Acknowledgement) {
        (self.message, self.acknowledgement)
    }
}
