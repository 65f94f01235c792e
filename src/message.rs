// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Broker-independent representations of published and consumed messages, and
//! of the envelope a failed message is wrapped in before it is republished to
//! the error exchange.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Header holding the number of times a message has been dead-lettered
pub const HEADER_ATTEMPT_COUNT: &str = "x-attempt-count";
/// Header holding the exchange a dead-lettered message was first published to
pub const HEADER_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
/// Header holding the routing key a dead-lettered message was first published with
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routingKey";
/// Header holding the reason the consumer failed
pub const HEADER_EXCEPTION_MESSAGE: &str = "x-exception-message";
/// Header holding the source chain of the consumer error, one cause per line
pub const HEADER_EXCEPTION_CAUSES: &str = "x-exception-causes";
/// Header holding the correlation id of the message before it was dead-lettered
pub const HEADER_ORIGINAL_CORRELATION_ID: &str = "x-original-correlation-id";

/// A message header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Int(i64),
    Str(String),
}

impl HeaderValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Str(v) => v.parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(v) => Some(v),
            HeaderValue::Int(_) => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

/// Ordered message headers.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub(crate) body: Vec<u8>,
    pub(crate) routing_key: String,
    pub(crate) persistent: bool,
    pub(crate) correlation_id: String,
    pub(crate) headers: Headers,
}

impl OutboundMessage {
    /// Creates a transient message with a freshly generated correlation id.
    pub fn new(routing_key: &str, body: impl Into<Vec<u8>>) -> OutboundMessage {
        OutboundMessage {
            body: body.into(),
            routing_key: routing_key.to_owned(),
            persistent: false,
            correlation_id: Uuid::new_v4().to_string(),
            headers: Headers::new(),
        }
    }

    /// Asks the broker to write the message to disk (delivery mode 2).
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Sets the persistence flag explicitly.
    pub fn with_persistence(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Replaces the generated correlation id with a caller-supplied one.
    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = id.to_owned();
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// A message delivered by the broker to a consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    pub(crate) body: Vec<u8>,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) correlation_id: Option<String>,
    pub(crate) persistent: bool,
    pub(crate) redelivered: bool,
    pub(crate) headers: Headers,
}

impl InboundMessage {
    pub fn new(exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> InboundMessage {
        InboundMessage {
            body: body.into(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            ..Default::default()
        }
    }

    /// Builds the message a consumer would receive for `message` published to `exchange`.
    pub fn from_outbound(exchange: &str, message: &OutboundMessage) -> InboundMessage {
        InboundMessage {
            body: message.body.clone(),
            exchange: exchange.to_owned(),
            routing_key: message.routing_key.clone(),
            correlation_id: Some(message.correlation_id.clone()),
            persistent: message.persistent,
            redelivered: false,
            headers: message.headers.clone(),
        }
    }

    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn with_persistence(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn redelivered(mut self) -> Self {
        self.redelivered = true;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Number of times this message was already dead-lettered, 0 when unknown.
    pub fn attempt_count(&self) -> u32 {
        self.headers
            .get(HEADER_ATTEMPT_COUNT)
            .and_then(HeaderValue::as_int)
            .and_then(|count| u32::try_from(count).ok())
            .unwrap_or_default()
    }
}

/// A failed message together with the context needed to inspect or replay it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEnvelope {
    pub message: InboundMessage,
    pub original_exchange: String,
    pub original_routing_key: String,
    /// Correlation id the message was consumed with, if it had one
    pub original_correlation_id: Option<String>,
    pub failure_reason: String,
    /// Source chain of the consumer error, outermost first
    pub failure_causes: Vec<String>,
    pub attempt_count: u32,
}

impl DeadLetterEnvelope {
    /// Wraps `message`, counting this failure on top of any previous attempts.
    ///
    /// # Parameters
    /// * `message` - The message the consumer failed on
    /// * `original_exchange` - Exchange the message was consumed from
    /// * `original_routing_key` - Routing key the message was consumed with
    /// * `failure_reason` - Display text of the consumer error
    pub fn new(
        message: InboundMessage,
        original_exchange: &str,
        original_routing_key: &str,
        failure_reason: &str,
    ) -> DeadLetterEnvelope {
        let attempt_count = message.attempt_count().saturating_add(1);
        let original_correlation_id = message.correlation_id().map(str::to_owned).or_else(|| {
            message
                .headers
                .get(HEADER_ORIGINAL_CORRELATION_ID)
                .and_then(HeaderValue::as_str)
                .map(str::to_owned)
        });

        DeadLetterEnvelope {
            message,
            original_exchange: original_exchange.to_owned(),
            original_routing_key: original_routing_key.to_owned(),
            original_correlation_id,
            failure_reason: failure_reason.to_owned(),
            failure_causes: vec![],
            attempt_count,
        }
    }

    pub fn with_causes(mut self, causes: Vec<String>) -> Self {
        self.failure_causes = causes;
        self
    }

    /// Builds the persistent message republished to the error exchange.
    ///
    /// The original headers are kept; the diagnostic headers overwrite any
    /// values left over from a previous dead-lettering. The republish gets a
    /// fresh correlation id so it is confirmed independently of the original
    /// publish; the original id travels in `x-original-correlation-id`.
    pub fn to_outbound(&self, routing_key: &str) -> OutboundMessage {
        let mut message = OutboundMessage::new(routing_key, self.message.body.clone()).persistent();
        message.headers = self.message.headers.clone();
        message.headers.remove(HEADER_EXCEPTION_CAUSES);

        if let Some(id) = &self.original_correlation_id {
            message = message.header(HEADER_ORIGINAL_CORRELATION_ID, id.as_str());
        }

        if !self.failure_causes.is_empty() {
            message = message.header(HEADER_EXCEPTION_CAUSES, self.failure_causes.join("\n"));
        }

        message
            .header(HEADER_ORIGINAL_EXCHANGE, self.original_exchange.as_str())
            .header(HEADER_ORIGINAL_ROUTING_KEY, self.original_routing_key.as_str())
            .header(HEADER_EXCEPTION_MESSAGE, self.failure_reason.as_str())
            .header(HEADER_ATTEMPT_COUNT, i64::from(self.attempt_count))
    }

    /// Reads an envelope back from a message consumed off the error queue.
    ///
    /// Returns `None` when the message carries no dead-letter headers.
    pub fn from_inbound(message: &InboundMessage) -> Option<DeadLetterEnvelope> {
        let text = |key: &str| {
            message
                .headers
                .get(key)
                .and_then(HeaderValue::as_str)
                .map(str::to_owned)
        };

        Some(DeadLetterEnvelope {
            original_exchange: text(HEADER_ORIGINAL_EXCHANGE)?,
            original_routing_key: text(HEADER_ORIGINAL_ROUTING_KEY)?,
            original_correlation_id: text(HEADER_ORIGINAL_CORRELATION_ID),
            failure_reason: text(HEADER_EXCEPTION_MESSAGE)?,
            failure_causes: text(HEADER_EXCEPTION_CAUSES)
                .map(|causes| causes.lines().map(str::to_owned).collect())
                .unwrap_or_default(),
            attempt_count: message.attempt_count(),
            message: message.clone(),
        })
    }
}
