// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead-Letter Routing
//!
//! When a consumer fails to process a message, the message is wrapped in a
//! [`DeadLetterEnvelope`] and republished to one fixed error exchange under one
//! fixed routing key, so every failure ends up in a single inspectable queue.
//! The republish goes through the same confirming publish path as any other
//! message. A republish that is not confirmed is terminal for the message: the
//! router reports it and never tries to dead-letter its own failure.

use crate::{
    broker::Broker,
    confirm::{ConfirmOutcome, ConfirmationTracker},
    errors::DeliveryError,
    events::{DeliveryEvent, EventKind, EventSink},
    exchange::ExchangeDefinition,
    message::{DeadLetterEnvelope, HeaderValue, InboundMessage, HEADER_ORIGINAL_CORRELATION_ID},
    publisher::ConfirmingPublisher,
    queue::{QueueBinding, QueueDefinition},
    topology::{EntityKind, EntityRegistry},
};
use serde::Deserialize;
use std::{error::Error, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

pub const DEFAULT_ERROR_EXCHANGE: &str = "error.direct";
pub const DEFAULT_ERROR_QUEUE: &str = "error.queue";
pub const DEFAULT_ERROR_ROUTING_KEY: &str = "error";

const UNKNOWN_FAILURE: &str = "unknown failure";

/// Where failed messages are republished.
///
/// The exchange, queue and routing key are one value: they are declared
/// together and validated together, so the routing key used to republish is
/// always the one the error queue is bound with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeadLetterTarget {
    exchange: String,
    queue: String,
    routing_key: String,
}

impl Default for DeadLetterTarget {
    fn default() -> Self {
        DeadLetterTarget {
            exchange: DEFAULT_ERROR_EXCHANGE.to_owned(),
            queue: DEFAULT_ERROR_QUEUE.to_owned(),
            routing_key: DEFAULT_ERROR_ROUTING_KEY.to_owned(),
        }
    }
}

impl DeadLetterTarget {
    pub fn new(exchange: &str, queue: &str, routing_key: &str) -> Result<DeadLetterTarget, DeliveryError> {
        let target = DeadLetterTarget {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
        };
        target.check()?;

        Ok(target)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Registers the durable error exchange, the durable error queue and the
    /// binding between them.
    pub fn declare(&self, registry: &EntityRegistry) -> Result<(), DeliveryError> {
        self.check()?;

        registry.declare_exchange(ExchangeDefinition::new(&self.exchange).durable())?;
        registry.declare_queue(QueueDefinition::new(&self.queue).durable())?;
        registry.bind(
            QueueBinding::new(&self.queue)
                .exchange(&self.exchange)
                .routing_key(&self.routing_key),
        )
    }

    /// Checks that the registry routes `routing_key` from the error exchange
    /// into the error queue.
    pub fn validate(&self, registry: &EntityRegistry) -> Result<(), DeliveryError> {
        self.check()?;

        registry
            .resolve(&self.exchange, EntityKind::Exchange)
            .map_err(|_| self.misconfigured("error exchange is not declared"))?;
        registry
            .resolve(&self.queue, EntityKind::Queue)
            .map_err(|_| self.misconfigured("error queue is not declared"))?;

        if !registry.has_binding(&self.exchange, &self.queue, &self.routing_key) {
            return Err(self.misconfigured("routing key does not bind the error queue"));
        }

        Ok(())
    }

    fn check(&self) -> Result<(), DeliveryError> {
        if self.exchange.is_empty() || self.queue.is_empty() || self.routing_key.is_empty() {
            return Err(self.misconfigured("exchange, queue and routing key must be set"));
        }

        Ok(())
    }

    fn misconfigured(&self, reason: &str) -> DeliveryError {
        DeliveryError::ConfigurationError(format!(
            "dead-letter target {} -> {} via `{}`: {}",
            self.exchange, self.queue, self.routing_key, reason
        ))
    }
}

/// Republishes failed messages to the dead-letter target.
pub struct DeadLetterRouter {
    publisher: ConfirmingPublisher,
    target: DeadLetterTarget,
    confirm_timeout: Duration,
    events: Arc<dyn EventSink>,
}

impl DeadLetterRouter {
    pub fn new(
        broker: Arc<dyn Broker>,
        tracker: Arc<ConfirmationTracker>,
        target: DeadLetterTarget,
        confirm_timeout: Duration,
        events: Arc<dyn EventSink>,
    ) -> Arc<DeadLetterRouter> {
        Arc::new(DeadLetterRouter {
            publisher: ConfirmingPublisher::new(broker, tracker),
            target,
            confirm_timeout,
            events,
        })
    }

    pub fn target(&self) -> &DeadLetterTarget {
        &self.target
    }

    /// Republishes `message` to the error exchange and waits for the confirm.
    ///
    /// # Parameters
    /// * `message` - The delivery the consumer failed on
    /// * `original_exchange` - Exchange the delivery came from
    /// * `original_routing_key` - Routing key the delivery came with
    /// * `error` - Why the consumer failed; blank text is recorded as "unknown failure"
    ///
    /// # Returns
    /// The envelope that was published. Any failure to get the republish
    /// confirmed is a `DeadLetterFailureError`, reported as a `DeadLetterFailed`
    /// event keyed by the message's correlation id.
    pub async fn handle_failure(
        &self,
        message: &InboundMessage,
        original_exchange: &str,
        original_routing_key: &str,
        error: &str,
    ) -> Result<DeadLetterEnvelope, DeliveryError> {
        let reason = if error.trim().is_empty() {
            UNKNOWN_FAILURE
        } else {
            error
        };

        let envelope = DeadLetterEnvelope::new(
            message.clone(),
            original_exchange,
            original_routing_key,
            reason,
        );

        self.republish(envelope).await
    }

    /// Same as [`handle_failure`](Self::handle_failure), recording the whole
    /// source chain of `error` in the `x-exception-causes` header.
    pub async fn handle_error(
        &self,
        message: &InboundMessage,
        original_exchange: &str,
        original_routing_key: &str,
        error: &(dyn Error + Send + Sync + 'static),
    ) -> Result<DeadLetterEnvelope, DeliveryError> {
        let causes = source_chain(error);

        let envelope = DeadLetterEnvelope::new(
            message.clone(),
            original_exchange,
            original_routing_key,
            &causes[0],
        )
        .with_causes(causes);

        self.republish(envelope).await
    }

    /// Reports a failed message that is dropped without a dead-letter copy.
    pub fn report_dropped(&self, message: &InboundMessage, reason: &str) {
        let correlation_id = message
            .headers()
            .get(HEADER_ORIGINAL_CORRELATION_ID)
            .and_then(HeaderValue::as_str)
            .or(message.correlation_id())
            .unwrap_or_default();

        error!(correlation_id, reason, "dropping failed message");
        self.events.emit(DeliveryEvent::new(
            EventKind::DeadLetterFailed,
            correlation_id,
            Some(reason.to_owned()),
        ));
    }

    async fn republish(&self, envelope: DeadLetterEnvelope) -> Result<DeadLetterEnvelope, DeliveryError> {
        let outbound = envelope.to_outbound(&self.target.routing_key);
        let correlation_id = envelope
            .original_correlation_id
            .clone()
            .unwrap_or_else(|| outbound.correlation_id().to_owned());

        warn!(
            correlation_id,
            attempt = envelope.attempt_count,
            reason = envelope.failure_reason,
            "sending failed message to {}",
            self.target.exchange
        );

        let handle = match self
            .publisher
            .send(&self.target.exchange, outbound, self.confirm_timeout)
            .await
        {
            Ok(handle) => handle,
            Err(err) => return Err(self.failed(&correlation_id, &envelope, err.to_string())),
        };

        match handle.wait().await {
            ConfirmOutcome::Confirmed => {
                debug!(correlation_id, "failed message dead-lettered");
                self.events.emit(DeliveryEvent::new(
                    EventKind::DeadLettered,
                    &correlation_id,
                    Some(envelope.failure_reason.clone()),
                ));
                Ok(envelope)
            }
            ConfirmOutcome::Rejected(why) => Err(self.failed(
                &correlation_id,
                &envelope,
                format!("republish rejected: {}", why.unwrap_or_default()),
            )),
            ConfirmOutcome::TimedOut => Err(self.failed(
                &correlation_id,
                &envelope,
                "republish confirm timed out".to_owned(),
            )),
        }
    }

    fn failed(&self, correlation_id: &str, envelope: &DeadLetterEnvelope, reason: String) -> DeliveryError {
        error!(correlation_id, reason, "failure to dead-letter message");
        self.events.emit(DeliveryEvent::new(
            EventKind::DeadLetterFailed,
            correlation_id,
            Some(format!("{}; consumer error: {}", reason, envelope.failure_reason)),
        ));

        DeliveryError::DeadLetterFailureError {
            correlation_id: correlation_id.to_owned(),
            reason,
        }
    }
}

fn source_chain(error: &(dyn Error + 'static)) -> Vec<String> {
    let mut causes = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }

    causes
}
