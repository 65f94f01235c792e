// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Coordinator
//!
//! Entry point for applications. The coordinator is built from already
//! constructed parts (broker, registry, tracker, dead-letter router) and
//! exposes the two operations applications need:
//!
//! - `publish`: validate persistence against the declared topology, send, and
//!   hand back a [`ConfirmHandle`] that resolves to `Confirmed`, `Rejected` or
//!   `TimedOut`;
//! - `register_consumer`: wrap a handler so that any processing error is
//!   dead-lettered before the delivery is acknowledged.

use crate::{
    broker::{AckDecision, Broker, DeliveryHandler, Subscription},
    confirm::{ConfirmHandle, ConfirmationTracker},
    dead_letter::DeadLetterRouter,
    errors::DeliveryError,
    message::{InboundMessage, OutboundMessage},
    otel,
    publisher::ConfirmingPublisher,
    topology::{EntityKind, EntityRegistry},
};
use async_trait::async_trait;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Error returned by application message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application callback processing consumed messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError>;
}

/// Publishes with confirms and consumes with dead-lettering.
pub struct DeliveryCoordinator {
    broker: Arc<dyn Broker>,
    registry: Arc<EntityRegistry>,
    publisher: ConfirmingPublisher,
    router: Arc<DeadLetterRouter>,
}

impl DeliveryCoordinator {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<EntityRegistry>,
        tracker: Arc<ConfirmationTracker>,
        router: Arc<DeadLetterRouter>,
    ) -> DeliveryCoordinator {
        DeliveryCoordinator {
            publisher: ConfirmingPublisher::new(broker.clone(), tracker),
            broker,
            registry,
            router,
        }
    }

    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<ConfirmationTracker> {
        self.publisher.tracker()
    }

    pub fn router(&self) -> &Arc<DeadLetterRouter> {
        &self.router
    }

    /// Declares the registered topology on the broker and checks that the
    /// dead-letter target is routable.
    pub async fn install(&self) -> Result<(), DeliveryError> {
        self.router.target().validate(&self.registry)?;
        self.registry.install(self.broker.as_ref()).await
    }

    /// Publishes `message` to `exchange` and returns a handle on its confirm.
    ///
    /// A persistent message routed to a queue known to be non-durable is
    /// refused with `ConfigurationError` before anything is sent.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, `""` for the default exchange
    /// * `message` - The message; its routing key and correlation id travel with it
    /// * `timeout` - How long the handle waits for the broker's confirm
    ///
    /// # Returns
    /// A [`ConfirmHandle`] resolving to exactly one of `Confirmed`, `Rejected`
    /// or `TimedOut`.
    pub async fn publish(
        &self,
        exchange: &str,
        message: OutboundMessage,
        timeout: Duration,
    ) -> Result<ConfirmHandle, DeliveryError> {
        if message.is_persistent() {
            let transient: Vec<String> = self
                .registry
                .route(exchange, message.routing_key())
                .into_iter()
                .filter(|queue| !queue.is_durable())
                .map(|queue| queue.name().to_owned())
                .collect();

            if !transient.is_empty() {
                error!(
                    exchange,
                    routing_key = message.routing_key(),
                    queues = ?transient,
                    "persistent message routed to non-durable queue"
                );
                return Err(DeliveryError::ConfigurationError(format!(
                    "persistent message to `{}` with key `{}` would be lost on restart by non-durable queue(s) {}",
                    exchange,
                    message.routing_key(),
                    transient.join(", ")
                )));
            }
        }

        self.publisher.send(exchange, message, timeout).await
    }

    /// Starts consuming `queue`, dead-lettering every message `handler` fails on.
    pub async fn register_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription, DeliveryError> {
        self.registry.resolve(queue, EntityKind::Queue)?;

        let wrapped = Arc::new(DeadLetteringHandler {
            queue: queue.to_owned(),
            inner: handler,
            router: self.router.clone(),
        });

        debug!(queue, "registering consumer");
        self.broker.consume(queue, wrapped).await
    }
}

/// Decides the acknowledgement of each delivery from the handler's result.
struct DeadLetteringHandler {
    queue: String,
    inner: Arc<dyn MessageHandler>,
    router: Arc<DeadLetterRouter>,
}

#[async_trait]
impl DeliveryHandler for DeadLetteringHandler {
    async fn deliver(&self, message: InboundMessage) -> AckDecision {
        let tracer = global::tracer("amqp consumer");
        let (_ctx, mut span) = otel::new_span(message.headers(), &tracer, &self.queue);

        debug!(
            "received: {} - exchange: {}",
            message.routing_key(),
            message.exchange()
        );

        let err = match self.inner.handle(&message).await {
            Ok(()) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                return AckDecision::Ack;
            }
            Err(err) => err,
        };

        let reason = err.to_string();
        warn!(
            queue = self.queue,
            correlation_id = message.correlation_id(),
            error = reason,
            "error whiling handling msg"
        );
        span.record_error(&*err);
        span.set_status(Status::Error {
            description: Cow::from(reason.clone()),
        });

        // a failure on the error queue itself must not be republished into it
        if self.queue == self.router.target().queue() {
            error!(queue = self.queue, "failure on the dead-letter queue");
            self.router.report_dropped(&message, &reason);
            return AckDecision::Reject { requeue: false };
        }

        match self
            .router
            .handle_error(&message, message.exchange(), message.routing_key(), &*err)
            .await
        {
            Ok(_) => AckDecision::Ack,
            Err(err) => {
                error!(error = err.to_string(), "message could not be dead-lettered");
                AckDecision::Reject { requeue: false }
            }
        }
    }
}
