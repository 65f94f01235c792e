// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Collaborator
//!
//! The delivery core never talks to RabbitMQ directly. Everything it needs from
//! a broker is expressed by the [`Broker`] trait: declaring topology, publishing
//! with an asynchronous confirm, and consuming with a callback that decides how
//! each delivery is acknowledged. [`AmqpBroker`](crate::amqp::AmqpBroker) is the
//! lapin-backed implementation.

use crate::{
    errors::DeliveryError,
    exchange::ExchangeDefinition,
    message::{InboundMessage, OutboundMessage},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::{fmt, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Broker answer to a publish in confirm mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack(Option<String>),
}

/// Future resolving once the broker confirms (or fails to confirm) a publish.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, DeliveryError>>;

/// How a consumed message is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Reject { requeue: bool },
}

/// Callback invoked by a broker for every delivery on a consumed queue.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn deliver(&self, message: InboundMessage) -> AckDecision;
}

/// Operations the delivery core consumes from a message broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), DeliveryError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), DeliveryError>;

    async fn bind(&self, binding: &QueueBinding) -> Result<(), DeliveryError>;

    /// Hands `message` to the broker. The returned future resolves with the
    /// broker's confirm; an `Err` here means the message never left.
    async fn publish(
        &self,
        exchange: &str,
        message: &OutboundMessage,
    ) -> Result<PendingConfirm, DeliveryError>;

    /// Starts delivering messages from `queue` to `handler`.
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription, DeliveryError>;
}

/// Future that stops a consumer on the broker side.
pub type CancelConsumer = BoxFuture<'static, Result<(), DeliveryError>>;

/// Handle on a running consumer.
pub struct Subscription {
    consumer_tag: String,
    task: JoinHandle<()>,
    cancel: Option<CancelConsumer>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_tag", &self.consumer_tag)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl Subscription {
    pub fn new(consumer_tag: &str, task: JoinHandle<()>) -> Subscription {
        Subscription {
            consumer_tag: consumer_tag.to_owned(),
            task,
            cancel: None,
        }
    }

    /// Sets the broker-side cancellation run by [`cancel`](Self::cancel).
    pub fn with_cancel(mut self, cancel: CancelConsumer) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the consumer.
    ///
    /// With a broker-side cancellation, the broker stops delivering first and
    /// the dispatch task is left to settle the deliveries it already holds
    /// before its stream ends. Without one, the dispatch task is aborted.
    ///
    /// # Returns
    /// The broker's error when the consumer could not be cancelled; the
    /// dispatch task is aborted in that case.
    pub async fn cancel(self) -> Result<(), DeliveryError> {
        debug!(consumer_tag = self.consumer_tag, "cancelling consumer");

        let Some(cancel) = self.cancel else {
            self.task.abort();
            return Ok(());
        };

        if let Err(err) = cancel.await {
            error!(
                error = err.to_string(),
                consumer_tag = self.consumer_tag,
                "failure to cancel consumer"
            );
            self.task.abort();
            return Err(err);
        }

        if let Err(err) = self.task.await {
            warn!(error = err.to_string(), "consumer task ended abnormally");
        }

        Ok(())
    }
}
