// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Confirming Publisher
//!
//! The single publish path shared by the delivery coordinator and the
//! dead-letter router: register the correlation id with the tracker, hand the
//! message to the broker, and resolve the tracker entry when the broker's
//! confirm arrives. Trace context is propagated in the message headers.

use crate::{
    broker::{Broker, Confirmation},
    confirm::{ConfirmHandle, ConfirmationTracker},
    errors::DeliveryError,
    message::OutboundMessage,
    otel,
};
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

/// Publishes messages and wires the broker's confirm into the tracker.
#[derive(Clone)]
pub struct ConfirmingPublisher {
    broker: Arc<dyn Broker>,
    tracker: Arc<ConfirmationTracker>,
}

impl ConfirmingPublisher {
    pub fn new(broker: Arc<dyn Broker>, tracker: Arc<ConfirmationTracker>) -> ConfirmingPublisher {
        ConfirmingPublisher { broker, tracker }
    }

    pub fn tracker(&self) -> &Arc<ConfirmationTracker> {
        &self.tracker
    }

    /// Publishes `message` to `exchange`, returning a handle on its confirm.
    ///
    /// Fails with `DuplicateCorrelationError` when the correlation id is still
    /// awaiting a confirm, or with the broker's error when the message could
    /// not be handed over at all.
    pub async fn send(
        &self,
        exchange: &str,
        mut message: OutboundMessage,
        timeout: Duration,
    ) -> Result<ConfirmHandle, DeliveryError> {
        otel::inject(&Context::current(), &mut message.headers);

        let correlation_id = message.correlation_id().to_owned();
        let handle = self.tracker.track(&correlation_id, timeout)?;

        let confirm = match self.broker.publish(exchange, &message).await {
            Ok(confirm) => confirm,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange,
                    correlation_id,
                    "error publishing message"
                );
                self.tracker.discard(&correlation_id);
                return Err(err);
            }
        };

        debug!(
            exchange,
            routing_key = message.routing_key(),
            correlation_id,
            persistent = message.is_persistent(),
            "message sent, awaiting confirm"
        );

        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(Confirmation::Ack) => tracker.resolve(&correlation_id, true, None),
                Ok(Confirmation::Nack(reason)) => tracker.resolve(&correlation_id, false, reason),
                Err(err) => {
                    error!(error = err.to_string(), correlation_id, "confirm failed");
                    tracker.resolve(&correlation_id, false, Some(err.to_string()))
                }
            };
        });

        Ok(handle)
    }
}
