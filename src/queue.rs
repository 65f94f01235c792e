// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions and Bindings
//!
//! This module provides the queue half of the topology: queue definitions with
//! their durability flags and optional broker arguments, and the bindings that
//! connect a direct exchange to a queue under a routing key.

use crate::message::{HeaderValue, Headers};
use serde::Deserialize;

/// Queue argument switching a queue to lazy mode (messages kept on disk)
pub const AMQP_ARGS_QUEUE_MODE: &str = "x-queue-mode";
/// Queue argument for message TTL in milliseconds
pub const AMQP_ARGS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument for the maximum number of ready messages
pub const AMQP_ARGS_MAX_LENGTH: &str = "x-max-length";

/// Definition of a queue with its configuration parameters.
///
/// Durable queues survive a broker restart. Only persistent messages held in a
/// durable queue survive it too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueDefinition {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) durable: bool,
    #[serde(default)]
    pub(crate) auto_delete: bool,
    #[serde(default)]
    pub(crate) lazy: bool,
    #[serde(default)]
    pub(crate) ttl: Option<i32>,
    #[serde(default)]
    pub(crate) max_length: Option<i32>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is non-durable, not auto-deleted and has no arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            auto_delete: false,
            lazy: false,
            ttl: None,
            max_length: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the queue once its last consumer is cancelled.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Keeps messages on disk and loads them into memory only on delivery.
    ///
    /// Lazy queues trade latency for a flat memory profile when millions of
    /// messages pile up.
    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.auto_delete
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    /// Broker arguments derived from the optional queue settings.
    pub fn arguments(&self) -> Headers {
        let mut args = Headers::new();

        if self.lazy {
            args.insert(
                AMQP_ARGS_QUEUE_MODE.to_owned(),
                HeaderValue::Str("lazy".to_owned()),
            );
        }

        if let Some(ttl) = self.ttl {
            args.insert(
                AMQP_ARGS_MESSAGE_TTL.to_owned(),
                HeaderValue::Int(i64::from(ttl)),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                AMQP_ARGS_MAX_LENGTH.to_owned(),
                HeaderValue::Int(i64::from(max)),
            );
        }

        args
    }
}

/// Binding of a queue to a direct exchange under a routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct QueueBinding {
    #[serde(rename = "queue")]
    pub(crate) queue_name: String,
    #[serde(rename = "exchange")]
    pub(crate) exchange_name: String,
    #[serde(default)]
    pub(crate) routing_key: String,
    #[serde(default)]
    pub(crate) accept_data_loss: bool,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// The exchange name and routing key start empty and are set with
    /// [`exchange`](Self::exchange) and [`routing_key`](Self::routing_key).
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
            accept_data_loss: false,
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Acknowledges that messages routed by a durable exchange into a
    /// non-durable queue are lost when the broker restarts.
    pub fn accept_data_loss(mut self) -> Self {
        self.accept_data_loss = true;
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }

    pub(crate) fn triple(&self) -> (String, String, String) {
        (
            self.exchange_name.clone(),
            self.queue_name.clone(),
            self.routing_key.clone(),
        )
    }
}
