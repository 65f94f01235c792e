// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for Reliable Delivery
//!
//! This module provides the error taxonomy shared by the topology registry, the
//! confirmation tracker, the dead-letter router and the delivery coordinator.
//! Structural mistakes (duplicate names, unknown entities, durability
//! misconfiguration) are raised synchronously at the offending call. Nacks and
//! confirm timeouts are not errors: they are reported as
//! [`ConfirmOutcome`](crate::confirm::ConfirmOutcome) values.

use crate::topology::EntityKind;
use thiserror::Error;

/// Represents errors that can occur while declaring topology, publishing,
/// consuming or dead-lettering messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// An entity of the same kind and name was declared with different flags
    #[error("{kind} `{name}` is already declared with different flags")]
    DuplicateNameError { kind: EntityKind, name: String },

    /// A binding references an exchange or queue that was never declared
    #[error("unknown {kind} `{name}`")]
    UnknownEntityError { kind: EntityKind, name: String },

    /// Lookup of an undeclared entity
    #[error("{kind} `{name}` not found")]
    NotFoundError { kind: EntityKind, name: String },

    /// The correlation id is already awaiting a confirmation
    #[error("correlation id `{0}` is already awaiting confirmation")]
    DuplicateCorrelationError(String),

    /// A declaration or publish would silently lose data, or configuration is invalid
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Republishing a failed message to the error exchange did not succeed
    #[error("failure to dead-letter message `{correlation_id}`: {reason}")]
    DeadLetterFailureError {
        correlation_id: String,
        reason: String,
    },

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error switching the channel into publisher confirm mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error handing a message to the broker
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer on the broker
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}

impl From<config::ConfigError> for DeliveryError {
    fn from(err: config::ConfigError) -> Self {
        DeliveryError::ConfigurationError(err.to_string())
    }
}
