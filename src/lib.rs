// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable message delivery over RabbitMQ: publisher confirms tracked per
//! correlation id, consumer failures republished to a single error exchange,
//! and a topology registry that refuses persistence settings that would lose
//! messages on a broker restart.

mod otel;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod config;
pub mod confirm;
pub mod coordinator;
pub mod dead_letter;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use broker::{AckDecision, Broker, Confirmation, DeliveryHandler, PendingConfirm, Subscription};
pub use confirm::{ConfirmHandle, ConfirmOutcome, ConfirmState, ConfirmationTracker};
pub use coordinator::{DeliveryCoordinator, HandlerError, MessageHandler};
pub use dead_letter::{DeadLetterRouter, DeadLetterTarget};
pub use errors::DeliveryError;
pub use events::{DeliveryEvent, EventKind, EventSink, TracingEventSink};
pub use message::{DeadLetterEnvelope, HeaderValue, Headers, InboundMessage, OutboundMessage};
pub use topology::{Entity, EntityKind, EntityRegistry};
