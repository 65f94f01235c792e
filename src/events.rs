// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Events
//!
//! Structured events describing terminal delivery outcomes. The core defines
//! the shape; where the events end up (logs, metrics, an alerting pipeline) is
//! decided by the [`EventSink`] handed to each component.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventKind {
    Confirmed,
    Rejected,
    TimedOut,
    DeadLettered,
    /// A failed message could not be dead-lettered and was dropped
    DeadLetterFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub detail: Option<String>,
}

impl DeliveryEvent {
    pub fn new(kind: EventKind, correlation_id: &str, detail: Option<String>) -> DeliveryEvent {
        DeliveryEvent {
            kind,
            correlation_id: correlation_id.to_owned(),
            timestamp: Utc::now(),
            detail,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Destination for delivery events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DeliveryEvent);
}

/// Writes every event to the `tracing` subscriber as a JSON payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DeliveryEvent) {
        info!(
            kind = ?event.kind,
            correlation_id = event.correlation_id,
            payload = event.to_json(),
            "delivery event"
        );
    }
}

impl EventSink for UnboundedSender<DeliveryEvent> {
    fn emit(&self, event: DeliveryEvent) {
        if self.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}
