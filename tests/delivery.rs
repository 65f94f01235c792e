// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use async_trait::async_trait;
use common::{drain_events, next_event, stack, ConfirmMode};
use rabbitmq_delivery::{
    AckDecision, ConfirmOutcome, DeadLetterEnvelope, DeliveryError, EventKind, HandlerError,
    InboundMessage, MessageHandler, OutboundMessage,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

const BODY: &str = "hello, spring amqp!";

struct AlwaysFails;

#[async_trait]
impl MessageHandler for AlwaysFails {
    async fn handle(&self, _message: &InboundMessage) -> Result<(), HandlerError> {
        Err("order service unavailable".into())
    }
}

#[derive(Default)]
struct Recorder {
    bodies: Mutex<Vec<String>>,
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        self.bodies
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(message.body()).into_owned());
        Ok(())
    }
}

#[tokio::test]
async fn persistent_publish_to_durable_queue_is_confirmed() {
    let mut stack = stack().await;

    let handle = stack
        .coordinator
        .publish(
            "simple.direct",
            OutboundMessage::new("simple", BODY).persistent(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    let correlation_id = handle.correlation_id().to_owned();

    assert_eq!(handle.wait().await, ConfirmOutcome::Confirmed);

    let confirmed = next_event(&mut stack.events, EventKind::Confirmed).await;
    assert_eq!(confirmed.correlation_id, correlation_id);
    assert!(drain_events(&mut stack.events)
        .iter()
        .all(|event| event.kind != EventKind::DeadLettered));

    let queued = stack.broker.drain("simple.queue");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].body(), BODY.as_bytes());
    assert!(queued[0].is_persistent());
}

#[tokio::test]
async fn persistent_publish_to_transient_queue_fails_before_sending() {
    let stack = stack().await;

    let result = stack
        .coordinator
        .publish(
            "",
            OutboundMessage::new("normal.queue", BODY).persistent(),
            Duration::from_secs(2),
        )
        .await;

    assert!(matches!(result, Err(DeliveryError::ConfigurationError(_))));
    assert!(stack.broker.published().is_empty());
    assert!(stack.coordinator.tracker().is_empty());
}

#[tokio::test]
async fn transient_publish_to_transient_queue_is_allowed() {
    let stack = stack().await;

    let handle = stack
        .coordinator
        .publish("", OutboundMessage::new("normal.queue", BODY), Duration::from_secs(2))
        .await
        .unwrap();

    assert!(handle.wait().await.is_confirmed());
}

#[tokio::test]
async fn failing_consumer_produces_one_dead_letter() {
    let mut stack = stack().await;
    let _subscription = stack
        .coordinator
        .register_consumer("simple.queue", Arc::new(AlwaysFails))
        .await
        .unwrap();

    let handle = stack
        .coordinator
        .publish(
            "simple.direct",
            OutboundMessage::new("simple", BODY)
                .persistent()
                .with_correlation_id("order-42"),
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert!(handle.wait().await.is_confirmed());

    let dead_lettered = next_event(&mut stack.events, EventKind::DeadLettered).await;
    assert_eq!(dead_lettered.correlation_id, "order-42");
    assert_eq!(dead_lettered.detail.as_deref(), Some("order service unavailable"));

    let errors = stack.broker.drain("error.queue");
    assert_eq!(errors.len(), 1);

    let envelope = DeadLetterEnvelope::from_inbound(&errors[0]).unwrap();
    assert_eq!(envelope.attempt_count, 1);
    assert!(!envelope.failure_reason.is_empty());
    assert_eq!(envelope.original_exchange, "simple.direct");
    assert_eq!(envelope.original_routing_key, "simple");
    assert_eq!(envelope.original_correlation_id.as_deref(), Some("order-42"));
    assert_eq!(envelope.failure_causes, vec!["order service unavailable"]);
    assert_eq!(envelope.message.body(), BODY.as_bytes());
    assert!(envelope.message.is_persistent());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        stack.broker.decisions(),
        vec![("simple.queue".to_owned(), AckDecision::Ack)]
    );
    assert!(drain_events(&mut stack.events)
        .iter()
        .all(|event| event.kind != EventKind::DeadLettered));
}

#[tokio::test]
async fn rejected_dead_letter_is_terminal() {
    let mut stack = stack().await;
    stack.broker.set_mode("error.direct", ConfirmMode::Nack);

    let _subscription = stack
        .coordinator
        .register_consumer("simple.queue", Arc::new(AlwaysFails))
        .await
        .unwrap();

    stack
        .coordinator
        .publish(
            "simple.direct",
            OutboundMessage::new("simple", BODY).with_correlation_id("order-42"),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

    let rejected = next_event(&mut stack.events, EventKind::Rejected).await;
    assert_eq!(rejected.detail.as_deref(), Some("rejected by broker"));

    let dropped = next_event(&mut stack.events, EventKind::DeadLetterFailed).await;
    assert_eq!(dropped.correlation_id, "order-42");
    assert!(dropped
        .detail
        .unwrap()
        .contains("order service unavailable"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stack.broker.published_to("error.direct"), 1);
    assert_eq!(
        stack.broker.decisions(),
        vec![(
            "simple.queue".to_owned(),
            AckDecision::Reject { requeue: false }
        )]
    );
    assert!(drain_events(&mut stack.events)
        .iter()
        .all(|event| event.kind != EventKind::DeadLettered));
}

#[tokio::test]
async fn successful_consumer_acks_without_dead_letters() {
    let mut stack = stack().await;
    let recorder = Arc::new(Recorder::default());
    let _subscription = stack
        .coordinator
        .register_consumer("simple.queue", recorder.clone())
        .await
        .unwrap();

    let handle = stack
        .coordinator
        .publish("simple.direct", OutboundMessage::new("simple", BODY), Duration::from_secs(2))
        .await
        .unwrap();
    assert!(handle.wait().await.is_confirmed());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*recorder.bodies.lock().unwrap(), vec![BODY.to_owned()]);
    assert_eq!(
        stack.broker.decisions(),
        vec![("simple.queue".to_owned(), AckDecision::Ack)]
    );
    assert_eq!(stack.broker.published_to("error.direct"), 0);
    assert!(drain_events(&mut stack.events)
        .iter()
        .all(|event| event.kind != EventKind::DeadLettered));
}

#[tokio::test]
async fn nacked_publish_is_reported_as_rejected() {
    let stack = stack().await;
    stack.broker.set_mode("simple.direct", ConfirmMode::Nack);

    let handle = stack
        .coordinator
        .publish("simple.direct", OutboundMessage::new("simple", BODY), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(
        handle.wait().await,
        ConfirmOutcome::Rejected(Some("rejected by broker".to_owned()))
    );
}

#[tokio::test(start_paused = true)]
async fn lost_confirm_times_out() {
    let mut stack = stack().await;
    stack.broker.set_mode("simple.direct", ConfirmMode::Silent);

    let handle = stack
        .coordinator
        .publish("simple.direct", OutboundMessage::new("simple", BODY), Duration::from_millis(300))
        .await
        .unwrap();
    let correlation_id = handle.correlation_id().to_owned();

    assert_eq!(handle.wait().await, ConfirmOutcome::TimedOut);

    let timed_out = next_event(&mut stack.events, EventKind::TimedOut).await;
    assert_eq!(timed_out.correlation_id, correlation_id);
    assert!(!stack.coordinator.tracker().resolve(&correlation_id, true, None));
}

#[tokio::test]
async fn pending_correlation_id_cannot_be_reused() {
    let stack = stack().await;
    stack.broker.set_mode("simple.direct", ConfirmMode::Silent);

    let message = OutboundMessage::new("simple", BODY).with_correlation_id("dup-1");
    let _first = stack
        .coordinator
        .publish("simple.direct", message.clone(), Duration::from_secs(2))
        .await
        .unwrap();

    let second = stack
        .coordinator
        .publish("simple.direct", message, Duration::from_secs(2))
        .await;

    assert!(matches!(
        second,
        Err(DeliveryError::DuplicateCorrelationError(ref id)) if id == "dup-1"
    ));
    assert_eq!(stack.broker.published_to("simple.direct"), 1);
}

#[tokio::test]
async fn install_declares_topology_once() {
    let stack = stack().await;

    stack.coordinator.install().await.unwrap();

    let mut exchanges = stack.broker.declared_exchanges();
    exchanges.sort();
    assert_eq!(exchanges, vec!["error.direct".to_owned(), "simple.direct".to_owned()]);
}

#[tokio::test]
async fn cancelled_publish_is_still_sent() {
    let mut stack = stack().await;

    let handle = stack
        .coordinator
        .publish("simple.direct", OutboundMessage::new("simple", BODY), Duration::from_secs(2))
        .await
        .unwrap();
    handle.cancel();

    next_event(&mut stack.events, EventKind::Confirmed).await;
    assert_eq!(stack.broker.drain("simple.queue").len(), 1);
}
