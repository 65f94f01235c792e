// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::FutureExt;
use rabbitmq_delivery::{
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    AckDecision, Broker, Confirmation, ConfirmationTracker, DeadLetterRouter, DeadLetterTarget,
    DeliveryCoordinator, DeliveryError, DeliveryEvent, DeliveryHandler, EntityRegistry, EventKind,
    EventSink, InboundMessage, OutboundMessage, PendingConfirm, Subscription,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// How the fake broker answers publishes to an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmMode {
    Ack,
    Nack,
    Silent,
}

struct QueueSlot {
    tx: UnboundedSender<InboundMessage>,
    rx: Option<UnboundedReceiver<InboundMessage>>,
}

#[derive(Default)]
struct State {
    exchanges: Vec<ExchangeDefinition>,
    queues: HashMap<String, QueueSlot>,
    bindings: Vec<QueueBinding>,
    modes: HashMap<String, ConfirmMode>,
    published: Vec<(String, OutboundMessage)>,
}

/// Direct-routing broker kept in memory.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    decisions: Arc<Mutex<Vec<(String, AckDecision)>>>,
}

impl InMemoryBroker {
    pub fn new() -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::default())
    }

    pub fn set_mode(&self, exchange: &str, mode: ConfirmMode) {
        self.state
            .lock()
            .unwrap()
            .modes
            .insert(exchange.to_owned(), mode);
    }

    pub fn published(&self) -> Vec<(String, OutboundMessage)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn published_to(&self, exchange: &str) -> usize {
        self.published()
            .iter()
            .filter(|(ex, _)| ex == exchange)
            .count()
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .exchanges
            .iter()
            .map(|def| def.name().to_owned())
            .collect()
    }

    pub fn decisions(&self) -> Vec<(String, AckDecision)> {
        self.decisions.lock().unwrap().clone()
    }

    /// Removes and returns every message waiting in an unconsumed queue.
    pub fn drain(&self, queue: &str) -> Vec<InboundMessage> {
        let mut state = self.state.lock().unwrap();
        let mut drained = vec![];

        if let Some(rx) = state.queues.get_mut(queue).and_then(|slot| slot.rx.as_mut()) {
            while let Ok(message) = rx.try_recv() {
                drained.push(message);
            }
        }

        drained
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), DeliveryError> {
        self.state.lock().unwrap().exchanges.push(def.clone());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), DeliveryError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .unwrap()
            .queues
            .entry(def.name().to_owned())
            .or_insert(QueueSlot { tx, rx: Some(rx) });
        Ok(())
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), DeliveryError> {
        self.state.lock().unwrap().bindings.push(binding.clone());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        message: &OutboundMessage,
    ) -> Result<PendingConfirm, DeliveryError> {
        let mut state = self.state.lock().unwrap();
        state.published.push((exchange.to_owned(), message.clone()));

        let mode = state.modes.get(exchange).copied().unwrap_or(ConfirmMode::Ack);
        if mode == ConfirmMode::Nack {
            return Ok(async { Ok(Confirmation::Nack(Some("rejected by broker".to_owned()))) }.boxed());
        }

        let targets: Vec<String> = if exchange.is_empty() {
            vec![message.routing_key().to_owned()]
        } else {
            state
                .bindings
                .iter()
                .filter(|b| b.exchange_name() == exchange && b.key() == message.routing_key())
                .map(|b| b.queue_name().to_owned())
                .collect()
        };

        for queue in targets {
            if let Some(slot) = state.queues.get(&queue) {
                let _ = slot.tx.send(InboundMessage::from_outbound(exchange, message));
            }
        }

        match mode {
            ConfirmMode::Silent => Ok(futures_util::future::pending().boxed()),
            _ => Ok(async { Ok(Confirmation::Ack) }.boxed()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription, DeliveryError> {
        let mut rx = self
            .state
            .lock()
            .unwrap()
            .queues
            .get_mut(queue)
            .and_then(|slot| slot.rx.take())
            .ok_or_else(|| DeliveryError::ConsumerDeclarationError(queue.to_owned()))?;

        let decisions = self.decisions.clone();
        let name = queue.to_owned();
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let decision = handler.deliver(message).await;
                decisions.lock().unwrap().push((name.clone(), decision));
            }
        });

        Ok(Subscription::new(queue, task))
    }
}

pub struct Stack {
    pub broker: Arc<InMemoryBroker>,
    pub coordinator: DeliveryCoordinator,
    pub events: UnboundedReceiver<DeliveryEvent>,
}

/// `simple.direct` -> `simple.queue` via `simple`, plus the default error topology.
pub async fn stack() -> Stack {
    let broker = InMemoryBroker::new();
    let (tx, events) = mpsc::unbounded_channel();
    let sink: Arc<dyn EventSink> = Arc::new(tx);

    let registry = Arc::new(EntityRegistry::new());
    registry
        .declare(ExchangeDefinition::new("simple.direct").durable())
        .unwrap();
    registry
        .declare(QueueDefinition::new("simple.queue").durable())
        .unwrap();
    registry
        .declare(QueueDefinition::new("normal.queue"))
        .unwrap();
    registry
        .bind(
            QueueBinding::new("simple.queue")
                .exchange("simple.direct")
                .routing_key("simple"),
        )
        .unwrap();
    DeadLetterTarget::default().declare(&registry).unwrap();

    let tracker = ConfirmationTracker::new(Duration::from_secs(30), sink.clone());
    let router = DeadLetterRouter::new(
        broker.clone(),
        tracker.clone(),
        DeadLetterTarget::default(),
        Duration::from_secs(2),
        sink,
    );

    let coordinator = DeliveryCoordinator::new(broker.clone(), registry, tracker, router);
    coordinator.install().await.unwrap();

    Stack {
        broker,
        coordinator,
        events,
    }
}

/// Waits for the next event of `kind`, skipping others.
pub async fn next_event(events: &mut UnboundedReceiver<DeliveryEvent>, kind: EventKind) -> DeliveryEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if event.kind == kind {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub fn drain_events(events: &mut UnboundedReceiver<DeliveryEvent>) -> Vec<DeliveryEvent> {
    let mut drained = vec![];
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}
