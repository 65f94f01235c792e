// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Registry
//!
//! This module keeps the logical topology an application relies on: exchanges,
//! queues, the bindings between them and each entity's durability flags. It is
//! populated at startup, read on every publish, and installed on the broker
//! once.
//!
//! The main components are:
//! - `Entity` / `EntityKind`: a declared exchange or queue
//! - `EntityRegistry`: validated, concurrent storage of the topology

use crate::{
    broker::Broker,
    errors::DeliveryError,
    exchange::{ExchangeDefinition, DEFAULT_EXCHANGE},
    queue::{QueueBinding, QueueDefinition},
};
use dashmap::{mapref::entry::Entry, DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Exchange,
    Queue,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Exchange => write!(f, "exchange"),
            EntityKind::Queue => write!(f, "queue"),
        }
    }
}

/// A declared exchange or queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entity {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Exchange(_) => EntityKind::Exchange,
            Entity::Queue(_) => EntityKind::Queue,
        }
    }

    /// Unique name within the entity's kind.
    pub fn name(&self) -> &str {
        match self {
            Entity::Exchange(def) => def.name(),
            Entity::Queue(def) => def.name(),
        }
    }

    pub fn is_durable(&self) -> bool {
        match self {
            Entity::Exchange(def) => def.is_durable(),
            Entity::Queue(def) => def.is_durable(),
        }
    }

    pub fn is_auto_delete(&self) -> bool {
        match self {
            Entity::Exchange(def) => def.is_auto_delete(),
            Entity::Queue(def) => def.is_auto_delete(),
        }
    }
}

impl From<ExchangeDefinition> for Entity {
    fn from(def: ExchangeDefinition) -> Self {
        Entity::Exchange(def)
    }
}

impl From<QueueDefinition> for Entity {
    fn from(def: QueueDefinition) -> Self {
        Entity::Queue(def)
    }
}

/// Registry of declared exchanges, queues and bindings.
///
/// Each kind lives in its own sharded map, so lookups on the publish path do
/// not contend with each other or with late declarations.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    exchanges: DashMap<String, ExchangeDefinition>,
    queues: DashMap<String, QueueDefinition>,
    bindings: DashMap<(String, String, String), QueueBinding>,
    installed: DashSet<(EntityKind, String)>,
    installed_bindings: DashSet<(String, String, String)>,
}

impl EntityRegistry {
    pub fn new() -> EntityRegistry {
        EntityRegistry::default()
    }

    /// Declares an exchange or a queue.
    ///
    /// Re-declaring an identical entity is a no-op; the same name with
    /// different flags fails with `DuplicateNameError`.
    pub fn declare(&self, entity: impl Into<Entity>) -> Result<(), DeliveryError> {
        match entity.into() {
            Entity::Exchange(def) => self.declare_exchange(def),
            Entity::Queue(def) => self.declare_queue(def),
        }
    }

    pub fn declare_exchange(&self, def: ExchangeDefinition) -> Result<(), DeliveryError> {
        match self.exchanges.entry(def.name.clone()) {
            Entry::Occupied(existing) if *existing.get() == def => {
                debug!(name = def.name, "exchange already declared");
                Ok(())
            }
            Entry::Occupied(_) => {
                error!(name = def.name, "exchange redeclared with different flags");
                Err(DeliveryError::DuplicateNameError {
                    kind: EntityKind::Exchange,
                    name: def.name,
                })
            }
            Entry::Vacant(slot) => {
                debug!(name = def.name, durable = def.durable, "exchange declared");
                slot.insert(def);
                Ok(())
            }
        }
    }

    pub fn declare_queue(&self, def: QueueDefinition) -> Result<(), DeliveryError> {
        match self.queues.entry(def.name.clone()) {
            Entry::Occupied(existing) if *existing.get() == def => {
                debug!(name = def.name, "queue already declared");
                Ok(())
            }
            Entry::Occupied(_) => {
                error!(name = def.name, "queue redeclared with different flags");
                Err(DeliveryError::DuplicateNameError {
                    kind: EntityKind::Queue,
                    name: def.name,
                })
            }
            Entry::Vacant(slot) => {
                debug!(name = def.name, durable = def.durable, "queue declared");
                slot.insert(def);
                Ok(())
            }
        }
    }

    /// Binds a declared queue to a declared exchange.
    ///
    /// A durable exchange may only feed a non-durable queue when the binding
    /// accepts that the queue's messages are lost on broker restart.
    ///
    /// # Parameters
    /// * `binding` - Queue, exchange and routing key to bind
    ///
    /// # Returns
    /// `UnknownEntityError` when either side was never declared,
    /// `ConfigurationError` on a durability mismatch, Ok otherwise. Binding
    /// the same triple twice is a no-op.
    pub fn bind(&self, binding: QueueBinding) -> Result<(), DeliveryError> {
        let exchange_durable = match self.exchanges.get(&binding.exchange_name) {
            Some(exchange) => exchange.durable,
            None => {
                return Err(DeliveryError::UnknownEntityError {
                    kind: EntityKind::Exchange,
                    name: binding.exchange_name,
                })
            }
        };

        let queue_durable = match self.queues.get(&binding.queue_name) {
            Some(queue) => queue.durable,
            None => {
                return Err(DeliveryError::UnknownEntityError {
                    kind: EntityKind::Queue,
                    name: binding.queue_name,
                })
            }
        };

        if exchange_durable && !queue_durable && !binding.accept_data_loss {
            error!(
                exchange = binding.exchange_name,
                queue = binding.queue_name,
                "durable exchange bound to a transient queue"
            );
            return Err(DeliveryError::ConfigurationError(format!(
                "durable exchange `{}` bound to non-durable queue `{}` loses messages on restart",
                binding.exchange_name, binding.queue_name
            )));
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );
        self.bindings.entry(binding.triple()).or_insert(binding);

        Ok(())
    }

    /// Looks up a declared entity.
    pub fn resolve(&self, name: &str, kind: EntityKind) -> Result<Entity, DeliveryError> {
        let found = match kind {
            EntityKind::Exchange => self.exchanges.get(name).map(|def| Entity::Exchange(def.value().clone())),
            EntityKind::Queue => self.queues.get(name).map(|def| Entity::Queue(def.value().clone())),
        };

        found.ok_or_else(|| DeliveryError::NotFoundError {
            kind,
            name: name.to_owned(),
        })
    }

    /// Queues a message published to `exchange` with `routing_key` would reach.
    ///
    /// The default exchange routes to the queue named by the routing key.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Vec<QueueDefinition> {
        if exchange == DEFAULT_EXCHANGE {
            return self
                .queues
                .get(routing_key)
                .map(|queue| vec![queue.value().clone()])
                .unwrap_or_default();
        }

        self.bindings
            .iter()
            .filter(|binding| binding.exchange_name == exchange && binding.routing_key == routing_key)
            .filter_map(|binding| {
                self.queues
                    .get(&binding.queue_name)
                    .map(|queue| queue.value().clone())
            })
            .collect()
    }

    pub fn has_binding(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.bindings.contains_key(&(
            exchange.to_owned(),
            queue.to_owned(),
            routing_key.to_owned(),
        ))
    }

    /// Declares every registered entity on the broker.
    ///
    /// Exchanges go first, then queues, then bindings. An entity reaches the
    /// broker once, however many times `install` is called.
    pub async fn install(&self, broker: &dyn Broker) -> Result<(), DeliveryError> {
        self.install_exchanges(broker).await?;
        self.install_queues(broker).await?;
        self.install_bindings(broker).await
    }

    async fn install_exchanges(&self, broker: &dyn Broker) -> Result<(), DeliveryError> {
        let pending: Vec<ExchangeDefinition> = self
            .exchanges
            .iter()
            .filter(|def| !self.installed.contains(&(EntityKind::Exchange, def.name.clone())))
            .map(|def| def.value().clone())
            .collect();

        for exch in pending {
            debug!("creating exchange: {}", exch.name);
            broker.declare_exchange(&exch).await?;
            self.installed.insert((EntityKind::Exchange, exch.name.clone()));
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self, broker: &dyn Broker) -> Result<(), DeliveryError> {
        let pending: Vec<QueueDefinition> = self
            .queues
            .iter()
            .filter(|def| !self.installed.contains(&(EntityKind::Queue, def.name.clone())))
            .map(|def| def.value().clone())
            .collect();

        for queue in pending {
            debug!("creating queue: {}", queue.name);
            broker.declare_queue(&queue).await?;
            self.installed.insert((EntityKind::Queue, queue.name.clone()));
            debug!("queue: {} was created", queue.name);
        }

        Ok(())
    }

    async fn install_bindings(&self, broker: &dyn Broker) -> Result<(), DeliveryError> {
        let pending: Vec<QueueBinding> = self
            .bindings
            .iter()
            .filter(|binding| !self.installed_bindings.contains(&binding.triple()))
            .map(|binding| binding.value().clone())
            .collect();

        for binding in pending {
            broker.bind(&binding).await?;
            self.installed_bindings.insert(binding.triple());
        }

        debug!("queues were bound");

        Ok(())
    }
}
