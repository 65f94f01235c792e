// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Startup configuration: broker connection settings, the flat table of
//! exchanges, queues and bindings, the dead-letter target, and confirm
//! timeouts. Loaded from a TOML file with `DELIVERY__*` environment overrides,
//! e.g. `DELIVERY__RABBITMQ__HOST=broker`.

use crate::{
    amqp::DEFAULT_PREFETCH_COUNT,
    broker::Broker,
    confirm::ConfirmationTracker,
    coordinator::DeliveryCoordinator,
    dead_letter::{DeadLetterRouter, DeadLetterTarget},
    errors::DeliveryError,
    events::EventSink,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    topology::EntityRegistry,
};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::{path::Path, sync::Arc, time::Duration};
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub rabbitmq: RabbitMqConfig,
    #[serde(default)]
    pub topology: TopologyConfig,
    #[serde(default)]
    pub dead_letter: DeadLetterTarget,
    #[serde(default)]
    pub confirm: ConfirmConfig,
}

/// Connection settings for the RabbitMQ server.
#[derive(Debug, Clone, Deserialize)]
pub struct RabbitMqConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_user")]
    pub password: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default = "default_connection_name")]
    pub connection_name: String,
    /// Unacked deliveries each consumer may hold
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
}

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    5672
}

fn default_user() -> String {
    "guest".to_owned()
}

fn default_vhost() -> String {
    "/".to_owned()
}

fn default_connection_name() -> String {
    "rabbitmq-delivery".to_owned()
}

fn default_prefetch_count() -> u16 {
    DEFAULT_PREFETCH_COUNT
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: default_user(),
            vhost: default_vhost(),
            connection_name: default_connection_name(),
            prefetch_count: default_prefetch_count(),
        }
    }
}

impl RabbitMqConfig {
    pub fn uri(&self) -> String {
        let vhost = if self.vhost == "/" { "%2f" } else { &self.vhost };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

/// Flat table of topology declarations.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologyConfig {
    #[serde(default)]
    pub exchanges: Vec<ExchangeDefinition>,
    #[serde(default)]
    pub queues: Vec<QueueDefinition>,
    #[serde(default)]
    pub bindings: Vec<QueueBinding>,
}

impl TopologyConfig {
    /// Registers every declaration, bindings last.
    pub fn apply(&self, registry: &EntityRegistry) -> Result<(), DeliveryError> {
        for exchange in &self.exchanges {
            registry.declare_exchange(exchange.clone())?;
        }

        for queue in &self.queues {
            registry.declare_queue(queue.clone())?;
        }

        for binding in &self.bindings {
            registry.bind(binding.clone())?;
        }

        Ok(())
    }
}

/// Publisher confirm timing.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmConfig {
    /// How long a publish waits for the broker's confirm
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// How long resolved entries are kept after their deadline
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Interval of the background sweep
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_grace_ms() -> u64 {
    30_000
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

impl Default for ConfirmConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            grace_ms: default_grace_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl ConfirmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Builds a tracker with the configured grace period and starts its
    /// background sweep. The sweep stops once the tracker is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn tracker(&self, events: Arc<dyn EventSink>) -> Arc<ConfirmationTracker> {
        let tracker = ConfirmationTracker::new(self.grace(), events);
        tracker.spawn_sweeper(self.sweep_interval());

        tracker
    }
}

impl DeliveryConfig {
    /// Loads `path` (optional) and applies `DELIVERY__*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<DeliveryConfig, DeliveryError> {
        debug!(path = %path.as_ref().display(), "loading delivery configuration");

        let cfg = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix("DELIVERY").separator("__"))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Parses configuration from a TOML document.
    pub fn from_toml(raw: &str) -> Result<DeliveryConfig, DeliveryError> {
        let cfg = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    /// Builds a registry holding the configured topology and the dead-letter
    /// target, and checks that the target is routable.
    pub fn registry(&self) -> Result<Arc<EntityRegistry>, DeliveryError> {
        let registry = EntityRegistry::new();

        self.topology.apply(&registry)?;
        self.dead_letter.declare(&registry)?;
        self.dead_letter.validate(&registry)?;

        Ok(Arc::new(registry))
    }

    /// Wires a coordinator from this configuration.
    ///
    /// # Parameters
    /// * `broker` - Broker the topology is installed on and messages flow through
    /// * `events` - Sink receiving every delivery event
    ///
    /// # Returns
    /// A coordinator whose tracker is swept in the background and whose
    /// dead-letter router waits `confirm.timeout_ms` for republish confirms.
    /// The topology is not installed yet; call
    /// [`install`](DeliveryCoordinator::install) next.
    pub fn coordinator(
        &self,
        broker: Arc<dyn Broker>,
        events: Arc<dyn EventSink>,
    ) -> Result<DeliveryCoordinator, DeliveryError> {
        let registry = self.registry()?;
        let tracker = self.confirm.tracker(events.clone());
        let router = DeadLetterRouter::new(
            broker.clone(),
            tracker.clone(),
            self.dead_letter.clone(),
            self.confirm.timeout(),
            events,
        );

        Ok(DeliveryCoordinator::new(broker, registry, tracker, router))
    }
}
