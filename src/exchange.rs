// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are the routing entities messages are published to. Only direct
//! routing is modelled: a message reaches every queue bound with a routing key
//! exactly equal to the one it was published with.

use serde::Deserialize;

/// Name of the broker's default exchange, which routes to the queue named by
/// the routing key without any explicit binding.
pub const DEFAULT_EXCHANGE: &str = "";

/// Definition of a direct exchange.
///
/// Built with a small builder, e.g. `ExchangeDefinition::new("simple.direct").durable()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) durable: bool,
    #[serde(default)]
    pub(crate) auto_delete: bool,
}

impl ExchangeDefinition {
    /// Creates a new, non-durable exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            durable: false,
            auto_delete: false,
        }
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Deletes the exchange once the last queue is unbound from it.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
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
}
