// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of the AMQP connection and channel used by
//! [`AmqpBroker`](crate::amqp::AmqpBroker). The channel is switched into
//! publisher confirm mode so every publish is acknowledged by the broker.

use crate::{config::RabbitMqConfig, errors::DeliveryError};
use lapin::{
    options::ConfirmSelectOptions, types::LongString, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Connects to RabbitMQ and opens a channel with publisher confirms enabled.
///
/// # Example
/// ```ignore
/// let (conn, channel) = new_amqp_channel(&cfg.rabbitmq).await?;
/// ```
pub async fn new_amqp_channel(
    cfg: &RabbitMqConfig,
) -> Result<(Arc<Connection>, Arc<Channel>), DeliveryError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(DeliveryError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    let channel = match conn.create_channel().await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(DeliveryError::ChannelError)
        }
    }?;

    if let Err(err) = channel
        .confirm_select(ConfirmSelectOptions { nowait: false })
        .await
    {
        error!(error = err.to_string(), "error to enable publisher confirms");
        return Err(DeliveryError::ConfirmSelectError);
    }
    debug!("channel created in confirm mode");

    Ok((Arc::new(conn), Arc::new(channel)))
}
