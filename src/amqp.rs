// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker
//!
//! [`Broker`] implementation over a lapin channel in publisher confirm mode.
//! Publishes are sent as mandatory so that an unroutable message comes back as
//! a rejection instead of vanishing. Consumers run on a spawned task and settle
//! every delivery according to the handler's [`AckDecision`]; each consumer is
//! limited by a prefetch count and is cancelled on the broker when its
//! [`Subscription`] is cancelled.

use crate::{
    broker::{AckDecision, Broker, Confirmation, DeliveryHandler, PendingConfirm, Subscription},
    channel::new_amqp_channel,
    config::RabbitMqConfig,
    errors::DeliveryError,
    exchange::ExchangeDefinition,
    message::{HeaderValue, Headers, InboundMessage, OutboundMessage, HEADER_ATTEMPT_COUNT},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    publisher_confirm::Confirmation as AmqpConfirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ExchangeKind,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Content type set on every published message
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Unacked deliveries a consumer may hold when no prefetch is configured
pub const DEFAULT_PREFETCH_COUNT: u16 = 10;

/// RabbitMQ implementation of the [`Broker`] trait.
pub struct AmqpBroker {
    channel: Arc<Channel>,
    prefetch_count: u16,
}

impl AmqpBroker {
    /// Wraps a channel created by [`new_amqp_channel`](crate::channel::new_amqp_channel).
    pub fn new(channel: Arc<Channel>) -> Arc<AmqpBroker> {
        AmqpBroker::with_prefetch(channel, DEFAULT_PREFETCH_COUNT)
    }

    /// Wraps `channel`, limiting each consumer to `prefetch_count` unacked deliveries.
    pub fn with_prefetch(channel: Arc<Channel>, prefetch_count: u16) -> Arc<AmqpBroker> {
        Arc::new(AmqpBroker {
            channel,
            prefetch_count,
        })
    }

    /// Connects to RabbitMQ and wraps a confirm-mode channel.
    ///
    /// # Parameters
    /// * `cfg` - Connection settings, including the consumer prefetch
    ///
    /// # Returns
    /// The connection, which must be kept alive for as long as the broker is
    /// used, and the broker itself.
    pub async fn connect(
        cfg: &RabbitMqConfig,
    ) -> Result<(Arc<Connection>, Arc<AmqpBroker>), DeliveryError> {
        let (conn, channel) = new_amqp_channel(cfg).await?;

        Ok((conn, AmqpBroker::with_prefetch(channel, cfg.prefetch_count)))
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), DeliveryError> {
        match self
            .channel
            .exchange_declare(
                def.name(),
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    auto_delete: def.is_auto_delete(),
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                Err(DeliveryError::DeclareExchangeError(def.name().to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), DeliveryError> {
        match self
            .channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    exclusive: false,
                    auto_delete: def.is_auto_delete(),
                    nowait: false,
                },
                to_field_table(&def.arguments()),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                Err(DeliveryError::DeclareQueueError(def.name().to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), DeliveryError> {
        match self
            .channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(DeliveryError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue_name().to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn publish(
        &self,
        exchange: &str,
        message: &OutboundMessage,
    ) -> Result<PendingConfirm, DeliveryError> {
        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                message.routing_key(),
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                message.body(),
                properties(message),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(DeliveryError::PublishingError(err.to_string()))
            }
            Ok(confirm) => Ok(confirm),
        }?;

        Ok(async move {
            match confirm.await {
                Ok(AmqpConfirmation::Ack(None)) => Ok(Confirmation::Ack),
                Ok(AmqpConfirmation::Ack(Some(returned))) => Ok(Confirmation::Nack(Some(format!(
                    "message returned: {}",
                    returned.reply_text.as_str()
                )))),
                Ok(AmqpConfirmation::Nack(_)) => Ok(Confirmation::Nack(None)),
                Ok(AmqpConfirmation::NotRequested) => {
                    warn!("publisher confirms are not enabled on the channel");
                    Ok(Confirmation::Nack(Some(
                        "publisher confirms not enabled".to_owned(),
                    )))
                }
                Err(err) => Err(DeliveryError::PublishingError(err.to_string())),
            }
        }
        .boxed())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<Subscription, DeliveryError> {
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());

        if let Err(err) = self
            .channel
            .basic_qos(self.prefetch_count, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "error to set the consumer prefetch");
            return Err(DeliveryError::ConsumerDeclarationError(queue.to_owned()));
        }

        let mut consumer = match self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(DeliveryError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let task = tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let decision = handler.deliver(inbound(&delivery)).await;
                        if let Err(err) = settle(&delivery, decision).await {
                            error!(error = err.to_string(), "error consume msg");
                        }
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
            debug!("consumer stream closed");
        });

        let channel = self.channel.clone();
        let tag = consumer_tag.clone();
        let cancel = async move {
            channel
                .basic_cancel(&tag, BasicCancelOptions { nowait: false })
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), consumer_tag = tag, "error to cancel the consumer");
                    DeliveryError::CancelConsumerError(tag.clone())
                })
        }
        .boxed();

        Ok(Subscription::new(&consumer_tag, task).with_cancel(cancel))
    }
}

async fn settle(delivery: &Delivery, decision: AckDecision) -> Result<(), DeliveryError> {
    match decision {
        AckDecision::Ack => delivery
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                DeliveryError::AckMessageError
            }),
        AckDecision::Reject { requeue } => delivery
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                DeliveryError::NackMessageError
            }),
    }
}

fn properties(message: &OutboundMessage) -> BasicProperties {
    let delivery_mode = if message.is_persistent() {
        DELIVERY_MODE_PERSISTENT
    } else {
        DELIVERY_MODE_TRANSIENT
    };

    BasicProperties::default()
        .with_content_type(ShortString::from(DEFAULT_CONTENT_TYPE))
        .with_delivery_mode(delivery_mode)
        .with_correlation_id(ShortString::from(message.correlation_id()))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(to_field_table(message.headers()))
}

fn inbound(delivery: &Delivery) -> InboundMessage {
    let props = &delivery.properties;

    let mut message = InboundMessage::new(
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.data.clone(),
    )
    .with_persistence(*props.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT))
    .with_headers(headers_from_properties(props));

    if let Some(id) = props.correlation_id() {
        message = message.with_correlation_id(id.as_str());
    }

    if delivery.redelivered {
        message = message.redelivered();
    }

    message
}

fn to_field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}

/// Converts AMQP headers into message headers.
///
/// When the message carries no attempt count but was dead-lettered by the
/// broker itself, the `x-death` count stands in for it.
fn headers_from_properties(props: &AMQPProperties) -> Headers {
    let table = props.headers().clone().unwrap_or_default();
    let mut headers = Headers::new();

    for (key, value) in table.inner() {
        let converted = match value {
            AMQPValue::LongString(v) => {
                Some(HeaderValue::Str(String::from_utf8_lossy(v.as_bytes()).into_owned()))
            }
            AMQPValue::ShortString(v) => Some(HeaderValue::Str(v.to_string())),
            AMQPValue::LongLongInt(v) => Some(HeaderValue::Int(*v)),
            AMQPValue::LongInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::LongUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            AMQPValue::ShortUInt(v) => Some(HeaderValue::Int(i64::from(*v))),
            _ => None,
        };

        if let Some(converted) = converted {
            headers.insert(key.to_string(), converted);
        }
    }

    if !headers.contains_key(HEADER_ATTEMPT_COUNT) {
        let deaths = x_death_count(&table);
        if deaths > 0 {
            headers.insert(HEADER_ATTEMPT_COUNT.to_owned(), HeaderValue::Int(deaths));
        }
    }

    headers
}

fn x_death_count(table: &FieldTable) -> i64 {
    table
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|value| value.as_field_table())
        .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
        .and_then(|count| count.as_long_long_int())
        .unwrap_or_default()
}
