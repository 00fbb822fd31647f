// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channels
//!
//! lapin-backed implementation of [`BrokerChannel`]. Consumers run on spawned
//! tokio tasks draining the lapin consumer stream; every delivery is handled
//! inside a consumer span parented by the publisher's trace context.

use crate::{
    amqp::AMQP_REPLY_SUCCESS,
    broker::{BrokerChannel, Delivery, DeliveryCallback, PublishOptions},
    codec::JSON_CONTENT_TYPE,
    consumer::ConsumerOptions,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    otel,
    queue::QueueDefinition,
    topology,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions, QueueBindOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::trace::Span;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Delivery mode flagging a message as persistent
const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> LapinChannel {
        LapinChannel { channel }
    }

    fn properties(options: &PublishOptions) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(&mut headers);

        for (key, value) in &options.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if let Some(kind) = &options.message_type {
            props = props.with_type(ShortString::from(kind.clone()));
        }

        if options.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        props
    }
}

impl From<&message::Delivery> for Delivery {
    fn from(delivery: &message::Delivery) -> Self {
        let headers = match delivery.properties.headers() {
            Some(table) => table
                .inner()
                .iter()
                .filter_map(|(key, value)| match value {
                    AMQPValue::LongString(value) => Some((
                        key.to_string(),
                        String::from_utf8_lossy(value.as_bytes()).to_string(),
                    )),
                    AMQPValue::ShortString(value) => Some((key.to_string(), value.to_string())),
                    _ => None,
                })
                .collect(),
            None => BTreeMap::default(),
        };

        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            message_id: delivery.properties.message_id().as_ref().map(|id| id.to_string()),
            message_type: delivery.properties.kind().as_ref().map(|kind| kind.to_string()),
            headers,
            data: delivery.data.clone(),
        }
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!(exchange = def.name, "asserting exchange");

        self.channel
            .exchange_declare(
                &def.name,
                def.kind.clone().into(),
                topology::exchange_options(def),
                topology::exchange_arguments(def),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!(queue = def.name, "asserting queue");

        match self
            .channel
            .queue_declare(
                &def.name,
                topology::queue_options(def),
                topology::queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            Ok(queue) => Ok(queue.name().to_string()),
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<(), AmqpError> {
        debug!(queue, exchange, binding_key, "binding queue");

        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumerOptions,
        callback: DeliveryCallback,
    ) -> Result<(), AmqpError> {
        let mut consumer = match self
            .channel
            .basic_consume(
                queue,
                &options.consumer_tag,
                topology::consume_options(options),
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let queue = queue.to_owned();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let mut span = otel::consumer_span(&delivery.properties, &queue);
                        callback(Delivery::from(&delivery)).await;
                        span.end();
                    }
                    Err(err) => error!(error = err.to_string(), queue, "errors consume msg"),
                }
            }

            debug!(queue, "consumer stream ended");
        });

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelClosed);
        }

        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: options.mandatory,
                },
                payload,
                Self::properties(options),
            )
            .await
        {
            Err(err) if !self.is_open() => {
                warn!(error = err.to_string(), exchange, "channel closed while publishing");
                Err(AmqpError::ChannelClosed)
            }
            Err(err) => {
                error!(error = err.to_string(), exchange, "error publishing message");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .close(AMQP_REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the channel");
                AmqpError::ChannelError(err.to_string())
            })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }
}
