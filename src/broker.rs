// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Collaborator
//!
//! The registry never speaks the wire protocol itself. It drives the broker
//! through the traits in this module: a `Broker` opens connections, a
//! `BrokerConnection` multiplexes channels and reports unsolicited closure,
//! and a `BrokerChannel` asserts topology, consumes and publishes.
//!
//! The production implementation lives in [`crate::amqp`] and
//! [`crate::channel`] and is backed by lapin.

use crate::{consumer::ConsumerOptions, errors::AmqpError, exchange::ExchangeDefinition, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::{collections::BTreeMap, sync::Arc};

#[cfg(test)]
use mockall::automock;

/// Callback invoked when the broker closes a connection without being asked to.
pub type ClosedCallback = Box<dyn Fn() + Send + Sync>;

/// Callback invoked for every message pushed by the broker to a consumer.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// A message pushed by the broker to a consumer.
///
/// The delivery tag settles the message through [`BrokerChannel::ack`] or
/// [`BrokerChannel::nack`] on the channel it was received on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub message_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

/// Options for a single publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub(crate) routing_key: Option<String>,
    pub(crate) message_type: Option<String>,
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) mandatory: bool,
    pub(crate) persistent: bool,
}

impl PublishOptions {
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    pub fn message_type(mut self, kind: &str) -> Self {
        self.message_type = Some(kind.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Asks the broker to store the message on disk.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Routing key to publish with, the empty string when none was set.
    pub fn key(&self) -> &str {
        self.routing_key.as_deref().unwrap_or_default()
    }
}

/// Opens connections to a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// One physical connection to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel multiplexed over this connection.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_connected(&self) -> bool;

    /// Installs the handler fired when the broker closes the connection.
    fn on_closed(&self, callback: ClosedCallback);
}

/// A lightweight session multiplexed over a connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Creates the exchange if absent, validates its type otherwise.
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Creates the queue if absent and returns its name.
    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<(), AmqpError>;

    /// Starts a consumer; `callback` runs for every delivery in broker order.
    async fn consume(
        &self,
        queue: &str,
        options: &ConsumerOptions,
        callback: DeliveryCallback,
    ) -> Result<(), AmqpError>;

    /// Publishes a payload. Fails with `ChannelClosed` when the channel is unusable.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: &PublishOptions,
    ) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;
}
