// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! Consumer options, the payload handed to declared handlers, and the routine
//! turning a raw delivery into a handler invocation. Decoding failures are
//! reported and the delivery is dropped so the consumer loop keeps running.

use crate::{
    broker::{BrokerChannel, Delivery},
    codec,
    errors::AmqpError,
};
use serde_json::Value;
use std::{future::Future, sync::Arc};
use tracing::{debug, error};

/// Options applied when starting a consumer on a queue.
///
/// The broker-level flags map onto `basic.consume`; `no_parse` is local and
/// makes the registry hand the raw bytes to the handler instead of decoding them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub(crate) consumer_tag: String,
    pub(crate) no_ack: bool,
    pub(crate) no_local: bool,
    pub(crate) exclusive: bool,
    pub(crate) no_wait: bool,
    pub(crate) no_parse: bool,
}

impl ConsumerOptions {
    pub fn new() -> ConsumerOptions {
        ConsumerOptions::default()
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    /// Lets the broker consider messages settled as soon as they are delivered.
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Delivers the raw payload bytes without deserialization.
    pub fn no_parse(mut self) -> Self {
        self.no_parse = true;
        self
    }

    pub fn is_no_parse(&self) -> bool {
        self.no_parse
    }
}

/// Payload handed to a declared handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Decoded structured payload
    Json(Value),
    /// Undecoded payload, delivered when `no_parse` is set
    Raw(Vec<u8>),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Raw(bytes) => Some(bytes),
            Payload::Json(_) => None,
        }
    }
}

/// Builds the payload for a delivery according to the consumer options.
pub(crate) fn payload_of(delivery: &Delivery, no_parse: bool) -> Result<Payload, AmqpError> {
    if no_parse {
        return Ok(Payload::Raw(delivery.data.clone()));
    }

    codec::decode(&delivery.data).map(Payload::Json)
}

/// Decodes a delivery and invokes the handler with it.
///
/// The handler owns acknowledgement. A payload that cannot be decoded is
/// logged and dropped without asking the broker for a redelivery.
pub(crate) async fn consume<F, Fut>(
    delivery: Delivery,
    no_parse: bool,
    channel: Arc<dyn BrokerChannel>,
    handler: F,
) -> Result<(), AmqpError>
where
    F: FnOnce(Payload, Delivery, Arc<dyn BrokerChannel>) -> Fut,
    Fut: Future<Output = ()>,
{
    debug!(
        exchange = %delivery.exchange,
        routing_key = %delivery.routing_key,
        "received message"
    );

    let payload = match payload_of(&delivery, no_parse) {
        Ok(payload) => payload,
        Err(err) => {
            error!(
                error = err.to_string(),
                payload = %String::from_utf8_lossy(&delivery.data),
                "dropping message"
            );
            return Err(err);
        }
    };

    handler(payload, delivery, channel).await;

    Ok(())
}
