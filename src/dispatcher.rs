// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! A [`Dispatcher`] publishes to one exchange over one channel. When the
//! channel is no longer usable the payload is kept in an in-memory FIFO buffer
//! and the publish still reports `CouldNotDispatchMessage`; the buffer is
//! replayed once, in order, when the connection wrapper hands over a fresh
//! channel. Buffered messages are lost if the process exits.

use crate::{
    broker::{BrokerChannel, PublishOptions},
    codec,
    errors::AmqpError,
    exchange::ExchangeDefinition,
};
use serde::Serialize;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

/// A publish that could not reach a usable channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredMessage {
    pub(crate) payload: Vec<u8>,
    pub(crate) options: PublishOptions,
}

pub struct Dispatcher {
    exchange: String,
    channel: RwLock<Arc<dyn BrokerChannel>>,
    buffer: Mutex<VecDeque<DeferredMessage>>,
}

impl Dispatcher {
    pub fn new(exchange: &str, channel: Arc<dyn BrokerChannel>) -> Dispatcher {
        Dispatcher {
            exchange: exchange.to_owned(),
            channel: RwLock::new(channel),
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Number of messages waiting for a fresh channel.
    pub async fn buffered(&self) -> usize {
        self.buffer.lock().await.len()
    }

    /// Asserts the dispatcher's exchange with the kind and options of `def`.
    pub async fn assert(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let def = ExchangeDefinition {
            name: self.exchange.clone(),
            ..def.clone()
        };
        self.channel.read().await.assert_exchange(&def).await
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.channel.read().await.close().await
    }

    /// Publishes raw bytes to the exchange.
    ///
    /// Publishes go straight to the channel only while nothing is buffered, so
    /// a message never overtakes an earlier one waiting for replay.
    pub async fn publish_bytes(&self, payload: &[u8], options: &PublishOptions) -> Result<(), AmqpError> {
        // Held until the message is either sent or buffered; channel swaps
        // wait for it.
        let mut buffer = self.buffer.lock().await;
        let channel = self.channel.read().await.clone();

        if buffer.is_empty() && channel.is_open() {
            match channel
                .publish(&self.exchange, options.key(), payload, options)
                .await
            {
                Ok(()) => return Ok(()),
                Err(AmqpError::ChannelClosed) => {}
                Err(err) => {
                    error!(error = err.to_string(), exchange = self.exchange, "failure to publish");
                    return Err(AmqpError::CouldNotDispatchMessage(err.to_string()));
                }
            }
        }

        buffer.push_back(DeferredMessage {
            payload: payload.to_vec(),
            options: options.clone(),
        });
        warn!(exchange = self.exchange, "channel closed, message buffered");

        Err(AmqpError::CouldNotDispatchMessage(
            AmqpError::ChannelClosed.to_string(),
        ))
    }

    pub async fn publish_str(&self, payload: &str, options: &PublishOptions) -> Result<(), AmqpError> {
        self.publish_bytes(payload.as_bytes(), options).await
    }

    /// Encodes `value` as JSON and publishes it.
    pub async fn publish<T>(&self, value: &T, options: &PublishOptions) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = codec::encode(value)?;
        self.publish_bytes(&payload, options).await
    }

    /// Replaces the channel and replays buffered messages on it.
    ///
    /// Every buffered message is retried exactly once; a failed replay drops
    /// the message instead of buffering it again.
    pub async fn update_channel(&self, channel: Arc<dyn BrokerChannel>) {
        let mut buffer = self.buffer.lock().await;
        *self.channel.write().await = channel.clone();

        let deferred: Vec<DeferredMessage> = buffer.drain(..).collect();
        if deferred.is_empty() {
            return;
        }

        debug!(
            exchange = self.exchange,
            count = deferred.len(),
            "replaying buffered messages"
        );

        for message in deferred {
            if let Err(err) = channel
                .publish(
                    &self.exchange,
                    message.options.key(),
                    &message.payload,
                    &message.options,
                )
                .await
            {
                error!(
                    error = err.to_string(),
                    exchange = self.exchange,
                    "dropping buffered message"
                );
            }
        }
    }
}
