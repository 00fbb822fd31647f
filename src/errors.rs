// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Event Handler Registry
//!
//! This module provides the error kinds surfaced by the registry, the connection
//! wrapper and the dispatchers, together with the broker-level failures raised
//! by the AMQP collaborator. Recoverable conditions (a closed connection or a
//! closed channel) are handled by the reconnection and buffering machinery and
//! only reach the caller as `CouldNotDispatchMessage` on the publish side.

use thiserror::Error;

/// Represents errors that can occur while registering listeners, publishing
/// messages or talking to the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The operation referenced a host that is not in the connection pool,
    /// or a connection wrapper that was already closed
    #[error("could not find connection for host `{0}`")]
    NotFoundConnection(String),

    /// The listener was never registered in the registry
    #[error("listener is not registered")]
    NotFoundListener,

    /// Publishing failed; the message may have been buffered for a later retry
    #[error("could not dispatch message: {0}")]
    CouldNotDispatchMessage(String),

    /// An inbound payload could not be decoded
    #[error("could not parse payload: {0}")]
    CouldNotParsePayload(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The channel is no longer usable
    #[error("channel is closed")]
    ChannelClosed,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}
