// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod testing;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod codec;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod declaration;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod topology;

pub use broker::{Delivery, PublishOptions};
pub use configs::{AmqpConfigs, RegistryConfigs};
pub use connection::{ConnectionState, WrappedConnection};
pub use consumer::{ConsumerOptions, Payload};
pub use declaration::{DeclarationStore, Declarations};
pub use dispatcher::Dispatcher;
pub use errors::AmqpError;
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use listener::{Listener, ListenerBinding};
pub use queue::QueueDefinition;
pub use registry::{ConnectionCloser, Registry};
