// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Arguments
//!
//! Translation of exchange and queue definitions into the options and argument
//! tables the AMQP declarations expect.

use crate::{consumer::ConsumerOptions, exchange::ExchangeDefinition, queue::QueueDefinition};
use lapin::{
    options::{BasicConsumeOptions, ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, ShortString},
};
use std::collections::BTreeMap;

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

pub(crate) fn exchange_options(def: &ExchangeDefinition) -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        passive: def.passive,
        durable: def.durable,
        auto_delete: def.delete,
        internal: def.internal,
        nowait: def.no_wait,
    }
}

pub(crate) fn exchange_arguments(def: &ExchangeDefinition) -> FieldTable {
    FieldTable::from(def.params.clone())
}

pub(crate) fn queue_options(def: &QueueDefinition) -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: def.passive,
        durable: def.durable,
        exclusive: def.exclusive,
        auto_delete: def.delete,
        nowait: def.no_wait,
    }
}

/// Builds the `x-` arguments of a queue declaration.
pub(crate) fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    let limits = [
        (AMQP_HEADERS_MESSAGE_TTL, def.ttl),
        (AMQP_HEADERS_MAX_LENGTH, def.max_length),
        (AMQP_HEADERS_MAX_LENGTH_BYTES, def.max_length_bytes),
    ];

    for (key, value) in limits {
        if let Some(value) = value {
            args.insert(ShortString::from(key), AMQPValue::LongInt(LongInt::from(value)));
        }
    }

    FieldTable::from(args)
}

pub(crate) fn consume_options(options: &ConsumerOptions) -> BasicConsumeOptions {
    BasicConsumeOptions {
        no_local: options.no_local,
        no_ack: options.no_ack,
        exclusive: options.exclusive,
        nowait: options.no_wait,
    }
}
