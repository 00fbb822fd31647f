// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connections
//!
//! lapin-backed implementation of [`Broker`] and [`BrokerConnection`].

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection, ClosedCallback},
    channel::LapinChannel,
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error};

/// Reply code sent to the broker on a client-initiated close
pub(crate) const AMQP_REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections, naming each one with the configured client name.
#[derive(Debug, Clone)]
pub struct LapinBroker {
    connection_name: String,
}

impl LapinBroker {
    pub fn new(connection_name: &str) -> LapinBroker {
        LapinBroker {
            connection_name: connection_name.to_owned(),
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(&self, host: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(host, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect(host, options).await {
            Ok(conn) => {
                debug!(host, "amqp connected");
                Ok(Arc::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), host, "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(c) => {
                debug!(id = c.id(), "channel created");
                Ok(Arc::new(LapinChannel::new(c)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn
            .close(AMQP_REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::ConnectionError(err.to_string())
            })
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    fn on_closed(&self, callback: ClosedCallback) {
        self.conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection closed");
            callback();
        });
    }
}
