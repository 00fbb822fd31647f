// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Wrapper
//!
//! A [`WrappedConnection`] owns the raw broker connection for one host. It
//! tracks whether it was explicitly closed, exposes its lifecycle as a
//! [`ConnectionState`], and swaps the raw connection when the registry
//! recovers from a broker-side closure. Every dispatcher opened on it is
//! tracked so that a fresh channel can be handed over after the swap.

use crate::{
    broker::{BrokerChannel, BrokerConnection},
    dispatcher::Dispatcher,
    errors::AmqpError,
    exchange::ExchangeDefinition,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info};

/// Lifecycle of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// The broker closed the connection; recovery has not started yet
    Disconnected,
    /// The registry is polling for a fresh connection
    Reconnecting,
    /// Explicitly closed; never reconnected
    Closed,
}

pub struct WrappedConnection {
    host: String,
    // Operations hold the read side; close and swap take the write side and so
    // wait for in-flight operations to settle.
    connection: RwLock<Arc<dyn BrokerConnection>>,
    closed: AtomicBool,
    // Bumped on every swap of the raw connection.
    generation: AtomicU64,
    // Set when the current raw connection closes while a recovery is running.
    interrupted: AtomicBool,
    state: watch::Sender<ConnectionState>,
    dispatchers: Mutex<Vec<Weak<Dispatcher>>>,
}

impl fmt::Debug for WrappedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedConnection")
            .field("host", &self.host)
            .field("state", &self.state())
            .finish()
    }
}

impl WrappedConnection {
    pub fn new(host: &str, connection: Arc<dyn BrokerConnection>) -> WrappedConnection {
        let (state, _) = watch::channel(ConnectionState::Connected);

        WrappedConnection {
            host: host.to_owned(),
            connection: RwLock::new(connection),
            closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            interrupted: AtomicBool::new(false),
            state,
            dispatchers: Mutex::new(vec![]),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Subscribes to lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Current raw connection handle.
    pub async fn connection(&self) -> Arc<dyn BrokerConnection> {
        self.connection.read().await.clone()
    }

    /// Opens a channel on the current raw connection.
    ///
    /// Fails with `NotFoundConnection` once the wrapper was explicitly closed.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let connection = self.connection.read().await;

        if self.is_closed() {
            return Err(AmqpError::NotFoundConnection(self.host.clone()));
        }

        connection.create_channel().await
    }

    /// Opens a dispatcher publishing to `exchange`.
    pub async fn open_dispatcher(&self, exchange: &str) -> Result<Arc<Dispatcher>, AmqpError> {
        let channel = self.create_channel().await?;
        let dispatcher = Arc::new(Dispatcher::new(exchange, channel));

        let mut dispatchers = self.dispatchers.lock().await;
        dispatchers.retain(|it| it.strong_count() > 0);
        dispatchers.push(Arc::downgrade(&dispatcher));

        debug!(host = self.host, exchange, "dispatcher opened");
        Ok(dispatcher)
    }

    /// Opens a dispatcher and asserts its exchange.
    pub async fn assert_and_open_dispatcher(
        &self,
        exchange: &ExchangeDefinition,
    ) -> Result<Arc<Dispatcher>, AmqpError> {
        let dispatcher = self.open_dispatcher(exchange.name()).await?;
        dispatcher.assert(exchange).await?;
        Ok(dispatcher)
    }

    /// Marks the wrapper closed and closes the raw connection.
    ///
    /// Waits for operations in flight on the connection before closing it.
    /// No reconnection is attempted afterwards.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Closed);

        let connection = self.connection.write().await;
        debug!(host = self.host, "closing connection");
        connection.close().await
    }

    /// Records a broker-side closure of the raw connection of `generation`.
    ///
    /// Returns `true` when the caller must start a recovery. A closure seen
    /// while a recovery is already running only makes that recovery retry, and
    /// closures of swapped-out connections are ignored.
    pub(crate) fn mark_disconnected(&self, generation: u64) -> bool {
        if self.is_closed() || self.generation() != generation {
            return false;
        }

        let mut start = false;
        self.state.send_if_modified(|state| match *state {
            ConnectionState::Connected => {
                *state = ConnectionState::Disconnected;
                start = true;
                true
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                self.interrupted.store(true, Ordering::SeqCst);
                false
            }
            ConnectionState::Closed => false,
        });

        start
    }

    pub(crate) fn mark_reconnecting(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Reconnecting;
                true
            } else {
                false
            }
        });
    }

    /// Ends a recovery that swapped in the raw connection of `generation`.
    ///
    /// Fails when that connection was swapped out or closed in the meantime,
    /// or when the recovery was not running.
    pub(crate) fn mark_connected(&self, generation: u64) -> bool {
        if self.generation() != generation || self.interrupted.swap(false, Ordering::SeqCst) {
            return false;
        }

        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Reconnecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        })
    }

    /// Swaps the raw connection and hands a fresh channel to every live
    /// dispatcher, which flushes its buffered messages.
    ///
    /// Returns the generation of the new raw connection.
    pub(crate) async fn update_connection(&self, connection: Arc<dyn BrokerConnection>) -> u64 {
        let generation = {
            let mut current = self.connection.write().await;
            *current = connection;
            self.interrupted.store(false, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        info!(host = self.host, "connection handle replaced");

        let dispatchers: Vec<Arc<Dispatcher>> = {
            let mut dispatchers = self.dispatchers.lock().await;
            dispatchers.retain(|it| it.strong_count() > 0);
            dispatchers.iter().filter_map(Weak::upgrade).collect()
        };

        for dispatcher in dispatchers {
            match self.create_channel().await {
                Ok(channel) => dispatcher.update_channel(channel).await,
                Err(err) => error!(
                    error = err.to_string(),
                    host = self.host,
                    exchange = dispatcher.exchange(),
                    "failure to refresh dispatcher channel"
                ),
            }
        }

        generation
    }
}
