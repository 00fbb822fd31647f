// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listener Registry
//!
//! The registry owns the pool of named connections and the set of live
//! listeners. Binding a listener turns each of its declarations into broker
//! topology: one channel per handler, the exchange and queue asserted, the
//! queue bound and a consumer started that decodes deliveries and invokes the
//! declared handler.
//!
//! When the broker closes a pooled connection the registry polls for a fresh
//! one at a fixed interval, swaps it into the wrapper, refreshes the wrapper's
//! dispatchers (flushing their buffers) and binds every listener that was
//! attached to the connection again. Polling only stops on success or when the
//! wrapper is closed or replaced in the pool.

use crate::{
    amqp::LapinBroker,
    broker::{Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryCallback},
    configs::RegistryConfigs,
    connection::WrappedConnection,
    consumer,
    declaration::{DeclarationStore, HandlerDeclaration},
    errors::AmqpError,
    listener::{identity, Listener, ListenerBinding},
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture};
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Type-erased view of a registered listener.
#[async_trait]
trait RegisteredListener: Send + Sync {
    fn binding(&self) -> &ListenerBinding;

    /// Runs the whole bind procedure for the listener against `connection`.
    async fn attach(&self, registry: &Registry, connection: &Arc<WrappedConnection>) -> Result<(), AmqpError>;
}

struct Registered<L>(Arc<L>);

#[async_trait]
impl<L: Listener> RegisteredListener for Registered<L> {
    fn binding(&self) -> &ListenerBinding {
        self.0.binding()
    }

    async fn attach(&self, registry: &Registry, connection: &Arc<WrappedConnection>) -> Result<(), AmqpError> {
        registry.add_listener(connection, self.0.clone()).await
    }
}

#[derive(Clone)]
struct ListenerEntry {
    connection: Arc<WrappedConnection>,
    listener: Arc<dyn RegisteredListener>,
}

enum Recovery {
    Recovered,
    Abandoned,
}

struct RegistryInner {
    broker: Arc<dyn Broker>,
    configs: RegistryConfigs,
    declarations: Arc<DeclarationStore>,
    connections: DashMap<String, Arc<WrappedConnection>>,
    // Keyed by listener identity, not value.
    listeners: DashMap<usize, ListenerEntry>,
}

/// Closes a connection opened by [`Registry::open_connection`].
pub struct ConnectionCloser {
    registry: Weak<RegistryInner>,
    connection: Arc<WrappedConnection>,
}

impl ConnectionCloser {
    /// Closes the connection without reconnecting and removes it from the pool.
    pub async fn close(self) -> Result<(), AmqpError> {
        if let Some(inner) = self.registry.upgrade() {
            inner
                .connections
                .remove_if(self.connection.host(), |_, pooled| Arc::ptr_eq(pooled, &self.connection));
        }

        self.connection.close().await
    }
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    pub fn new(broker: Arc<dyn Broker>) -> Registry {
        Registry::with_configs(broker, RegistryConfigs::default())
    }

    pub fn with_configs(broker: Arc<dyn Broker>, configs: RegistryConfigs) -> Registry {
        Registry::with_declarations(broker, configs, Arc::new(DeclarationStore::new()))
    }

    /// Creates a registry reading handler tables from a shared store.
    pub fn with_declarations(
        broker: Arc<dyn Broker>,
        configs: RegistryConfigs,
        declarations: Arc<DeclarationStore>,
    ) -> Registry {
        Registry {
            inner: Arc::new(RegistryInner {
                broker,
                configs,
                declarations,
                connections: DashMap::new(),
                listeners: DashMap::new(),
            }),
        }
    }

    /// Creates a registry talking AMQP through lapin.
    pub fn amqp(configs: RegistryConfigs) -> Registry {
        let broker = Arc::new(LapinBroker::new(&configs.connection_name));
        Registry::with_configs(broker, configs)
    }

    pub fn declarations(&self) -> &DeclarationStore {
        &self.inner.declarations
    }

    /// Pooled connection for `host`, if any.
    pub fn connection(&self, host: &str) -> Option<Arc<WrappedConnection>> {
        self.inner.connections.get(host).map(|it| it.value().clone())
    }

    pub fn is_registered<L: Listener>(&self, listener: &Arc<L>) -> bool {
        self.inner.listeners.contains_key(&identity(listener))
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Opens a connection to `host` and adds it to the pool.
    ///
    /// A broker-side closure of the connection starts the reconnection loop.
    /// Opening the same host twice replaces the pooled entry.
    pub async fn open_connection(
        &self,
        host: &str,
    ) -> Result<(ConnectionCloser, Arc<WrappedConnection>), AmqpError> {
        let raw = self.inner.broker.connect(host).await?;
        let connection = Arc::new(WrappedConnection::new(host, raw.clone()));
        self.watch(&raw, &connection, connection.generation())?;

        if self
            .inner
            .connections
            .insert(host.to_owned(), connection.clone())
            .is_some()
        {
            warn!(host, "replacing pooled connection");
        }

        info!(host, "connection opened");
        Ok((
            ConnectionCloser {
                registry: Arc::downgrade(&self.inner),
                connection: connection.clone(),
            },
            connection,
        ))
    }

    /// Closes the pooled connection for `host` and removes it from the pool.
    pub async fn find_and_close_connection(&self, host: &str) -> Result<(), AmqpError> {
        let Some((_, connection)) = self.inner.connections.remove(host) else {
            return Err(AmqpError::NotFoundConnection(host.to_owned()));
        };

        connection.close().await
    }

    /// Binds `listener` to the pooled connection of `host`.
    pub async fn add_listener_to_host<L: Listener>(&self, host: &str, listener: Arc<L>) -> Result<(), AmqpError> {
        let Some(connection) = self.connection(host) else {
            return Err(AmqpError::NotFoundConnection(host.to_owned()));
        };

        self.add_listener(&connection, listener).await
    }

    /// Binds several listeners to one connection, one result per listener.
    pub async fn add_listeners<L: Listener>(
        &self,
        connection: &Arc<WrappedConnection>,
        listeners: impl IntoIterator<Item = Arc<L>>,
    ) -> Vec<Result<(), AmqpError>> {
        join_all(
            listeners
                .into_iter()
                .map(|listener| self.add_listener(connection, listener)),
        )
        .await
    }

    /// Binds every declared handler of `listener` to `connection`.
    ///
    /// Handlers are set up concurrently and the call returns once all of them
    /// are done. If any of them fails the channels already opened are closed
    /// and the listener is left unregistered. Registering a listener that is
    /// already registered replaces its previous binding.
    pub async fn add_listener<L: Listener>(
        &self,
        connection: &Arc<WrappedConnection>,
        listener: Arc<L>,
    ) -> Result<(), AmqpError> {
        if connection.is_closed() {
            warn!(host = connection.host(), "connection is closed, listener not bound");
            return Err(AmqpError::NotFoundConnection(connection.host().to_owned()));
        }

        let declarations = self.inner.declarations.declarations_of::<L>();

        let results = join_all(
            declarations
                .iter()
                .map(|declaration| self.bind(connection, &listener, declaration)),
        )
        .await;

        let mut channels = Vec::with_capacity(results.len());
        let mut failure = None;
        for result in results {
            match result {
                Ok(channel) => channels.push(channel),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }

        if let Some(err) = failure {
            close_channels(&channels).await;
            return Err(err);
        }

        if let Some((_, previous)) = self.inner.listeners.remove(&identity(&listener)) {
            close_channels(&previous.listener.binding().channels().await).await;
        }

        listener.binding().bind(connection.clone(), channels).await;
        self.inner.listeners.insert(
            identity(&listener),
            ListenerEntry {
                connection: connection.clone(),
                listener: Arc::new(Registered(listener)),
            },
        );

        info!(
            host = connection.host(),
            handlers = declarations.len(),
            "listener registered"
        );
        Ok(())
    }

    /// Removes `listener` from the live set.
    ///
    /// With `close_connection` its channels and its connection are closed too,
    /// after the operations in flight on that connection have settled.
    pub async fn remove_listener<L: Listener>(&self, listener: &Arc<L>, close_connection: bool) -> Result<(), AmqpError> {
        let Some((_, entry)) = self.inner.listeners.remove(&identity(listener)) else {
            return Err(AmqpError::NotFoundListener);
        };

        if close_connection {
            self.close_listener_connection(&entry).await;
        }

        Ok(())
    }

    /// Tears down every live listener together with its channels and connection.
    pub async fn close_all_listeners(&self) {
        let ids: Vec<usize> = self.inner.listeners.iter().map(|it| *it.key()).collect();
        let entries: Vec<ListenerEntry> = ids
            .into_iter()
            .filter_map(|id| self.inner.listeners.remove(&id).map(|(_, entry)| entry))
            .collect();

        join_all(entries.iter().map(|entry| self.close_listener_connection(entry))).await;
    }

    /// Closes every listener, then every pooled connection.
    pub async fn close(&self) {
        self.close_all_listeners().await;

        let hosts: Vec<String> = self.inner.connections.iter().map(|it| it.key().clone()).collect();
        let connections: Vec<Arc<WrappedConnection>> = hosts
            .iter()
            .filter_map(|host| self.inner.connections.remove(host).map(|(_, connection)| connection))
            .collect();

        for result in join_all(connections.iter().map(|connection| connection.close())).await {
            if let Err(err) = result {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }
    }

    async fn close_listener_connection(&self, entry: &ListenerEntry) {
        close_channels(&entry.listener.binding().channels().await).await;

        let connection = &entry.connection;
        self.inner
            .connections
            .remove_if(connection.host(), |_, pooled| Arc::ptr_eq(pooled, connection));

        if let Err(err) = connection.close().await {
            warn!(
                error = err.to_string(),
                host = connection.host(),
                "failure to close connection"
            );
        }
    }

    /// Provisions one declaration on a dedicated channel.
    async fn bind<L: Listener>(
        &self,
        connection: &Arc<WrappedConnection>,
        listener: &Arc<L>,
        declaration: &HandlerDeclaration<L>,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let channel = connection.create_channel().await?;

        match Self::provision(&channel, listener, declaration).await {
            Ok(()) => Ok(channel),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    method = declaration.method(),
                    "failure to bind handler"
                );
                close_channels(&[channel]).await;
                Err(err)
            }
        }
    }

    async fn provision<L: Listener>(
        channel: &Arc<dyn BrokerChannel>,
        listener: &Arc<L>,
        declaration: &HandlerDeclaration<L>,
    ) -> Result<(), AmqpError> {
        channel.assert_exchange(declaration.exchange()).await?;

        let queue = channel.assert_queue(declaration.queue()).await?;
        channel
            .bind_queue(&queue, declaration.exchange().name(), declaration.queue().key())
            .await?;

        let options = declaration.consumer_options().cloned().unwrap_or_default();
        let callback = Self::delivery_callback(listener.clone(), declaration, channel.clone());
        channel.consume(&queue, &options, callback).await?;

        debug!(
            method = declaration.method(),
            exchange = declaration.exchange().name(),
            queue,
            "handler bound"
        );
        Ok(())
    }

    fn delivery_callback<L: Listener>(
        listener: Arc<L>,
        declaration: &HandlerDeclaration<L>,
        channel: Arc<dyn BrokerChannel>,
    ) -> DeliveryCallback {
        let handler = declaration.handler.clone();
        let method = declaration.method();
        let no_parse = declaration.no_parse();

        Arc::new(move |delivery: Delivery| {
            let listener = listener.clone();
            let handler = handler.clone();
            let channel = channel.clone();

            Box::pin(async move {
                let result = consumer::consume(delivery, no_parse, channel, |payload, delivery, channel| {
                    handler(listener, payload, delivery, channel)
                })
                .await;

                if result.is_err() {
                    debug!(method, "delivery dropped");
                }
            }) as BoxFuture<'static, ()>
        })
    }

    /// Installs the closure handler of a raw connection serving `connection`.
    ///
    /// `generation` is the wrapper generation the raw connection belongs to;
    /// notifications from a connection that was swapped out are ignored.
    fn watch(
        &self,
        raw: &Arc<dyn BrokerConnection>,
        connection: &Arc<WrappedConnection>,
        generation: u64,
    ) -> Result<(), AmqpError> {
        let runtime = Handle::try_current().map_err(|err| {
            error!(error = err.to_string(), "no tokio runtime to drive reconnection");
            AmqpError::InternalError
        })?;

        let registry = Arc::downgrade(&self.inner);
        let connection = Arc::downgrade(connection);
        let interval = self.inner.configs.reconnect_interval;

        raw.on_closed(Box::new(move || {
            let Some(connection) = connection.upgrade() else {
                return;
            };

            if !connection.mark_disconnected(generation) {
                return;
            }

            warn!(host = connection.host(), "amqp connection closed!");
            runtime.spawn(reconnect_on_failure(registry.clone(), connection, interval));
        }));

        Ok(())
    }

    /// Single reconnection attempt.
    ///
    /// Listeners whose binding fails stay registered on the connection and are
    /// bound again by the next recovery. The attempt fails if the fresh
    /// connection is lost before every listener has been handled.
    async fn reconnect(&self, connection: &Arc<WrappedConnection>) -> Result<Recovery, AmqpError> {
        let host = connection.host();
        if !self.is_pooled(connection) {
            return Ok(Recovery::Abandoned);
        }

        let raw = self.inner.broker.connect(host).await?;
        self.watch(&raw, connection, connection.generation() + 1)?;
        let generation = connection.update_connection(raw.clone()).await;

        let listeners: Vec<ListenerEntry> = self
            .inner
            .listeners
            .iter()
            .filter(|it| Arc::ptr_eq(&it.connection, connection))
            .map(|it| it.value().clone())
            .collect();
        debug!(host, count = listeners.len(), "found listeners");

        let results = join_all(
            listeners
                .iter()
                .map(|entry| entry.listener.attach(self, connection)),
        )
        .await;
        for err in results.into_iter().filter_map(Result::err) {
            error!(error = err.to_string(), host, "failure to bind listener again");
        }

        if !self.is_pooled(connection) {
            return Ok(Recovery::Abandoned);
        }

        if !raw.is_connected() || !connection.mark_connected(generation) {
            return Err(AmqpError::ConnectionError(format!(
                "connection to {host} lost during recovery"
            )));
        }

        Ok(Recovery::Recovered)
    }

    fn is_pooled(&self, connection: &Arc<WrappedConnection>) -> bool {
        !connection.is_closed()
            && self
                .connection(connection.host())
                .is_some_and(|it| Arc::ptr_eq(&it, connection))
    }
}

async fn close_channels(channels: &[Arc<dyn BrokerChannel>]) {
    for channel in channels {
        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close channel");
        }
    }
}

/// Polls for a fresh connection until it is recovered or no longer wanted.
async fn reconnect_on_failure(registry: Weak<RegistryInner>, connection: Arc<WrappedConnection>, interval: Duration) {
    connection.mark_reconnecting();

    loop {
        tokio::time::sleep(interval).await;

        let Some(inner) = registry.upgrade() else {
            return;
        };

        info!(host = connection.host(), "reconnecting");
        match (Registry { inner }).reconnect(&connection).await {
            Ok(Recovery::Recovered) => {
                info!(host = connection.host(), "connection has recovered!");
                return;
            }
            Ok(Recovery::Abandoned) => {
                debug!(host = connection.host(), "connection closed, reconnection abandoned");
                return;
            }
            Err(err) => warn!(
                error = err.to_string(),
                host = connection.host(),
                "an error occurred while reconnecting, retrying in {:?}",
                interval
            ),
        }
    }
}
