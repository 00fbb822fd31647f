// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-process broker used by the test suites.
//!
//! Routes direct, fanout and topic exchanges (headers exchanges deliver to
//! every bound queue), keeps unconsumed messages per queue, and lets tests
//! kill connections, make the next connects fail or hold channel creation.

use crate::{
    broker::{Broker, BrokerChannel, BrokerConnection, ClosedCallback, Delivery, DeliveryCallback, PublishOptions},
    consumer::ConsumerOptions,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::{mpsc, Notify};

type ConsumerSender = mpsc::UnboundedSender<Delivery>;

#[derive(Default)]
struct MemoryQueue {
    pending: VecDeque<Delivery>,
    // (channel id, consumer)
    consumers: Vec<(u64, ConsumerSender)>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    // (queue, exchange, binding key)
    bindings: Vec<(String, String, String)>,
    acked: Vec<u64>,
    nacked: Vec<u64>,
}

impl BrokerState {
    fn route(&mut self, exchange: &str, routing_key: &str, payload: &[u8], tag: u64, options: &PublishOptions) {
        let Some(kind) = self.exchanges.get(exchange).cloned() else {
            return;
        };

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, bound, key)| bound == exchange && matches_key(&kind, key, routing_key))
            .map(|(queue, _, _)| queue.clone())
            .collect();

        for name in targets {
            let delivery = Delivery {
                delivery_tag: tag,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                message_type: options.message_type.clone(),
                headers: options.headers.clone(),
                data: payload.to_vec(),
                ..Delivery::default()
            };

            if let Some(queue) = self.queues.get_mut(&name) {
                queue.consumers.retain(|(_, tx)| !tx.is_closed());
                match queue.consumers.first() {
                    Some((_, tx)) => {
                        let _ = tx.send(delivery);
                    }
                    None => queue.pending.push_back(delivery),
                }
            }
        }
    }

    fn drop_consumers_of(&mut self, channel: u64) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|(id, _)| *id != channel);
        }
    }
}

fn matches_key(kind: &ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => matches_topic(
            &binding_key.split('.').collect::<Vec<_>>(),
            &routing_key.split('.').collect::<Vec<_>>(),
        ),
        _ => binding_key == routing_key,
    }
}

fn matches_topic(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.first(), words.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            matches_topic(&pattern[1..], words) || (!words.is_empty() && matches_topic(pattern, &words[1..]))
        }
        (Some(&"*"), Some(_)) => matches_topic(&pattern[1..], &words[1..]),
        (Some(p), Some(w)) if p == w => matches_topic(&pattern[1..], &words[1..]),
        _ => false,
    }
}

/// Holds channel creation until released.
#[derive(Default)]
struct ChannelGate {
    held: AtomicBool,
    waiting: AtomicUsize,
    release: Notify,
}

impl ChannelGate {
    async fn pass(&self) {
        if !self.held.load(Ordering::SeqCst) {
            return;
        }

        let released = self.release.notified();
        self.waiting.fetch_add(1, Ordering::SeqCst);
        released.await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
    gate: Arc<ChannelGate>,
    fragile: AtomicBool,
    failures: AtomicUsize,
    connects: AtomicUsize,
    channels: Arc<AtomicUsize>,
    ids: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub(crate) fn new() -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker::default())
    }

    /// Makes the next `count` connects fail.
    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next connection drop as soon as a channel is requested on it.
    pub(crate) fn drop_next_connection_on_first_channel(&self) {
        self.fragile.store(true, Ordering::SeqCst);
    }

    /// Holds every channel creation until [`MemoryBroker::release_channels`].
    pub(crate) fn hold_channels(&self) {
        self.gate.held.store(true, Ordering::SeqCst);
    }

    pub(crate) fn release_channels(&self) {
        self.gate.held.store(false, Ordering::SeqCst);
        self.gate.release.notify_waiters();
    }

    /// Channel creations currently held.
    pub(crate) fn held_channels(&self) -> usize {
        self.gate.waiting.load(Ordering::SeqCst)
    }

    /// Number of connect calls, failed ones included.
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn channels_created(&self) -> usize {
        self.channels.load(Ordering::SeqCst)
    }

    pub(crate) fn acked(&self) -> Vec<u64> {
        self.state.lock().unwrap().acked.clone()
    }

    pub(crate) fn nacked(&self) -> Vec<u64> {
        self.state.lock().unwrap().nacked.clone()
    }

    pub(crate) fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map_or(0, |it| it.pending.len())
    }

    /// Simulates the broker dropping every open connection.
    pub(crate) fn kill_connections(&self) {
        let connections: Vec<_> = self.connections.lock().unwrap().drain(..).collect();
        for connection in connections {
            connection.kill();
        }
    }

    /// Publishes as an external producer would.
    pub(crate) fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) {
        let tag = self.ids.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .unwrap()
            .route(exchange, routing_key, payload, tag, &PublishOptions::default());
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, host: &str) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AmqpError::ConnectionError(host.to_owned()));
        }

        let connection = Arc::new(MemoryConnection {
            state: self.state.clone(),
            open: AtomicBool::new(true),
            fragile: AtomicBool::new(self.fragile.swap(false, Ordering::SeqCst)),
            gate: self.gate.clone(),
            on_closed: Mutex::new(vec![]),
            channels: Mutex::new(vec![]),
            created: self.channels.clone(),
            ids: self.ids.clone(),
        });
        self.connections.lock().unwrap().push(connection.clone());

        Ok(connection)
    }
}

pub(crate) struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    open: AtomicBool,
    fragile: AtomicBool,
    gate: Arc<ChannelGate>,
    on_closed: Mutex<Vec<ClosedCallback>>,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    created: Arc<AtomicUsize>,
    ids: Arc<AtomicU64>,
}

impl MemoryConnection {
    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        for channel in self.channels.lock().unwrap().drain(..) {
            channel.shutdown();
        }
    }

    fn kill(&self) {
        self.shutdown();
        let callbacks: Vec<ClosedCallback> = self.on_closed.lock().unwrap().drain(..).collect();
        for callback in callbacks {
            callback();
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.gate.pass().await;

        if self.fragile.swap(false, Ordering::SeqCst) {
            self.kill();
        }

        if !self.is_connected() {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let channel = Arc::new(MemoryChannel {
            id: self.ids.fetch_add(1, Ordering::SeqCst),
            state: self.state.clone(),
            open: AtomicBool::new(true),
            ids: self.ids.clone(),
        });
        self.channels.lock().unwrap().push(channel.clone());
        self.created.fetch_add(1, Ordering::SeqCst);

        Ok(channel)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn on_closed(&self, callback: ClosedCallback) {
        self.on_closed.lock().unwrap().push(callback);
    }
}

pub(crate) struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    open: AtomicBool,
    ids: Arc<AtomicU64>,
}

impl MemoryChannel {
    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.state.lock().unwrap().drop_consumers_of(self.id);
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(AmqpError::ChannelClosed)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();

        match state.exchanges.get(def.name()) {
            Some(kind) if kind != def.exchange_kind() => Err(AmqpError::DeclareExchangeError(def.name().to_owned())),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name().to_owned(), def.exchange_kind().clone());
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.ensure_open()?;

        let name = if def.name().is_empty() {
            format!("amq.gen-{}", self.ids.fetch_add(1, Ordering::SeqCst))
        } else {
            def.name().to_owned()
        };

        self.state.lock().unwrap().queues.entry(name.clone()).or_default();
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.state.lock().unwrap();

        if !state.exchanges.contains_key(exchange) || !state.queues.contains_key(queue) {
            return Err(AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned()));
        }

        let binding = (queue.to_owned(), exchange.to_owned(), binding_key.to_owned());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _options: &ConsumerOptions,
        callback: DeliveryCallback,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        {
            let mut state = self.state.lock().unwrap();
            let Some(memory_queue) = state.queues.get_mut(queue) else {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            };

            for delivery in memory_queue.pending.drain(..) {
                let _ = tx.send(delivery);
            }
            memory_queue.consumers.push((self.id, tx));
        }

        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                callback(delivery).await;
            }
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
        self.ensure_open()?;

        let tag = self.ids.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::PublishingError(format!("no exchange `{exchange}`")));
        }

        state.route(exchange, routing_key, payload, tag, options);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.state.lock().unwrap().acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, _requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.state.lock().unwrap().nacked.push(delivery_tag);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matching() {
        let kind = ExchangeKind::Topic;

        assert!(matches_key(&kind, "orders.*", "orders.created"));
        assert!(matches_key(&kind, "orders.#", "orders"));
        assert!(matches_key(&kind, "#.eu", "orders.created.eu"));
        assert!(!matches_key(&kind, "orders.*", "orders.created.eu"));
        assert!(!matches_key(&ExchangeKind::Direct, "", "orders"));
        assert!(matches_key(&ExchangeKind::Fanout, "", "orders"));
    }

    #[tokio::test]
    async fn test_unconsumed_messages_wait_in_queue() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("broker-A").await.unwrap();
        let channel = connection.create_channel().await.unwrap();

        channel.assert_exchange(&ExchangeDefinition::new("orders")).await.unwrap();
        let queue = channel.assert_queue(&QueueDefinition::new("orders-q")).await.unwrap();
        channel.bind_queue(&queue, "orders", "created").await.unwrap();

        broker.publish("orders", "created", b"1");
        broker.publish("orders", "deleted", b"2");
        assert_eq!(broker.pending("orders-q"), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: DeliveryCallback = Arc::new(move |delivery: Delivery| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(delivery);
            }) as futures_util::future::BoxFuture<'static, ()>
        });
        channel
            .consume(&queue, &ConsumerOptions::default(), callback)
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.data, b"1");
        assert_eq!(broker.pending("orders-q"), 0);

        channel.ack(delivery.delivery_tag).await.unwrap();
        channel.nack(42, false).await.unwrap();
        assert_eq!(broker.acked(), vec![delivery.delivery_tag]);
        assert_eq!(broker.nacked(), vec![42]);
    }

    #[tokio::test]
    async fn test_client_close_does_not_notify() {
        let broker = MemoryBroker::new();
        let connection = broker.connect("broker-A").await.unwrap();
        let channel = connection.create_channel().await.unwrap();
        let notified = Arc::new(AtomicBool::new(false));
        let flag = notified.clone();
        connection.on_closed(Box::new(move || flag.store(true, Ordering::SeqCst)));

        connection.close().await.unwrap();

        assert!(!connection.is_connected());
        assert!(!notified.load(Ordering::SeqCst));
        assert_eq!(
            channel.publish("orders", "", b"1", &PublishOptions::default()).await,
            Err(AmqpError::ChannelClosed)
        );
    }
}
