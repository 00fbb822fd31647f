// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Declarations
//!
//! A listener declares which of its methods consume which topology by filling a
//! typed [`Declarations`] table. The [`DeclarationStore`] builds that table once
//! per listener type and serves it to the registry whenever a listener of that
//! type is bound. No broker I/O happens here.

use crate::{
    broker::{BrokerChannel, Delivery},
    consumer::{ConsumerOptions, Payload},
    exchange::ExchangeDefinition,
    listener::Listener,
    queue::QueueDefinition,
};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use std::{
    any::{Any, TypeId},
    fmt,
    future::Future,
    sync::Arc,
};

/// Stored reference to a declared handler method.
pub type HandlerFn<L> =
    Arc<dyn Fn(Arc<L>, Payload, Delivery, Arc<dyn BrokerChannel>) -> BoxFuture<'static, ()> + Send + Sync>;

/// The topology a method was declared against, together with the method itself.
pub struct HandlerDeclaration<L> {
    pub(crate) method: &'static str,
    pub(crate) exchange: ExchangeDefinition,
    pub(crate) queue: QueueDefinition,
    pub(crate) consumer_options: Option<ConsumerOptions>,
    pub(crate) handler: HandlerFn<L>,
}

impl<L> Clone for HandlerDeclaration<L> {
    fn clone(&self) -> Self {
        HandlerDeclaration {
            method: self.method,
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            consumer_options: self.consumer_options.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<L> fmt::Debug for HandlerDeclaration<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDeclaration")
            .field("method", &self.method)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("consumer_options", &self.consumer_options)
            .finish()
    }
}

impl<L> HandlerDeclaration<L> {
    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn consumer_options(&self) -> Option<&ConsumerOptions> {
        self.consumer_options.as_ref()
    }

    pub(crate) fn no_parse(&self) -> bool {
        self.consumer_options
            .as_ref()
            .is_some_and(ConsumerOptions::is_no_parse)
    }
}

/// Ordered table of the handlers declared by one listener type.
pub struct Declarations<L> {
    entries: Vec<HandlerDeclaration<L>>,
}

impl<L> Default for Declarations<L> {
    fn default() -> Self {
        Declarations { entries: vec![] }
    }
}

impl<L: Send + Sync + 'static> Declarations<L> {
    /// Declares `method` as the consumer of `queue` bound to `exchange`.
    ///
    /// `queue` accepts a bare queue name, which binds with an empty key.
    /// Declaring the same method twice replaces the earlier declaration.
    pub fn event_handler<F, Fut>(
        &mut self,
        method: &'static str,
        exchange: ExchangeDefinition,
        queue: impl Into<QueueDefinition>,
        consumer_options: Option<ConsumerOptions>,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Arc<L>, Payload, Delivery, Arc<dyn BrokerChannel>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: HandlerFn<L> = Arc::new(move |listener, payload, delivery, channel| {
            Box::pin(handler(listener, payload, delivery, channel)) as BoxFuture<'static, ()>
        });

        let declaration = HandlerDeclaration {
            method,
            exchange,
            queue: queue.into(),
            consumer_options,
            handler,
        };

        match self.entries.iter_mut().find(|it| it.method == method) {
            Some(existing) => *existing = declaration,
            None => self.entries.push(declaration),
        }

        self
    }
}

impl<L> Declarations<L> {
    /// Declared method names, in declaration order.
    pub fn methods(&self) -> Vec<&'static str> {
        self.entries.iter().map(|it| it.method).collect()
    }

    pub fn get(&self, method: &str) -> Option<&HandlerDeclaration<L>> {
        self.entries.iter().find(|it| it.method == method)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HandlerDeclaration<L>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Declarations of every listener type seen so far, keyed by type.
///
/// A table is built the first time its type is queried and is read-only
/// afterwards.
#[derive(Default)]
pub struct DeclarationStore {
    tables: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl DeclarationStore {
    pub fn new() -> DeclarationStore {
        DeclarationStore::default()
    }

    fn collect<L: Listener>() -> Declarations<L> {
        let mut declarations = Declarations::default();
        L::declare(&mut declarations);
        declarations
    }

    pub fn declarations_of<L: Listener>(&self) -> Arc<Declarations<L>> {
        let table = self
            .tables
            .entry(TypeId::of::<L>())
            .or_insert_with(|| Arc::new(Self::collect::<L>()) as Arc<dyn Any + Send + Sync>)
            .value()
            .clone();

        table
            .downcast::<Declarations<L>>()
            .unwrap_or_else(|_| Arc::new(Self::collect::<L>()))
    }

    pub fn methods_of<L: Listener>(&self) -> Vec<&'static str> {
        self.declarations_of::<L>().methods()
    }

    pub fn declaration_for<L: Listener>(&self, method: &str) -> Option<HandlerDeclaration<L>> {
        self.declarations_of::<L>().get(method).cloned()
    }
}
