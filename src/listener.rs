// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Listeners
//!
//! A listener is an application object whose methods consume broker topics.
//! It supplies its handler table through [`Listener::declare`] and carries a
//! [`ListenerBinding`], filled by the registry with the connection it is bound
//! to and the channels opened on its behalf. Re-registration after a
//! reconnection replaces both.

use crate::{broker::BrokerChannel, connection::WrappedConnection, declaration::Declarations};
use std::sync::Arc;
use tokio::sync::RwLock;

pub trait Listener: Send + Sync + Sized + 'static {
    /// Registry-managed binding state, usually a `ListenerBinding::default()` field.
    fn binding(&self) -> &ListenerBinding;

    /// Fills the handler table of this listener type.
    fn declare(declarations: &mut Declarations<Self>);
}

/// Connection and channels injected by the registry.
#[derive(Default)]
pub struct ListenerBinding {
    connection: RwLock<Option<Arc<WrappedConnection>>>,
    channels: RwLock<Vec<Arc<dyn BrokerChannel>>>,
}

impl ListenerBinding {
    pub fn new() -> ListenerBinding {
        ListenerBinding::default()
    }

    /// Connection the listener is currently bound to.
    pub async fn connection(&self) -> Option<Arc<WrappedConnection>> {
        self.connection.read().await.clone()
    }

    /// Channels opened for the listener's handlers, one per declaration.
    pub async fn channels(&self) -> Vec<Arc<dyn BrokerChannel>> {
        self.channels.read().await.clone()
    }

    pub(crate) async fn bind(&self, connection: Arc<WrappedConnection>, channels: Vec<Arc<dyn BrokerChannel>>) {
        *self.connection.write().await = Some(connection);
        *self.channels.write().await = channels;
    }
}

/// Address of the listener allocation, used as its identity in the registry.
pub(crate) fn identity<L>(listener: &Arc<L>) -> usize {
    Arc::as_ptr(listener) as *const () as usize
}
