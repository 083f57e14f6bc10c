//! Connection hub: who is connected, who is online, and how events reach them.
//!
//! A [`Hub`] owns the [`Registry`] of live connections and the single
//! [`Dispatcher`] loop that sequences every multi-recipient send. One hub is
//! built at startup and shared through `AppState`; tests build their own.

pub mod connection;
pub mod dispatcher;
pub mod presence;
pub mod registry;

use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::mpsc;

use crate::config::HubConfig;
use crate::db::models::Identity;
use crate::db::Stores;
use crate::ws::events::WireEvent;

pub use connection::{ConnId, ConnectionHandle};
pub use dispatcher::{Dispatcher, FanOut, PresenceChange};
pub use presence::{OnlineUser, PresenceStatus};
pub use registry::Registry;

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    registry: Registry,
    dispatcher: Dispatcher,
    stores: Stores,
    config: HubConfig,
    gates: presence::TransitionGates,
}

impl Hub {
    /// Build a hub and spawn its dispatcher loop. Must run inside a tokio
    /// runtime. The loop stops once every clone of the hub is dropped.
    pub fn start(stores: Stores, config: HubConfig) -> Self {
        let registry = Registry::new();
        let (dispatcher, _loop) = Dispatcher::spawn(
            registry.clone(),
            config.broadcast_queue,
            config.presence_queue,
        );
        tracing::debug!(
            outbound_buffer = config.outbound_buffer,
            broadcast_queue = config.broadcast_queue,
            presence_queue = config.presence_queue,
            "Connection hub started"
        );
        Self {
            inner: Arc::new(HubInner {
                registry,
                dispatcher,
                stores,
                config,
                gates: presence::TransitionGates::default(),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn stores(&self) -> &Stores {
        &self.inner.stores
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn allocate_guest_identity(&self) -> Identity {
        self.inner.registry.allocate_guest_identity()
    }

    /// Handle plus outbound buffer for a new socket, sized from config.
    pub fn open_connection(
        &self,
        identity: Identity,
    ) -> (ConnectionHandle, mpsc::Receiver<Message>) {
        self.inner
            .registry
            .open_connection(identity, self.inner.config.outbound_buffer)
    }

    /// Register a connection and run the online transition if it is the
    /// identity's first.
    pub async fn admit(&self, conn: &ConnectionHandle, display_name: &str) {
        if conn.is_guest() {
            self.inner.registry.add_client(conn, display_name);
            return;
        }
        let _gate = self.inner.gates.lock(conn.identity()).await;
        if self.inner.registry.add_client(conn, display_name) {
            presence::went_online(self, conn.identity(), display_name).await;
        }
    }

    /// Unregister a connection and run the offline transition if it was the
    /// identity's last. Safe to call more than once.
    pub async fn release(&self, conn: &ConnectionHandle, display_name: &str) {
        if conn.is_guest() {
            self.inner.registry.remove_client(conn);
            return;
        }
        let _gate = self.inner.gates.lock(conn.identity()).await;
        if self.inner.registry.remove_client(conn) {
            presence::went_offline(self, conn.identity(), display_name).await;
        }
    }

    /// Fire-and-forget broadcast to every live connection. Returns false
    /// when the event was dropped because the broadcast queue is full.
    pub fn broadcast(&self, event: WireEvent) -> bool {
        self.inner.dispatcher.broadcast(event)
    }

    /// Queue a presence event for every live connection. Waits for room in
    /// the presence queue rather than dropping.
    pub async fn broadcast_presence(
        &self,
        identity: Identity,
        display_name: &str,
        status: PresenceStatus,
    ) {
        let change = PresenceChange {
            identity,
            display_name: display_name.to_string(),
            status,
        };
        if !self.inner.dispatcher.presence(change).await {
            tracing::warn!(identity, "Dispatcher stopped, presence event lost");
        }
    }

    /// Close every live connection of `identity`.
    pub fn force_disconnect(&self, identity: Identity) {
        if !self.inner.dispatcher.force_disconnect(identity) {
            tracing::warn!(identity, "Dispatcher stopped, closing directly");
            self.inner.registry.force_disconnect(identity);
        }
    }

    pub fn list_online(&self) -> Vec<OnlineUser> {
        self.inner.registry.list_online()
    }

    /// Push `frame` into every connection of one identity, bypassing the
    /// dispatcher. Returns how many connections accepted it.
    pub fn send_to_identity(&self, identity: Identity, frame: &Message) -> usize {
        self.inner
            .registry
            .connections_of(identity)
            .iter()
            .filter(|conn| conn.try_push(frame.clone()))
            .count()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::db::{open_in_memory, DbPool};

    /// Hub over a fresh in-memory database.
    pub(crate) fn hub() -> (Hub, DbPool) {
        let db = open_in_memory();
        let hub = Hub::start(Stores::sqlite(db.clone()), HubConfig::default());
        (hub, db)
    }

    pub(crate) fn decode(frame: Message) -> WireEvent {
        match frame {
            Message::Text(text) => serde_json::from_str(text.as_str()).expect("valid event json"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Next event on `rx`, or panic after two seconds.
    pub(crate) async fn next_event(rx: &mut mpsc::Receiver<Message>) -> WireEvent {
        let frame = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        decode(frame)
    }
}
