//! Live connection registry and the presence map derived from it.
//!
//! Both maps sit behind one `RwLock`. Critical sections only touch map
//! structure; every socket write happens after the guard is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::connection::{ConnId, ConnectionHandle};
use super::presence::OnlineUser;
use crate::db::models::Identity;
use crate::ws::events::WireEvent;

#[derive(Debug, Default)]
struct RegistryState {
    /// identity -> live connections. An identity is present iff its set is non-empty.
    connections: HashMap<Identity, HashMap<ConnId, ConnectionHandle>>,
    /// authenticated identity -> display name, for identities with >= 1 connection.
    presence: HashMap<Identity, String>,
}

/// Shared registry of live connections, keyed by identity.
#[derive(Debug, Clone)]
pub struct Registry {
    state: Arc<RwLock<RegistryState>>,
    next_guest: Arc<AtomicI64>,
    next_conn: Arc<AtomicU64>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            next_guest: Arc::new(AtomicI64::new(-1)),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Next unused negative identity. Strictly decreasing, never reused.
    pub fn allocate_guest_identity(&self) -> Identity {
        self.next_guest.fetch_sub(1, Ordering::Relaxed)
    }

    /// Allocate a handle for a new physical connection, plus its outbound buffer.
    pub fn open_connection(
        &self,
        identity: Identity,
        capacity: usize,
    ) -> (ConnectionHandle, tokio::sync::mpsc::Receiver<axum::extract::ws::Message>) {
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        ConnectionHandle::new(id, identity, capacity)
    }

    /// Register `conn` under its identity.
    ///
    /// The connection's private `init` frame (its identity plus the roster as
    /// of this registration) is queued before the lock is released, so it is
    /// always the first frame the client sees.
    ///
    /// Returns true only for the first connection of an authenticated
    /// identity; the caller announces the online transition.
    pub fn add_client(&self, conn: &ConnectionHandle, display_name: &str) -> bool {
        let identity = conn.identity();
        let mut state = self.write();

        let conns = state.connections.entry(identity).or_default();
        let first = conns.is_empty();
        conns.insert(conn.id(), conn.clone());

        let announce = first && !conn.is_guest();
        if announce {
            state.presence.insert(identity, display_name.to_string());
        }

        let online_users = roster(&state);
        if let Some(frame) = (WireEvent::Init {
            user_id: identity,
            online_users,
        })
        .to_frame()
        {
            conn.try_push(frame);
        }
        drop(state);

        tracing::debug!(
            identity,
            conn_id = conn.id(),
            first,
            "Connection registered"
        );
        announce
    }

    /// Unregister `conn`.
    ///
    /// Returns true only when this removed the last connection of an
    /// authenticated identity; the caller announces the offline transition.
    /// Removing an unknown connection is a no-op returning false.
    pub fn remove_client(&self, conn: &ConnectionHandle) -> bool {
        let identity = conn.identity();
        let mut state = self.write();

        let Some(conns) = state.connections.get_mut(&identity) else {
            return false;
        };
        if conns.remove(&conn.id()).is_none() {
            return false;
        }
        let last = conns.is_empty();
        if last {
            state.connections.remove(&identity);
        }
        let announce = last && state.presence.remove(&identity).is_some();
        drop(state);

        tracing::debug!(identity, conn_id = conn.id(), last, "Connection unregistered");
        announce
    }

    /// Snapshot of the presence map. No ordering guarantee.
    pub fn list_online(&self) -> Vec<OnlineUser> {
        roster(&self.read())
    }

    pub fn is_online(&self, identity: Identity) -> bool {
        self.read().presence.contains_key(&identity)
    }

    pub fn connection_count(&self, identity: Identity) -> usize {
        self.read()
            .connections
            .get(&identity)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Every live connection, regardless of identity.
    pub fn snapshot_all(&self) -> Vec<ConnectionHandle> {
        self.read()
            .connections
            .values()
            .flat_map(|conns| conns.values().cloned())
            .collect()
    }

    /// Every live connection of one identity.
    pub fn connections_of(&self, identity: Identity) -> Vec<ConnectionHandle> {
        self.read()
            .connections
            .get(&identity)
            .map(|conns| conns.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Close every live connection of `identity`. Each reader's teardown
    /// then unregisters its connection through the normal path.
    pub fn force_disconnect(&self, identity: Identity) -> usize {
        let targets = self.connections_of(identity);
        for conn in &targets {
            conn.close();
        }
        if !targets.is_empty() {
            tracing::info!(identity, closed = targets.len(), "Forced disconnect");
        }
        targets.len()
    }
}

fn roster(state: &RegistryState) -> Vec<OnlineUser> {
    state
        .presence
        .iter()
        .map(|(id, name)| OnlineUser {
            user_id: *id,
            nickname: name.clone(),
        })
        .collect()
}
