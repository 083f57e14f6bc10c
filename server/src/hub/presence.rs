//! Presence state machine: Offline <-> Online per authenticated identity.
//!
//! The registry detects the 0->1 and 1->0 boundaries; this module turns a
//! detected boundary into its side effects (persisted status, presence
//! broadcast, roster announcement).
//!
//! Transitions of one identity are serialized by [`TransitionGates`]: the
//! gate is held from the registry update until the presence event is queued,
//! so a refresh cannot persist or announce an older transition last.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::Hub;
use crate::db::blocking;
use crate::db::models::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// Roster entry carried by `init` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: Identity,
    pub nickname: String,
}

type Gate = Arc<AsyncMutex<()>>;

/// Per-identity async locks ordering presence transitions.
///
/// Entries exist only while a transition holds or waits for the gate.
#[derive(Debug, Default)]
pub(crate) struct TransitionGates {
    gates: Mutex<HashMap<Identity, Gate>>,
}

impl TransitionGates {
    pub(crate) async fn lock(&self, identity: Identity) -> TransitionGuard<'_> {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
            gates.entry(identity).or_default().clone()
        };
        TransitionGuard {
            gates: self,
            identity,
            guard: Some(gate.lock_owned().await),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.gates.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

pub(crate) struct TransitionGuard<'a> {
    gates: &'a TransitionGates,
    identity: Identity,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut gates = self.gates.gates.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map still holds it: nobody is waiting.
        if gates
            .get(&self.identity)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(&self.identity);
        }
    }
}

/// Offline -> Online: persist and announce. The dispatcher follows the
/// presence event with `user_created` for rosters that have not seen the
/// identity yet.
pub(crate) async fn went_online(hub: &Hub, identity: Identity, display_name: &str) {
    persist(hub, identity, PresenceStatus::Online, display_name).await;
    hub.broadcast_presence(identity, display_name, PresenceStatus::Online)
        .await;
    tracing::info!(identity, display_name, "User online");
}

/// Online -> Offline: persist and announce.
pub(crate) async fn went_offline(hub: &Hub, identity: Identity, display_name: &str) {
    persist(hub, identity, PresenceStatus::Offline, display_name).await;
    hub.broadcast_presence(identity, display_name, PresenceStatus::Offline)
        .await;
    tracing::info!(identity, display_name, "User offline");
}

/// Failures are logged, never propagated.
async fn persist(hub: &Hub, identity: Identity, status: PresenceStatus, display_name: &str) {
    let store = hub.stores().presence.clone();
    let name = display_name.to_string();
    let result = blocking(move || store.set_presence(identity, status, &name)).await;
    if let Err(e) = result {
        tracing::warn!(
            identity,
            status = status.as_str(),
            error = %e,
            "Failed to persist presence"
        );
    }
}
