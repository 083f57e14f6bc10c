//! Single-consumer sequencer for every multi-recipient send.
//!
//! Producers never take the registry lock to fan out; they enqueue here.
//! Three independent inputs feed one loop:
//! - generic broadcasts: bounded, `try_send`, dropped when saturated
//! - presence transitions: bounded, producers wait for room
//! - forced disconnects: unbounded control queue

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::presence::PresenceStatus;
use super::registry::Registry;
use crate::db::models::Identity;
use crate::ws::events::WireEvent;

#[derive(Debug, Clone)]
pub struct PresenceChange {
    pub identity: Identity,
    pub display_name: String,
    pub status: PresenceStatus,
}

impl PresenceChange {
    /// Events fanned out for this transition, in order. Coming online also
    /// announces the identity so rosters can add it.
    fn into_events(self) -> Vec<WireEvent> {
        let presence = WireEvent::Presence {
            user_id: self.identity,
            status: self.status,
            nickname: (!self.display_name.is_empty()).then(|| self.display_name.clone()),
        };
        match self.status {
            PresenceStatus::Online => vec![
                presence,
                WireEvent::UserCreated {
                    user_id: self.identity,
                    username: self.display_name,
                },
            ],
            PresenceStatus::Offline => vec![presence],
        }
    }
}

#[derive(Debug)]
enum Control {
    ForceDisconnect(Identity),
}

/// Outcome of one fan-out pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
}

/// Producer side of the dispatcher. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    broadcast_tx: mpsc::Sender<WireEvent>,
    presence_tx: mpsc::Sender<PresenceChange>,
    control_tx: mpsc::UnboundedSender<Control>,
}

/// Consumer side; drive it with [`DispatchLoop::run`].
pub struct DispatchLoop {
    registry: Registry,
    broadcast_rx: mpsc::Receiver<WireEvent>,
    presence_rx: mpsc::Receiver<PresenceChange>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Dispatcher {
    pub fn new(
        registry: Registry,
        broadcast_queue: usize,
        presence_queue: usize,
    ) -> (Self, DispatchLoop) {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(broadcast_queue.max(1));
        let (presence_tx, presence_rx) = mpsc::channel(presence_queue.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        (
            Self {
                broadcast_tx,
                presence_tx,
                control_tx,
            },
            DispatchLoop {
                registry,
                broadcast_rx,
                presence_rx,
                control_rx,
            },
        )
    }

    /// Build the dispatcher and spawn its loop on the current runtime.
    pub fn spawn(
        registry: Registry,
        broadcast_queue: usize,
        presence_queue: usize,
    ) -> (Self, JoinHandle<()>) {
        let (dispatcher, dispatch_loop) = Self::new(registry, broadcast_queue, presence_queue);
        let handle = tokio::spawn(dispatch_loop.run());
        (dispatcher, handle)
    }

    /// Queue `event` for every live connection. Never waits: returns false
    /// and drops the event when the queue is saturated.
    pub fn broadcast(&self, event: WireEvent) -> bool {
        match self.broadcast_tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::debug!(event = event.kind(), "Broadcast queue full, dropping event");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a presence transition, waiting for room if necessary.
    pub async fn presence(&self, change: PresenceChange) -> bool {
        self.presence_tx.send(change).await.is_ok()
    }

    pub fn force_disconnect(&self, identity: Identity) -> bool {
        self.control_tx
            .send(Control::ForceDisconnect(identity))
            .is_ok()
    }
}

impl DispatchLoop {
    /// Runs until every producer handle has been dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(control) = self.control_rx.recv() => match control {
                    Control::ForceDisconnect(identity) => {
                        self.registry.force_disconnect(identity);
                    }
                },
                Some(change) = self.presence_rx.recv() => {
                    for event in change.into_events() {
                        fan_out(&self.registry, &event);
                    }
                }
                Some(event) = self.broadcast_rx.recv() => {
                    fan_out(&self.registry, &event);
                }
                else => break,
            }
        }
        tracing::debug!("Dispatcher loop stopped");
    }
}

/// Push one event into every registered connection's buffer without waiting.
/// Serialization happens once; the registry lock is released before any push.
pub fn fan_out(registry: &Registry, event: &WireEvent) -> FanOut {
    let Some(frame) = event.to_frame() else {
        return FanOut::default();
    };
    let targets = registry.snapshot_all();

    let mut result = FanOut::default();
    for conn in &targets {
        if conn.try_push(frame.clone()) {
            result.delivered += 1;
        } else {
            result.dropped += 1;
        }
    }
    if result.dropped > 0 {
        tracing::debug!(
            event = event.kind(),
            delivered = result.delivered,
            dropped = result.dropped,
            "Fan-out dropped frames for slow connections"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::connection::ConnectionHandle;
    use axum::extract::ws::Message;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::timeout;

    fn decode(frame: Message) -> WireEvent {
        match frame {
            Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn reaction(post_id: i64) -> WireEvent {
        WireEvent::PostReaction {
            post_id,
            likes: post_id,
            dislikes: 0,
        }
    }

    fn post_id(frame: Message) -> i64 {
        match decode(frame) {
            WireEvent::PostReaction { post_id, .. } => post_id,
            other => panic!("expected post_reaction, got {other:?}"),
        }
    }

    fn join(
        registry: &Registry,
        identity: Identity,
        name: &str,
    ) -> (ConnectionHandle, Receiver<Message>) {
        let (conn, mut rx) = registry.open_connection(identity, 16);
        registry.add_client(&conn, name);
        // Discard the private init frame.
        assert!(matches!(decode(rx.try_recv().unwrap()), WireEvent::Init { .. }));
        (conn, rx)
    }

    #[tokio::test]
    async fn test_saturated_connection_loses_only_its_overflow() {
        let registry = Registry::new();
        let (dispatcher, _task) = Dispatcher::spawn(registry.clone(), 64, 64);
        let (_slow, mut slow_rx) = join(&registry, 1, "slow");
        let (_fast, mut fast_rx) = join(&registry, 2, "fast");

        let collector = tokio::spawn(async move {
            let mut got = Vec::new();
            while got.len() < 17 {
                match fast_rx.recv().await {
                    Some(frame) => got.push(post_id(frame)),
                    None => break,
                }
            }
            got
        });

        for i in 1..=17 {
            assert!(dispatcher.broadcast(reaction(i)));
        }

        let fast_got = timeout(Duration::from_secs(2), collector)
            .await
            .expect("fast connection should receive all events")
            .unwrap();
        assert_eq!(fast_got, (1..=17).collect::<Vec<_>>());

        let mut slow_got = Vec::new();
        while let Ok(frame) = slow_rx.try_recv() {
            slow_got.push(post_id(frame));
        }
        assert_eq!(slow_got, (1..=16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_torn_down_connection_receives_nothing() {
        let registry = Registry::new();
        let (dispatcher, _task) = Dispatcher::spawn(registry.clone(), 64, 64);
        let (gone, mut gone_rx) = join(&registry, 1, "gone");
        let (_witness, mut witness_rx) = join(&registry, 2, "witness");

        assert!(registry.remove_client(&gone));
        assert!(dispatcher.broadcast(reaction(9)));
        assert!(
            dispatcher
                .presence(PresenceChange {
                    identity: 1,
                    display_name: "gone".to_string(),
                    status: PresenceStatus::Offline,
                })
                .await
        );

        for _ in 0..2 {
            timeout(Duration::from_secs(2), witness_rx.recv())
                .await
                .expect("witness should receive both events")
                .unwrap();
        }
        assert!(gone_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_presence_events_keep_enqueue_order() {
        let registry = Registry::new();
        let (dispatcher, _task) = Dispatcher::spawn(registry.clone(), 64, 64);
        let (_watcher, mut rx) = join(&registry, 100, "watcher");

        let changes = [
            (1, PresenceStatus::Online),
            (2, PresenceStatus::Online),
            (1, PresenceStatus::Offline),
            (3, PresenceStatus::Online),
        ];
        for (identity, status) in changes {
            dispatcher
                .presence(PresenceChange {
                    identity,
                    display_name: format!("user{identity}"),
                    status,
                })
                .await;
        }

        let mut seen = Vec::new();
        let mut announced = Vec::new();
        while seen.len() < changes.len() {
            let frame = timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            match decode(frame) {
                WireEvent::Presence {
                    user_id,
                    status,
                    nickname,
                } => {
                    assert_eq!(nickname, Some(format!("user{user_id}")));
                    seen.push((user_id, status));
                }
                WireEvent::UserCreated { user_id, username } => {
                    // Always directly after the matching online presence.
                    assert_eq!(seen.last(), Some(&(user_id, PresenceStatus::Online)));
                    assert_eq!(username, format!("user{user_id}"));
                    announced.push(user_id);
                }
                other => panic!("expected presence, got {other:?}"),
            }
        }
        assert_eq!(seen, changes);
        assert_eq!(announced.len(), 2);
    }

    #[tokio::test]
    async fn test_broadcast_drops_but_presence_waits_when_saturated() {
        let registry = Registry::new();
        let (dispatcher, dispatch_loop) = Dispatcher::new(registry.clone(), 1, 1);

        assert!(dispatcher.broadcast(reaction(1)));
        assert!(!dispatcher.broadcast(reaction(2)));

        let change = PresenceChange {
            identity: 5,
            display_name: "five".to_string(),
            status: PresenceStatus::Online,
        };
        assert!(dispatcher.presence(change.clone()).await);

        // Queue is full and nobody drains it yet: the producer waits.
        let pending = timeout(Duration::from_millis(50), dispatcher.presence(change.clone())).await;
        assert!(pending.is_err());

        tokio::spawn(dispatch_loop.run());
        let delivered = timeout(Duration::from_secs(2), dispatcher.presence(change)).await;
        assert!(matches!(delivered, Ok(true)));
    }

    #[tokio::test]
    async fn test_force_disconnect_is_sequenced_through_loop() {
        let registry = Registry::new();
        let (dispatcher, _task) = Dispatcher::spawn(registry.clone(), 64, 64);
        let (tab, _rx) = join(&registry, 8, "eight");

        assert!(dispatcher.force_disconnect(8));
        timeout(Duration::from_secs(2), tab.closed())
            .await
            .expect("connection should be closed by the dispatcher");
    }

    #[test]
    fn test_fan_out_counts_delivered_and_dropped() {
        let registry = Registry::new();
        let (full, _full_rx) = registry.open_connection(1, 1);
        registry.add_client(&full, "full");
        let (_ok, _ok_rx) = {
            let (conn, mut rx) = registry.open_connection(2, 4);
            registry.add_client(&conn, "ok");
            rx.try_recv().unwrap();
            (conn, rx)
        };

        let result = fan_out(&registry, &reaction(3));
        assert_eq!(
            result,
            FanOut {
                delivered: 1,
                dropped: 1
            }
        );
    }
}
