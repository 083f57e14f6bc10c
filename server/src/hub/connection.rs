use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::db::models::Identity;

/// Process-unique id of one physical connection.
pub type ConnId = u64;

/// Non-owning handle to a live connection.
///
/// The registry and the dispatcher hold clones of this; the per-connection
/// pump owns the receiving half of the outbound buffer and the socket itself.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnId,
    identity: Identity,
    tx: mpsc::Sender<Message>,
    closer: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle plus the receiving end of its bounded outbound buffer.
    pub fn new(id: ConnId, identity: Identity, capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id,
            identity,
            tx,
            closer: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn is_guest(&self) -> bool {
        self.identity < 0
    }

    /// Queue a frame without waiting. Returns false when the buffer is full
    /// or the pump has already gone away; the frame is dropped for this
    /// connection only.
    pub fn try_push(&self, frame: Message) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(
                    conn_id = self.id,
                    identity = self.identity,
                    "Outbound buffer full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Ask both pumps to stop. The reader's teardown unregisters the connection.
    pub fn close(&self) {
        self.closer.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called on any clone.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closer.cancelled()
    }
}
