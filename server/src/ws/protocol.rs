use crate::db::blocking;
use crate::db::models::{ChatMessage, Identity};
use crate::hub::{ConnectionHandle, Hub};
use crate::ws::events::{decode_command, Command, WireEvent};

/// Connection-local failures. The `Display` text is sent back to the
/// offending connection as an `error` event; the connection stays open.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Guests cannot send messages")]
    GuestCommand,
    #[error("Malformed message")]
    Malformed,
    #[error("Unsupported frame type")]
    UnsupportedFrame,
    #[error("Unknown message type")]
    UnknownType(String),
    #[error("Invalid recipient or empty content")]
    InvalidPayload,
    #[error("Message too long")]
    TooLong,
    #[error("Recipient not found")]
    RecipientNotFound,
    #[error("Failed to save message")]
    PersistFailed,
}

/// Handle one inbound text frame from `conn`.
pub async fn handle_text_frame(text: &str, conn: &ConnectionHandle, hub: &Hub) {
    let result = if conn.is_guest() {
        Err(ProtocolError::GuestCommand)
    } else {
        match decode_command(text) {
            Ok(command) => dispatch_command(command, conn, hub).await,
            Err(e) => Err(e),
        }
    };

    if let Err(e) = result {
        reply_error(conn, &e);
    }
}

/// Report a protocol error to `conn` only.
pub fn reply_error(conn: &ConnectionHandle, error: &ProtocolError) {
    tracing::debug!(
        identity = conn.identity(),
        conn_id = conn.id(),
        error = ?error,
        "Rejected inbound frame"
    );
    if let Some(frame) = WireEvent::error(error.to_string()).to_frame() {
        conn.try_push(frame);
    }
}

async fn dispatch_command(
    command: Command,
    conn: &ConnectionHandle,
    hub: &Hub,
) -> Result<(), ProtocolError> {
    match command {
        Command::Message { to, content } => {
            send_chat_message(hub, conn.identity(), to, content).await?;
            Ok(())
        }
    }
}

/// Persist a private message and deliver it to every connection of the
/// recipient plus every connection of the sender. A message to oneself is
/// delivered once per connection.
pub async fn send_chat_message(
    hub: &Hub,
    from: Identity,
    to: Identity,
    content: String,
) -> Result<ChatMessage, ProtocolError> {
    let users = hub.stores().users.clone();
    let recipient = blocking(move || users.user_by_id(to))
        .await
        .map_err(|e| {
            tracing::warn!(from, to, error = %e, "Recipient lookup failed");
            ProtocolError::RecipientNotFound
        })?;
    if recipient.is_none() {
        return Err(ProtocolError::RecipientNotFound);
    }

    let messages = hub.stores().messages.clone();
    let body = content.clone();
    let stored = blocking(move || messages.insert_message(from, to, &body))
        .await
        .map_err(|e| {
            tracing::warn!(from, to, error = %e, "Failed to persist chat message");
            ProtocolError::PersistFailed
        })?;

    let message = ChatMessage {
        id: stored.id,
        from,
        to,
        content,
        created_at: stored.created_at,
    };

    if let Some(frame) = WireEvent::Message(message.clone()).to_frame() {
        let delivered = hub.send_to_identity(to, &frame);
        let echoed = if to == from {
            0
        } else {
            hub.send_to_identity(from, &frame)
        };
        tracing::debug!(
            message_id = message.id,
            from,
            to,
            delivered,
            echoed,
            "Chat message routed"
        );
    }

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::seed_user;
    use crate::hub::test_support::{decode, hub, next_event};
    use axum::extract::ws::Message;
    use tokio::sync::mpsc::Receiver;

    fn join(hub: &Hub, identity: Identity, name: &str) -> (ConnectionHandle, Receiver<Message>) {
        let (conn, mut rx) = hub.open_connection(identity);
        hub.registry().add_client(&conn, name);
        assert!(matches!(decode(rx.try_recv().unwrap()), WireEvent::Init { .. }));
        (conn, rx)
    }

    fn message_count(db: &crate::db::DbPool) -> i64 {
        db.lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap()
    }

    async fn expect_error(rx: &mut Receiver<Message>, expected: &str) {
        match next_event(rx).await {
            WireEvent::Error { message } => assert_eq!(message, expected),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_reaches_recipient_and_sender_tabs() {
        let (hub, db) = hub();
        seed_user(&db, 1, "alice");
        seed_user(&db, 2, "bob");
        let (alice, mut alice_rx) = join(&hub, 1, "alice");
        let (_alice_tab2, mut alice_tab2_rx) = join(&hub, 1, "alice");
        let (_bob, mut bob_rx) = join(&hub, 2, "bob");

        handle_text_frame(r#"{"type":"message","to":2,"content":"hi"}"#, &alice, &hub).await;

        let at_bob = next_event(&mut bob_rx).await;
        let at_alice = next_event(&mut alice_rx).await;
        let at_alice_tab2 = next_event(&mut alice_tab2_rx).await;
        assert_eq!(at_bob, at_alice);
        assert_eq!(at_alice, at_alice_tab2);
        match at_bob {
            WireEvent::Message(msg) => {
                assert_eq!((msg.from, msg.to), (1, 2));
                assert_eq!(msg.content, "hi");
                assert!(msg.id > 0);
                assert!(chrono::DateTime::parse_from_rfc3339(&msg.created_at).is_ok());
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert_eq!(message_count(&db), 1);
    }

    #[tokio::test]
    async fn test_offline_recipient_still_gets_persisted_message() {
        let (hub, db) = hub();
        seed_user(&db, 1, "alice");
        seed_user(&db, 2, "bob");
        let (alice, mut alice_rx) = join(&hub, 1, "alice");

        handle_text_frame(r#"{"type":"message","to":"2","content":"later"}"#, &alice, &hub).await;

        assert!(matches!(next_event(&mut alice_rx).await, WireEvent::Message(_)));
        assert_eq!(message_count(&db), 1);
    }

    #[tokio::test]
    async fn test_message_to_self_is_delivered_once() {
        let (hub, db) = hub();
        seed_user(&db, 1, "alice");
        let (alice, mut alice_rx) = join(&hub, 1, "alice");

        handle_text_frame(r#"{"type":"message","to":1,"content":"note"}"#, &alice, &hub).await;

        assert!(matches!(next_event(&mut alice_rx).await, WireEvent::Message(_)));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_guest_command_is_rejected_without_persisting() {
        let (hub, db) = hub();
        seed_user(&db, 1, "alice");
        let (_alice, mut alice_rx) = join(&hub, 1, "alice");
        let guest = hub.allocate_guest_identity();
        let (guest_conn, mut guest_rx) = join(&hub, guest, "");

        handle_text_frame(r#"{"type":"message","to":1,"content":"hi"}"#, &guest_conn, &hub).await;

        expect_error(&mut guest_rx, "Guests cannot send messages").await;
        assert!(alice_rx.try_recv().is_err());
        assert_eq!(message_count(&db), 0);
    }

    #[tokio::test]
    async fn test_unknown_recipient_is_reported() {
        let (hub, db) = hub();
        seed_user(&db, 1, "alice");
        let (alice, mut alice_rx) = join(&hub, 1, "alice");

        handle_text_frame(r#"{"type":"message","to":99,"content":"hi"}"#, &alice, &hub).await;

        expect_error(&mut alice_rx, "Recipient not found").await;
        assert_eq!(message_count(&db), 0);
    }

    #[tokio::test]
    async fn test_protocol_errors_are_reported_to_sender_only() {
        let (hub, db) = hub();
        seed_user(&db, 1, "alice");
        seed_user(&db, 2, "bob");
        let (alice, mut alice_rx) = join(&hub, 1, "alice");
        let (_bob, mut bob_rx) = join(&hub, 2, "bob");

        handle_text_frame(r#"{"type":"typing"}"#, &alice, &hub).await;
        expect_error(&mut alice_rx, "Unknown message type").await;

        handle_text_frame(r#"{"type":"message","to":2,"content":""}"#, &alice, &hub).await;
        expect_error(&mut alice_rx, "Invalid recipient or empty content").await;

        handle_text_frame("{oops", &alice, &hub).await;
        expect_error(&mut alice_rx, "Malformed message").await;

        assert!(bob_rx.try_recv().is_err());
        assert_eq!(message_count(&db), 0);
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported() {
        let (hub, db) = hub();
        seed_user(&db, 1, "alice");
        seed_user(&db, 2, "bob");
        let (alice, mut alice_rx) = join(&hub, 1, "alice");
        db.lock()
            .unwrap()
            .execute_batch("DROP TABLE messages")
            .unwrap();

        handle_text_frame(r#"{"type":"message","to":2,"content":"hi"}"#, &alice, &hub).await;

        expect_error(&mut alice_rx, "Failed to save message").await;
    }
}
