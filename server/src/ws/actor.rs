use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::db::models::Identity;
use crate::hub::{ConnectionHandle, Hub};
use crate::ws::protocol::{self, ProtocolError};

/// Serve one upgraded socket until it closes.
///
/// The socket is split: a spawned writer task owns the sink and drains the
/// connection's outbound buffer, while this task runs the reader loop.
/// Either side stopping closes the connection handle, which stops the other;
/// teardown then unregisters the connection exactly once.
pub async fn run_connection(
    socket: WebSocket,
    hub: Hub,
    identity: Identity,
    display_name: String,
) {
    let (sink, mut stream) = socket.split();
    let (conn, rx) = hub.open_connection(identity);

    hub.admit(&conn, &display_name).await;

    tracing::info!(
        identity,
        conn_id = conn.id(),
        display_name = %display_name,
        "WebSocket connection opened"
    );

    let writer_handle = tokio::spawn(writer_task(
        sink,
        rx,
        conn.clone(),
        hub.config().ping_interval(),
        hub.config().write_timeout(),
    ));

    reader_loop(&mut stream, &conn, &hub).await;

    hub.release(&conn, &display_name).await;
    conn.close();
    let _ = writer_handle.await;

    tracing::info!(identity, conn_id = conn.id(), "WebSocket connection closed");
}

/// Reads one frame at a time. Any received frame, pongs included, resets
/// the read deadline.
async fn reader_loop(stream: &mut SplitStream<WebSocket>, conn: &ConnectionHandle, hub: &Hub) {
    let read_timeout = hub.config().read_timeout();

    loop {
        let next = tokio::select! {
            _ = conn.closed() => break,
            next = timeout(read_timeout, stream.next()) => next,
        };

        match next {
            Ok(Some(Ok(msg))) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_frame(text.as_str(), conn, hub).await;
                }
                Message::Binary(_) => {
                    let error = if conn.is_guest() {
                        ProtocolError::GuestCommand
                    } else {
                        ProtocolError::UnsupportedFrame
                    };
                    protocol::reply_error(conn, &error);
                }
                // Pings are answered by the transport.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Close(frame) => {
                    tracing::debug!(
                        identity = conn.identity(),
                        conn_id = conn.id(),
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Ok(Some(Err(e))) => {
                tracing::debug!(
                    identity = conn.identity(),
                    conn_id = conn.id(),
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::info!(
                    identity = conn.identity(),
                    conn_id = conn.id(),
                    "Read deadline exceeded"
                );
                break;
            }
        }
    }
}

/// Drains the outbound buffer into the socket and sends a keep-alive ping
/// every `ping_every`. Every write is bounded by `write_timeout`; a failed or
/// stalled write closes the connection.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    conn: ConnectionHandle,
    ping_every: Duration,
    write_timeout: Duration,
) {
    let mut ping = interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            _ = conn.closed() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(
                    identity = conn.identity(),
                    conn_id = conn.id(),
                    error = %e,
                    "WebSocket write failed"
                );
                break;
            }
            Err(_) => {
                tracing::warn!(
                    identity = conn.identity(),
                    conn_id = conn.id(),
                    "WebSocket write deadline exceeded"
                );
                break;
            }
        }
    }

    conn.close();
    let _ = timeout(write_timeout, sink.close()).await;
}
