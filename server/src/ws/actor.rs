use std::collections::HashSet;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, timeout_at, Instant};

use crate::auth::jwt;
use crate::presence::ConnectionSender;
use crate::state::AppState;
use crate::ws::broadcast;
use crate::ws::protocol::{self, ClientEvent, ServerEnvelope, ServerEvent};

/// Ping interval: server sends a WebSocket ping every 30 seconds.
/// Detects connections that died without a close frame.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Close the connection if no pong arrives within this window after a ping.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// A fresh connection must present a valid `authenticate` frame within
/// this window or the server closes it.
const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound frames buffered per connection. A consumer that falls this
/// far behind is closed rather than backpressuring senders.
const OUTBOUND_QUEUE: usize = 256;

/// Run the actor-per-connection pattern for one WebSocket.
///
/// Splits the socket into reader and writer halves:
/// - Writer task: owns the sink, forwards frames from the bounded
///   per-connection queue, closes the socket on queue overflow
/// - Reader loop: authenticates first, then dispatches protocol events
///
/// Every other part of the server reaches this client only through the
/// queue, via the handle registered in the presence registry.
pub async fn run_connection(socket: WebSocket, state: AppState) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let sender = ConnectionSender::new(tx);

    // Spawn writer task: forwards queued frames to the WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx, sender.clone()));

    let Some((auth_request_id, user_id)) =
        authenticate_session(&state, &sender, &mut ws_receiver).await
    else {
        writer_handle.abort();
        return;
    };

    let (handle, came_online) = state.presence.bind(&user_id, sender.clone());
    protocol::send_envelope(
        handle.sender(),
        &ServerEnvelope::reply(
            &auth_request_id,
            ServerEvent::Authenticated {
                user_id: user_id.clone(),
            },
        ),
    );

    tracing::info!(
        user_id = %user_id,
        connection_id = handle.id(),
        "WebSocket connection authenticated"
    );

    // Tell durable contacts about the offline -> online edge, then give
    // this session its snapshot of currently-online contacts.
    if came_online {
        let status_state = state.clone();
        let status_user = user_id.clone();
        tokio::spawn(async move {
            broadcast::announce_user_status(&status_state, &status_user, true).await;
        });
    }
    broadcast::send_contacts_snapshot(&state, &handle).await;

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_conn = sender.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_conn.is_closed() {
                break;
            }
            ping_conn.push(Message::Ping(vec![1, 2, 3, 4].into()));

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    ping_conn.push(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // Rooms this connection joined; unwound on close.
    let mut joined: HashSet<String> = HashSet::new();

    // Reader loop: process incoming WebSocket frames
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => match protocol::parse_frame(&text) {
                    Ok(envelope) => {
                        protocol::dispatch_authenticated(
                            &state,
                            &handle,
                            &mut joined,
                            &envelope.request_id,
                            envelope.event,
                        )
                        .await;
                    }
                    Err(e) => {
                        tracing::debug!(
                            user_id = %handle.user_id(),
                            error = %e,
                            "Dropping malformed frame"
                        );
                        protocol::send_error(
                            handle.sender(),
                            "",
                            "bad_envelope",
                            "could not parse frame".to_string(),
                        );
                    }
                },
                Message::Binary(_) => {
                    tracing::debug!(user_id = %handle.user_id(), "Ignoring binary frame");
                }
                Message::Pong(_) => {
                    // Pong received; notify the ping task
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    handle.push(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::debug!(
                        user_id = %handle.user_id(),
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    user_id = %handle.user_id(),
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                // Stream ended; client disconnected
                break;
            }
        }
    }

    // Cleanup: stop the writer and ping tasks
    writer_handle.abort();
    ping_handle.abort();

    // Leave every joined room and let remaining members see the change.
    for room in joined.drain() {
        if state.rooms.leave(&room, handle.user_id()) {
            broadcast::broadcast_room_presence_except(&state, &room, handle.id());
        }
    }

    // Only announce offline if this was the user's last connection.
    let went_offline = state.presence.record_disconnect(&handle);
    if went_offline {
        broadcast::announce_user_status(&state, handle.user_id(), false).await;
    }

    let session_secs = (Utc::now() - handle.opened_at()).num_seconds();
    tracing::info!(
        user_id = %handle.user_id(),
        connection_id = handle.id(),
        session_secs,
        "WebSocket connection closed"
    );
}

/// Drive the unauthenticated phase of a fresh connection.
///
/// Only `authenticate` is accepted; anything else gets an error reply
/// and the session stays unauthenticated. Returns the request id of the
/// accepted frame plus the verified user id, or None once the
/// connection ends or the deadline passes.
async fn authenticate_session(
    state: &AppState,
    sender: &ConnectionSender,
    ws_receiver: &mut SplitStream<WebSocket>,
) -> Option<(String, String)> {
    let deadline = Instant::now() + AUTH_TIMEOUT;

    loop {
        let frame = match timeout_at(deadline, ws_receiver.next()).await {
            Ok(frame) => frame,
            Err(_) => {
                tracing::debug!("Authentication timeout, closing connection");
                sender.push(Message::Close(Some(CloseFrame {
                    code: 4001,
                    reason: "Authentication timeout".into(),
                })));
                return None;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let envelope = match protocol::parse_frame(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::debug!(error = %e, "Dropping malformed frame");
                        protocol::send_error(
                            sender,
                            "",
                            "bad_envelope",
                            "could not parse frame".to_string(),
                        );
                        continue;
                    }
                };
                match envelope.event {
                    ClientEvent::Authenticate { token } => {
                        match verify_token(state, &token).await {
                            Ok(user_id) => return Some((envelope.request_id, user_id)),
                            Err(reason) => {
                                protocol::send_envelope(
                                    sender,
                                    &ServerEnvelope::reply(
                                        &envelope.request_id,
                                        ServerEvent::AuthError { reason },
                                    ),
                                );
                            }
                        }
                    }
                    _ => {
                        protocol::send_error(
                            sender,
                            &envelope.request_id,
                            "unauthenticated",
                            "authenticate before sending other events".to_string(),
                        );
                    }
                }
            }
            Some(Ok(Message::Ping(data))) => {
                sender.push(Message::Pong(data));
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Binary(_))) => {
                tracing::debug!("Ignoring binary frame before authentication");
            }
            Some(Ok(Message::Close(_))) | None => return None,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "Receive error before authentication");
                return None;
            }
        }
    }
}

/// Validate the bearer token and confirm its subject exists in the
/// store. Returns the user id, or a human-readable rejection reason.
async fn verify_token(state: &AppState, token: &str) -> Result<String, String> {
    if token.trim().is_empty() {
        return Err("missing token".to_string());
    }

    let claims = match jwt::validate_access_token(&state.jwt_secret, token) {
        Ok(claims) => claims,
        Err(e) => {
            let reason = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => "token expired",
                _ => "token invalid",
            };
            tracing::debug!(error = %e, "Token rejected");
            return Err(reason.to_string());
        }
    };

    let user_id = claims.sub;
    let lookup = {
        let store = state.store.clone();
        let uid = user_id.clone();
        tokio::task::spawn_blocking(move || store.find_user(&uid)).await
    };
    match lookup {
        Ok(Ok(Some(_))) => Ok(user_id),
        Ok(Ok(None)) => Err("unknown user".to_string()),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "User lookup failed during authentication");
            Err("storage error".to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "User lookup task failed during authentication");
            Err("storage error".to_string())
        }
    }
}

/// Writer task: forwards queued frames to the WebSocket sink.
///
/// Once the overflow flag is set the stream has a gap, so the client is
/// closed with a policy violation and must reconnect to resync.
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    sender: ConnectionSender,
) {
    while let Some(message) = rx.recv().await {
        if sender.is_overflowed() {
            tracing::warn!("Outbound queue overflow, closing connection");
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: 1008,
                    reason: "Outbound queue overflow".into(),
                })))
                .await;
            break;
        }
        if ws_sender.send(message).await.is_err() {
            // WebSocket send failed; connection is broken
            break;
        }
    }
}
