//! WebSocket gateway: one task pair per connection.
//!
//! Inbound commands are parsed, rate limited and handed to the dispatcher.
//! Outbound frames flow through a bounded queue into a dedicated writer
//! task; a connection that cannot drain its queue is dropped rather than
//! allowed to stall a room.

use crate::dispatch::DispatchOutcome;
use crate::errors::GameError;
use crate::protocol::{parse_command, ClientOp, RawCommand, RoomEvent, ServerMessage, WireFrame};
use crate::rooms::RoomHandle;
use crate::server::session::AuthedUser;
use crate::server::AppState;
use crate::UserId;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Deserialize)]
pub struct WsQuery {
    token: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(app): State<AppState>,
) -> Response {
    match app.sessions.authenticate(&query.token) {
        Ok(user) => ws.on_upgrade(move |socket| handle_socket(socket, user, app)),
        Err(_) => (StatusCode::UNAUTHORIZED, "invalid token").into_response(),
    }
}

/// Per-connection command budget over a fixed one-second window.
struct RateLimiter {
    limit: u32,
    used: u32,
    window: Instant,
}

impl RateLimiter {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            used: 0,
            window: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        if self.window.elapsed() >= Duration::from_secs(1) {
            self.window = Instant::now();
            self.used = 0;
        }
        self.used += 1;
        self.used <= self.limit
    }
}

async fn handle_socket(socket: WebSocket, user: AuthedUser, app: AppState) {
    let (mut sink, mut stream) = socket.split();
    let queue_bound = app.services.config.server.outbound_queue_bound;
    let (out_tx, mut out_rx) = mpsc::channel::<String>(queue_bound);
    // Forward tasks flag a stalled queue here; the read loop then drops the
    // whole connection.
    let (drop_tx, mut drop_rx) = mpsc::channel::<()>(1);

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let heartbeat = tokio::spawn({
        let out_tx = out_tx.clone();
        let period = Duration::from_secs(app.services.config.server.heartbeat_secs);
        async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let frame = WireFrame::new(
                    &ServerMessage::Heartbeat {
                        timestamp: Utc::now().timestamp_millis(),
                    },
                    None,
                    0,
                );
                if out_tx.send(frame.to_json()).await.is_err() {
                    break;
                }
            }
        }
    });

    info!(user_id = %user.user_id, username = %user.username, "websocket connected");
    let balance = app.services.wallet.balance(&user.user_id);
    enqueue(&out_tx, &drop_tx, None, 0, &ServerMessage::Wallet { balance });

    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();
    let mut limiter = RateLimiter::new(app.services.config.server.commands_per_second);

    loop {
        let message = tokio::select! {
            message = stream.next() => message,
            _ = drop_rx.recv() => {
                warn!(user_id = %user.user_id, "dropping slow websocket client");
                break;
            }
        };
        let text = match message {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(user_id = %user.user_id, error = %e, "websocket read error");
                break;
            }
        };

        if !limiter.allow() {
            let err = GameError::RateLimited;
            enqueue(&out_tx, &drop_tx, None, 0, &ServerMessage::error(&err));
            continue;
        }

        let raw: RawCommand = match serde_json::from_str(&text) {
            Ok(raw) => raw,
            Err(e) => {
                let err = GameError::Validation(format!("malformed command: {}", e));
                enqueue(&out_tx, &drop_tx, None, 0, &ServerMessage::error(&err));
                continue;
            }
        };
        let room_id = raw.room_id.clone();

        match parse_command(&raw) {
            Err(e) => {
                enqueue(&out_tx, &drop_tx, room_id, 0, &ServerMessage::error(&e));
            }
            Ok(ClientOp::Subscribe) => {
                let Some(room_id) = room_id else {
                    let err = GameError::Validation("room_id is required".into());
                    enqueue(&out_tx, &drop_tx, None, 0, &ServerMessage::error(&err));
                    continue;
                };
                match app.registry.get(&room_id) {
                    Ok(handle) => {
                        subscribe(&app, &user, &out_tx, &drop_tx, &mut subscriptions, handle)
                            .await;
                    }
                    Err(e) => {
                        enqueue(
                            &out_tx,
                            &drop_tx,
                            Some(room_id),
                            0,
                            &ServerMessage::error(&e),
                        );
                    }
                }
            }
            Ok(ClientOp::Unsubscribe) => {
                if let Some(room_id) = room_id {
                    if let Some(task) = subscriptions.remove(&room_id) {
                        task.abort();
                        app.dispatcher.presence(&user.user_id, &room_id, false).await;
                    }
                }
            }
            Ok(op) => {
                match app
                    .dispatcher
                    .dispatch(&user.user_id, &user.username, room_id.as_deref(), op)
                    .await
                {
                    Ok(DispatchOutcome::RoomCreated(handle)) => {
                        subscribe(&app, &user, &out_tx, &drop_tx, &mut subscriptions, handle)
                            .await;
                    }
                    Ok(DispatchOutcome::None) => {}
                    Err(e) => {
                        enqueue(&out_tx, &drop_tx, room_id, 0, &ServerMessage::error(&e));
                    }
                }
            }
        }
    }

    for (room_id, task) in subscriptions {
        task.abort();
        app.dispatcher.presence(&user.user_id, &room_id, false).await;
    }
    heartbeat.abort();
    writer.abort();
    info!(user_id = %user.user_id, "websocket disconnected");
}

/// Subscribe the connection to a room: snapshot first, then live events.
/// The receiver is taken before the snapshot is read under the room lock, so
/// nothing can fall between them; events at or below the snapshot version
/// are filtered out by the forwarder.
async fn subscribe(
    app: &AppState,
    user: &AuthedUser,
    out_tx: &mpsc::Sender<String>,
    drop_tx: &mpsc::Sender<()>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
    handle: Arc<RoomHandle>,
) {
    if subscriptions.contains_key(&handle.id) {
        return;
    }
    let rx = handle.subscribe();
    let (snapshot, version) = {
        let room = handle.state.lock().await;
        (room.snapshot_for(&user.user_id), room.version)
    };
    for message in &snapshot {
        enqueue(out_tx, drop_tx, Some(handle.id.clone()), version, message);
    }
    let forwarder = tokio::spawn(forward_events(
        rx,
        out_tx.clone(),
        drop_tx.clone(),
        user.user_id.clone(),
        version,
    ));
    subscriptions.insert(handle.id.clone(), forwarder);
    app.dispatcher.presence(&user.user_id, &handle.id, true).await;
    debug!(user_id = %user.user_id, room_id = %handle.id, "subscribed");
}

/// Pump one room's events to one connection, keeping the recipient's private
/// messages and dropping everyone else's.
async fn forward_events(
    mut rx: broadcast::Receiver<RoomEvent>,
    out_tx: mpsc::Sender<String>,
    drop_tx: mpsc::Sender<()>,
    user_id: UserId,
    after_version: u64,
) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(user_id = %user_id, skipped, "subscriber lagged behind room events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        if event.version <= after_version {
            continue;
        }
        for message in &event.public {
            if !push(&out_tx, &drop_tx, &event, message) {
                return;
            }
        }
        for (owner, message) in &event.private {
            if owner == &user_id && !push(&out_tx, &drop_tx, &event, message) {
                return;
            }
        }
    }
}

fn push(
    out_tx: &mpsc::Sender<String>,
    drop_tx: &mpsc::Sender<()>,
    event: &RoomEvent,
    message: &ServerMessage,
) -> bool {
    let frame = WireFrame::new(message, Some(event.room_id.clone()), event.version);
    match out_tx.try_send(frame.to_json()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            // Stalled queue: tell the read loop to drop the connection.
            let _ = drop_tx.try_send(());
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

fn enqueue(
    out_tx: &mpsc::Sender<String>,
    drop_tx: &mpsc::Sender<()>,
    room_id: Option<String>,
    version: u64,
    message: &ServerMessage,
) {
    let frame = WireFrame::new(message, room_id, version);
    if out_tx.try_send(frame.to_json()).is_err() {
        let _ = drop_tx.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_window() {
        let mut limiter = RateLimiter::new(3);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow());
    }
}
