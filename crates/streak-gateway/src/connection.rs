use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use streak_db::Database;
use streak_types::events::{FeedCommand, FeedEvent, FeedFilter, frame_preview};

use crate::dispatcher::{ConnectionNotice, Dispatcher};
use crate::filter::{ActiveFilter, SubscribeError, authorize};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Work handed from the reader to the writer so that every frame goes out
/// in order.
enum Outbound {
    Subscribed(ActiveFilter),
    Unsubscribed,
    Event(FeedEvent),
}

/// Handle one `/realtime` connection: `Identify`, then any number of
/// `Subscribe`/`Unsubscribe` commands while matching changes stream out.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let Some((user_id, username)) = wait_for_identify(&mut receiver, &jwt_secret).await else {
        warn!("WebSocket client failed to identify, closing");
        let _ = send_event(&mut sender, &FeedEvent::Error {
            message: "authentication failed".into(),
        })
        .await;
        return;
    };

    let ready = FeedEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    let (conn_id, notices) = dispatcher.register_connection(user_id).await;
    info!(
        "{} ({}) connected to realtime, {} open",
        username,
        user_id,
        dispatcher.connection_count(user_id).await
    );
    run_connection_loop(sender, receiver, &dispatcher, notices, db, user_id).await;
    dispatcher.unregister_connection(user_id, conn_id).await;

    info!("{} ({}) disconnected from realtime", username, user_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: &Dispatcher,
    mut notices: mpsc::UnboundedReceiver<ConnectionNotice>,
    db: Arc<Database>,
    user_id: Uuid,
) {
    let mut changes_rx = dispatcher.subscribe();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward matching changes, command replies and heartbeats -> client
    let mut send_task = tokio::spawn(async move {
        let mut active: Option<ActiveFilter> = None;
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            // Notices and replies go first so a change never overtakes the
            // filter update it depends on.
            tokio::select! {
                biased;

                Some(out) = out_rx.recv() => {
                    let event = match out {
                        Outbound::Subscribed(resolved) => {
                            let filter = resolved.filter;
                            active = Some(resolved);
                            FeedEvent::Subscribed { filter }
                        }
                        Outbound::Unsubscribed => {
                            active = None;
                            continue;
                        }
                        Outbound::Event(event) => event,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Some(notice) = notices.recv() => match notice {
                    ConnectionNotice::JoinedGroup(group_id) => {
                        if let Some(active) = active.as_mut() {
                            active.joined_group(group_id);
                        }
                    }
                },
                result = changes_rx.recv() => {
                    let change = match result {
                        Ok(change) => change,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Change receiver for {} lagged by {} events", user_id, n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    let admitted = active.as_ref().is_some_and(|a| a.admits(&change.message));
                    if !admitted {
                        continue;
                    }
                    trace!("Delivering message {} to {}", change.message.id, user_id);
                    if send_event(&mut sender, &FeedEvent::Change { event: change }).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from client
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<FeedCommand>(&text) {
                    Ok(cmd) => {
                        let out = handle_command(&db, user_id, cmd).await;
                        if out_tx.send(out).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            user_id,
                            e,
                            frame_preview(&text, 200)
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

async fn handle_command(db: &Arc<Database>, user_id: Uuid, cmd: FeedCommand) -> Outbound {
    match cmd {
        FeedCommand::Identify { .. } => Outbound::Event(FeedEvent::Error {
            message: "already identified".into(),
        }),

        FeedCommand::Subscribe { filter } => match resolve(db, user_id, filter).await {
            Ok(active) => {
                info!("{} subscribed to {}", user_id, filter);
                Outbound::Subscribed(active)
            }
            Err(e) => {
                warn!("{} subscribe to {} refused: {}", user_id, filter, e);
                Outbound::Event(FeedEvent::Error {
                    message: e.to_string(),
                })
            }
        },

        FeedCommand::Unsubscribe => {
            debug!("{} unsubscribed", user_id);
            Outbound::Unsubscribed
        }
    }
}

async fn resolve(db: &Arc<Database>, user_id: Uuid, filter: FeedFilter) -> Result<ActiveFilter, SubscribeError> {
    let db = db.clone();
    tokio::task::spawn_blocking(move || authorize(&db, user_id, filter))
        .await
        .map_err(|e| SubscribeError::Storage(e.into()))?
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(Uuid, String)> {
    use jsonwebtoken::{DecodingKey, Validation, decode};
    use streak_types::api::Claims;

    let timeout = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(FeedCommand::Identify { token }) = serde_json::from_str::<FeedCommand>(&text) {
                    let token_data = decode::<Claims>(
                        &token,
                        &DecodingKey::from_secret(jwt_secret.as_bytes()),
                        &Validation::default(),
                    )
                    .ok()?;

                    return Some((token_data.claims.sub, token_data.claims.username));
                }
            }
        }
        None
    });

    timeout.await.ok().flatten()
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &FeedEvent) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode feed event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
