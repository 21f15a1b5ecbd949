//! The matchmaking socket: queue membership for one player, plus the
//! periodic pairing tick. Every connected session runs the tick, but only
//! the holder of the bus lock actually pairs, so a fleet of workers never
//! double-matches.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::time::sleep;

use crate::auth;
use crate::bus::user_group;
use crate::data::{MatchMade, UserId};
use crate::messages::{ClientMessage, ServerMessage};
use crate::App;

const PAIRING_INTERVAL: Duration = Duration::from_secs(5);
const PAIRING_LOCK: &str = "matchmaking_lock";
const PAIRING_LOCK_TTL: Duration = Duration::from_secs(10);

const MATCHMAKING_GROUP: &str = "matchmaking";

type WsSender = SplitSink<WebSocket, Message>;

async fn send_frame(tx: &mut WsSender, frame: &ServerMessage) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    tx.send(Message::Text(json.into())).await?;
    Ok(())
}

pub async fn handle_matchmaking_socket(app: Arc<App>, mut socket: WebSocket, token: Option<String>) {
    let user_id = match auth::authenticate(&app.store, token.as_deref()).await {
        Some(user_id) => user_id,
        None => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 4001,
                    reason: "authentication required".into(),
                })))
                .await;
            return;
        }
    };

    if let Err(e) = session(app, socket, user_id).await {
        error!("matchmaking: connection for user {user_id} failed: {e:?}");
    }
}

async fn session(app: Arc<App>, socket: WebSocket, user_id: UserId) -> Result<()> {
    let (channel_id, mut outbound) = app.bus.register();
    app.bus.group_add(MATCHMAKING_GROUP, channel_id);
    app.bus.group_add(&user_group(user_id), channel_id);
    info!("matchmaking: user {user_id} connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let greeted: Result<()> = async {
        send_frame(
            &mut ws_tx,
            &ServerMessage::ConnectionEstablished {
                player_number: None,
                game_id: None,
                message: Some("Connected to matchmaking server".to_string()),
            },
        )
        .await?;
        let status = app.store.queue_status(user_id).await?;
        send_frame(&mut ws_tx, &ServerMessage::QueueStatus { status }).await?;
        Ok(())
    }
    .await;

    if let Err(e) = &greeted {
        warn!("matchmaking: could not greet user {user_id}: {e:?}");
    }

    let pairing_task = tokio::spawn(periodic_pairing(app.clone()));

    // a failed greeting still runs the teardown below
    while greeted.is_ok() {
        tokio::select! {
            delivery = outbound.recv() => {
                match delivery {
                    None => break,
                    Some(crate::bus::Outbound::Frame(frame)) => {
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(crate::bus::Outbound::Close { code, reason }) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                            .await;
                        break;
                    }
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => {
                                if let Err(e) =
                                    handle_message(&app, user_id, message, &mut ws_tx).await
                                {
                                    error!("matchmaking: error handling message from {user_id}: {e:?}");
                                    let _ = send_frame(
                                        &mut ws_tx,
                                        &ServerMessage::error("error processing your request"),
                                    )
                                    .await;
                                }
                            }
                            Err(e) => {
                                debug!("matchmaking: unparseable frame: {e}");
                                let _ = send_frame(&mut ws_tx, &ServerMessage::error("invalid message")).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("matchmaking: read from user {user_id} failed: {e:?}");
                        break;
                    }
                }
            }
        }
    }

    pairing_task.abort();

    // leaving the socket leaves the queue
    if let Err(e) = app.store.leave_queue(user_id).await {
        error!("matchmaking: failed to dequeue user {user_id}: {e:?}");
    }
    app.bus.group_discard(MATCHMAKING_GROUP, channel_id);
    app.bus.group_discard(&user_group(user_id), channel_id);
    app.bus.unregister(channel_id);
    info!("matchmaking: user {user_id} disconnected");

    Ok(())
}

async fn handle_message(
    app: &Arc<App>,
    user_id: UserId,
    message: ClientMessage,
    ws_tx: &mut WsSender,
) -> Result<()> {
    match message {
        ClientMessage::JoinQueue { difficulty } => {
            let status = app.store.join_queue(user_id, difficulty).await?;
            send_frame(ws_tx, &ServerMessage::QueueStatus { status }).await?;
        }
        ClientMessage::LeaveQueue => {
            app.store.leave_queue(user_id).await?;
            send_frame(
                ws_tx,
                &ServerMessage::QueueStatus {
                    status: crate::messages::QueueReport::LeftQueue,
                },
            )
            .await?;
        }
        ClientMessage::RequestStatus => {
            let status = app.store.queue_status(user_id).await?;
            send_frame(ws_tx, &ServerMessage::QueueStatus { status }).await?;
        }
        ClientMessage::Ping => {
            send_frame(ws_tx, &ServerMessage::Pong).await?;
        }
        _ => {
            send_frame(ws_tx, &ServerMessage::error("unsupported message on this socket"))
                .await?;
        }
    }
    Ok(())
}

/// The pairing tick. Whoever wins the lock runs one FIFO pairing pass and
/// fans the results out; everyone else just waits for the next tick.
async fn periodic_pairing(app: Arc<App>) {
    loop {
        if app.bus.try_acquire(PAIRING_LOCK, PAIRING_LOCK_TTL) {
            match app.store.find_matches().await {
                Ok(matches) => {
                    if !matches.is_empty() {
                        info!("🤝 matchmaking: created {} matches", matches.len());
                    }
                    for made in &matches {
                        announce(&app, made).await;
                    }
                }
                Err(e) => error!("matchmaking: pairing pass failed: {e:?}"),
            }
            app.bus.release(PAIRING_LOCK);
        }

        sleep(PAIRING_INTERVAL).await;
    }
}

async fn announce(app: &Arc<App>, made: &MatchMade) {
    let game_url = format!("/game/{}/", made.game_id);

    app.bus
        .group_frame(
            &user_group(made.player1.id),
            ServerMessage::MatchFound {
                game_id: made.game_id,
                player1: made.player1.username.clone(),
                player2: made.player2.username.clone(),
                opponent_avatar: made.player2.avatar.clone(),
                game_url: game_url.clone(),
            },
        )
        .await;
    app.bus
        .group_frame(
            &user_group(made.player2.id),
            ServerMessage::MatchFound {
                game_id: made.game_id,
                player1: made.player1.username.clone(),
                player2: made.player2.username.clone(),
                opponent_avatar: made.player1.avatar.clone(),
                game_url,
            },
        )
        .await;
}
