//! One task per `(player, game)` WebSocket: admission, the wait-for-opponent
//! countdown, inbound message handling, and disconnect/forfeit bookkeeping.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::bus::{game_group, ChannelId, Outbound};
use crate::data::{GameId, GameRecord, Side, UserId};
use crate::messages::{ClientMessage, ServerMessage};
use crate::App;

use super::{room_loop, RoomStatus, SharedRoom};

/// How long a lone player waits for their opponent, with a progress frame
/// every couple of seconds, before the game is cancelled.
const WAIT_FOR_OPPONENT_SECS: u64 = 10;
const WAIT_UPDATE_INTERVAL: u64 = 2;

const RATE_LIMIT_MESSAGES: usize = 30;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// Sliding-window message limiter, one per connection.
struct RateLimiter {
    max_messages: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl RateLimiter {
    fn new(max_messages: usize, window: Duration) -> RateLimiter {
        RateLimiter {
            max_messages,
            window,
            stamps: VecDeque::new(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        while let Some(&oldest) = self.stamps.front() {
            if now.duration_since(oldest) > self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
        if self.stamps.len() < self.max_messages {
            self.stamps.push_back(now);
            true
        } else {
            false
        }
    }
}

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

async fn send_frame(tx: &mut WsSender, frame: &ServerMessage) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    tx.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn close_socket(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

pub async fn handle_game_socket(
    app: Arc<App>,
    mut socket: WebSocket,
    game_id: GameId,
    token: Option<String>,
) {
    // Admission: authenticated, known game, actual participant.
    let user_id = match crate::auth::authenticate(&app.store, token.as_deref()).await {
        Some(user_id) => user_id,
        None => {
            close_socket(&mut socket, 4001, "authentication required").await;
            return;
        }
    };

    let game = match app.store.get_game(game_id).await {
        Ok(Some(game)) => game,
        Ok(None) => {
            close_socket(&mut socket, 4004, "game not found").await;
            return;
        }
        Err(e) => {
            error!("game {game_id}: lookup failed: {e:?}");
            close_socket(&mut socket, 4004, "game not found").await;
            return;
        }
    };

    let side = match game.side_of(user_id) {
        Some(side) => side,
        None => {
            close_socket(&mut socket, 4003, "not a participant in this game").await;
            return;
        }
    };

    if let Err(e) = session(app, socket, game, side, user_id).await {
        error!("game {game_id}: connection for user {user_id} failed: {e:?}");
    }
}

async fn session(
    app: Arc<App>,
    socket: WebSocket,
    game: GameRecord,
    side: Side,
    user_id: UserId,
) -> Result<()> {
    let game_id = game.id;
    let player_num: u8 = match side {
        Side::Player1 => 1,
        Side::Player2 => 2,
    };
    let group = game_group(game_id);

    let room = app.registry.get_or_create(&game).await;
    let (channel_id, mut outbound) = app.bus.register();
    app.bus.group_add(&group, channel_id);
    info!("game {game_id}: player {player_num} (user {user_id}) connected");

    let (change, snapshot) = {
        let mut state = room.lock().await;
        let change = state.set_connection(side, true);
        (change, state.snapshot())
    };

    let (mut ws_tx, ws_rx) = socket.split();
    let greeted: Result<()> = async {
        send_frame(
            &mut ws_tx,
            &ServerMessage::ConnectionEstablished {
                player_number: Some(player_num),
                game_id: Some(game_id),
                message: None,
            },
        )
        .await?;
        send_frame(&mut ws_tx, &ServerMessage::GameState { state: snapshot }).await?;
        Ok(())
    }
    .await;

    // even if the greeting fails, fall through to the disconnect
    // bookkeeping below so the room never keeps a ghost player
    let mut wait_task: Option<JoinHandle<()>> = None;
    match greeted {
        Ok(()) => {
            app.bus
                .group_frame(
                    &group,
                    ServerMessage::PlayerStatus {
                        player: player_num,
                        connected: true,
                    },
                )
                .await;
            if change.status_changed {
                app.bus
                    .group_frame(
                        &group,
                        ServerMessage::GameStatusChanged {
                            status: change.new_status,
                            winner: None,
                            reason: None,
                        },
                    )
                    .await;
            }

            if change.both_connected {
                ensure_loop(&app, &room, &game).await;
            } else {
                wait_task = Some(tokio::spawn(wait_for_opponent(
                    app.clone(),
                    room.clone(),
                    channel_id,
                    game_id,
                )));
            }

            run_session_loop(&app, &room, &game, side, player_num, ws_tx, ws_rx, &mut outbound)
                .await;
        }
        Err(e) => {
            warn!("game {game_id}: could not greet player {player_num}: {e:?}");
        }
    }

    if let Some(task) = wait_task {
        task.abort();
    }
    handle_disconnect(&app, &room, &game, side, player_num).await;
    app.bus.group_discard(&group, channel_id);
    app.bus.unregister(channel_id);
    info!("game {game_id}: player {player_num} disconnected");

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_session_loop(
    app: &Arc<App>,
    room: &SharedRoom,
    game: &GameRecord,
    side: Side,
    player_num: u8,
    mut ws_tx: WsSender,
    mut ws_rx: WsReceiver,
    outbound: &mut mpsc::Receiver<Outbound>,
) {
    let group = game_group(game.id);
    let mut limiter = RateLimiter::new(RATE_LIMIT_MESSAGES, RATE_LIMIT_WINDOW);

    loop {
        tokio::select! {
            delivery = outbound.recv() => {
                match delivery {
                    None => break,
                    Some(Outbound::Frame(frame)) => {
                        if let Err(e) = send_frame(&mut ws_tx, &frame).await {
                            warn!("game {}: write to player {player_num} failed: {e:?}", game.id);
                            break;
                        }
                    }
                    Some(Outbound::Close { code, reason }) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !limiter.allow() {
                            debug!("game {}: player {player_num} flooding, frame dropped", game.id);
                            continue;
                        }
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => {
                                if let Err(e) = handle_message(
                                    app, room, game, side, &group, message, &mut ws_tx,
                                )
                                .await
                                {
                                    error!(
                                        "game {}: error handling message from player {player_num}: {e:?}",
                                        game.id
                                    );
                                }
                            }
                            Err(e) => {
                                debug!("game {}: unparseable frame: {e}", game.id);
                                let _ = send_frame(
                                    &mut ws_tx,
                                    &ServerMessage::error("invalid message"),
                                )
                                .await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping/pong: nothing to do
                    Some(Err(e)) => {
                        warn!("game {}: read from player {player_num} failed: {e:?}", game.id);
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_message(
    app: &Arc<App>,
    room: &SharedRoom,
    game: &GameRecord,
    side: Side,
    group: &str,
    message: ClientMessage,
    ws_tx: &mut WsSender,
) -> Result<()> {
    match message {
        ClientMessage::PaddleMove { position } => {
            let mut state = room.lock().await;
            if !state.apply_paddle_move(side, position) {
                debug!("game {}: rejected paddle move to {position}", game.id);
            }
            // no broadcast; the next snapshot carries the new position
        }

        ClientMessage::StartGame => {
            let started = {
                let mut state = room.lock().await;
                if state.game_status == RoomStatus::Menu {
                    state.start_playing();
                    Some(state.current_match)
                } else {
                    None
                }
            };
            match started {
                Some(match_number) => {
                    app.store.start_match(game.id, match_number).await?;
                    app.bus
                        .group_frame(
                            group,
                            ServerMessage::GameStatusChanged {
                                status: RoomStatus::Playing,
                                winner: None,
                                reason: None,
                            },
                        )
                        .await;
                }
                None => {
                    send_frame(ws_tx, &ServerMessage::error("game is not in the menu")).await?;
                }
            }
        }

        ClientMessage::TogglePause => {
            let new_status = {
                let mut state = room.lock().await;
                match state.game_status {
                    RoomStatus::Playing => {
                        state.game_status = RoomStatus::Paused;
                        Some(RoomStatus::Paused)
                    }
                    RoomStatus::Paused => {
                        state.start_playing();
                        Some(RoomStatus::Playing)
                    }
                    _ => None,
                }
            };
            if let Some(status) = new_status {
                app.bus
                    .group_frame(
                        group,
                        ServerMessage::GameStatusChanged {
                            status,
                            winner: None,
                            reason: None,
                        },
                    )
                    .await;
            }
        }

        ClientMessage::NextMatch => {
            let next = {
                let mut state = room.lock().await;
                if state.game_status == RoomStatus::MatchOver {
                    state.reset_for_new_match();
                    let snapshot = state.snapshot();
                    let match_number = state.current_match;
                    state.start_playing();
                    Some((snapshot, match_number))
                } else {
                    None
                }
            };
            match next {
                Some((snapshot, match_number)) => {
                    app.store.start_match(game.id, match_number).await?;
                    app.bus
                        .group_frame(group, ServerMessage::GameState { state: snapshot })
                        .await;
                    app.bus
                        .group_frame(
                            group,
                            ServerMessage::GameStatusChanged {
                                status: RoomStatus::Playing,
                                winner: None,
                                reason: None,
                            },
                        )
                        .await;
                }
                None => {
                    send_frame(ws_tx, &ServerMessage::error("no finished match to continue"))
                        .await?;
                }
            }
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

/// Spawn the room loop exactly once per room, and move the stored game out
/// of `waiting` now that both players are here.
async fn ensure_loop(app: &Arc<App>, room: &SharedRoom, game: &GameRecord) {
    let spawn = {
        let mut state = room.lock().await;
        if state.loop_running {
            false
        } else {
            state.loop_running = true;
            true
        }
    };
    if !spawn {
        return;
    }

    if let Err(e) = app.store.mark_game_started(game.id).await {
        error!("game {}: failed to mark started: {e:?}", game.id);
    }
    tokio::spawn(room_loop::run(app.clone(), room.clone()));
}

/// Keep a lone player informed while their opponent connects; give up after
/// the deadline, cancel the game and close the socket.
async fn wait_for_opponent(app: Arc<App>, room: SharedRoom, channel: ChannelId, game_id: GameId) {
    for elapsed in 1..=WAIT_FOR_OPPONENT_SECS {
        sleep(Duration::from_secs(1)).await;

        if room.lock().await.both_connected() {
            return;
        }
        if elapsed % WAIT_UPDATE_INTERVAL == 0 {
            app.bus
                .send_to_channel(
                    channel,
                    Outbound::Frame(ServerMessage::WaitingForOpponent {
                        seconds_elapsed: elapsed,
                        seconds_remaining: WAIT_FOR_OPPONENT_SECS - elapsed,
                    }),
                )
                .await;
        }
    }

    // last-moment arrival still wins
    {
        let mut state = room.lock().await;
        if state.both_connected() {
            return;
        }
        state.game_status = RoomStatus::Cancelled;
    }

    info!("game {game_id}: opponent never arrived, cancelling");
    app.bus
        .send_to_channel(
            channel,
            Outbound::Frame(ServerMessage::Timeout {
                message: "Opponent did not join in time".to_string(),
            }),
        )
        .await;
    if let Err(e) = app.store.cancel_game(game_id).await {
        error!("game {game_id}: failed to cancel: {e:?}");
    }
    app.bus
        .send_to_channel(
            channel,
            Outbound::Close {
                code: 4000,
                reason: "opponent timeout".to_string(),
            },
        )
        .await;
    let _ = app.registry.delete(game_id).await;
}

/// Disconnect bookkeeping. Dropping out of a live rally forfeits: the
/// remaining player wins and the result is persisted immediately.
async fn handle_disconnect(
    app: &Arc<App>,
    room: &SharedRoom,
    game: &GameRecord,
    side: Side,
    player_num: u8,
) {
    let group = game_group(game.id);

    let (forfeit, change, status) = {
        let mut state = room.lock().await;
        let was_playing = state.game_status == RoomStatus::Playing;
        let change = state.set_connection(side, false);

        let forfeit = if was_playing {
            let winner = side.other();
            state.winner = Some(winner);
            state.game_status = RoomStatus::GameOver;
            Some((winner, state.outcome(), state.snapshot()))
        } else {
            None
        };
        (forfeit, change, state.game_status)
    };

    app.bus
        .group_frame(
            &group,
            ServerMessage::PlayerStatus {
                player: player_num,
                connected: false,
            },
        )
        .await;

    if let Some((winner, outcome, final_state)) = forfeit {
        warn!(
            "🏳️ game {}: player {player_num} dropped mid-play, {} wins by forfeit",
            game.id,
            winner.as_str()
        );
        app.bus
            .group_frame(
                &group,
                ServerMessage::ForceDisconnect {
                    reason: format!("Player {player_num} disconnected"),
                },
            )
            .await;
        app.bus
            .group_frame(
                &group,
                ServerMessage::GameStatusChanged {
                    status: RoomStatus::GameOver,
                    winner: Some(winner),
                    reason: Some(format!("Player {player_num} disconnected")),
                },
            )
            .await;

        match app.store.finalize_game(outcome).await {
            Ok(_) => {
                app.bus
                    .group_frame(
                        &group,
                        ServerMessage::GameCompleted {
                            winner: Some(winner),
                            final_state,
                        },
                    )
                    .await;
            }
            Err(e) => error!("game {}: failed to persist forfeit: {e:?}", game.id),
        }
    }

    // last player out tears the room down once it is terminal
    if !change.any_connected
        && matches!(
            status,
            RoomStatus::GameOver | RoomStatus::MatchOver | RoomStatus::Cancelled
        )
    {
        let outcome = { room.lock().await.outcome() };
        if status != RoomStatus::Cancelled {
            if let Err(e) = app.store.finalize_game(outcome).await {
                error!("game {}: failed to persist on teardown: {e:?}", game.id);
                return; // leave the room for the inactivity sweep to retry
            }
        }
        let _ = app.registry.delete(game.id).await;
    }
}
