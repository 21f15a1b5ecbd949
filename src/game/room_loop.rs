//! The per-room simulation task: fixed-timestep physics with a capped
//! catch-up accumulator, throttled snapshot broadcasts, inactivity
//! reclamation, and terminal persistence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};
use tokio::time::sleep;

use crate::bus::{game_group, Outbound};
use crate::data::Side;
use crate::messages::ServerMessage;
use crate::App;

use super::{physics, RoomStatus, SharedRoom};

pub const PHYSICS_DT: f64 = 1.0 / 240.0;
pub const BROADCAST_DT: f64 = 1.0 / 60.0;
pub const MAX_FRAME_TIME: f64 = 0.25;
pub const MAX_UPDATES_PER_FRAME: u32 = 5;
pub const INACTIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// Grace period between `game_completed` and closing the sockets, so the
/// clients can render the final state.
const GAME_OVER_LINGER: Duration = Duration::from_secs(2);

enum Terminal {
    GameOver,
    Inactive,
}

/// Drive one room until it reaches a terminal state or its registry entry
/// disappears. Deleting the room from the registry is the cancellation
/// signal; the loop then exits without touching the store.
pub(super) async fn run(app: Arc<App>, room: SharedRoom) {
    let game_id = room.lock().await.game_id;
    let group = game_group(game_id);
    info!("game {game_id}: simulation loop started");

    let mut accumulator = 0.0_f64;
    let mut last_broadcast = f64::NEG_INFINITY;

    loop {
        if !app.registry.contains(game_id).await {
            break;
        }

        let iteration_start = Instant::now();
        let mut frames: Vec<ServerMessage> = Vec::new();
        let mut finished_match: Option<(i64, i64, i64, Side)> = None;
        let mut terminal: Option<Terminal> = None;
        let mut playing = false;

        {
            let mut state = room.lock().await;
            let now = Instant::now();
            let frame_time = now
                .duration_since(state.last_update_time)
                .as_secs_f64()
                .min(MAX_FRAME_TIME);
            state.last_update_time = now;

            if state.any_connected() {
                state.last_seen_connected = now;
            } else if now.duration_since(state.last_seen_connected) > INACTIVE_TIMEOUT {
                terminal = Some(Terminal::Inactive);
            }

            if terminal.is_none() && state.game_status == RoomStatus::Playing {
                playing = true;
                accumulator += frame_time;

                let mut scored = false;
                let mut updates = 0;
                while accumulator >= PHYSICS_DT && updates < MAX_UPDATES_PER_FRAME {
                    scored |= physics::step(&mut state, PHYSICS_DT).scored;
                    accumulator -= PHYSICS_DT;
                    updates += 1;
                }
                if accumulator > PHYSICS_DT {
                    // catch-up cap reached; drop the backlog rather than spiral
                    accumulator = PHYSICS_DT;
                }

                if scored && physics::check_match_end(&mut state) {
                    if let Some(winner) = state.winner {
                        finished_match = Some((
                            state.current_match,
                            state.left_paddle.score,
                            state.right_paddle.score,
                            winner,
                        ));
                    }

                    // status change first, then the snapshot that reflects it
                    frames.push(ServerMessage::GameStatusChanged {
                        status: state.game_status,
                        winner: state.winner,
                        reason: None,
                    });
                    let clock = state.clock();
                    let mut snapshot = state.snapshot();
                    snapshot.broadcast_time = Some(clock);
                    snapshot.physics_interval = Some(PHYSICS_DT);
                    frames.push(ServerMessage::GameState { state: snapshot });
                    last_broadcast = clock;

                    if state.game_status == RoomStatus::GameOver {
                        terminal = Some(Terminal::GameOver);
                    }
                } else {
                    let clock = state.clock();
                    if clock - last_broadcast >= BROADCAST_DT {
                        let mut snapshot = state.snapshot();
                        snapshot.broadcast_time = Some(clock);
                        snapshot.physics_interval = Some(PHYSICS_DT);
                        frames.push(ServerMessage::GameState { state: snapshot });
                        last_broadcast = clock;
                    }
                }
            }
        }

        if let Some((match_number, score_player1, score_player2, winner)) = finished_match {
            if let Err(e) = app
                .store
                .complete_match(game_id, match_number, score_player1, score_player2, winner)
                .await
            {
                error!("game {game_id}: failed to persist match {match_number}: {e:?}");
            }
        }

        for frame in frames {
            app.bus.group_frame(&group, frame).await;
        }

        match terminal {
            Some(Terminal::GameOver) => {
                finish(&app, &room, &group).await;
                break;
            }
            Some(Terminal::Inactive) => {
                reclaim(&app, &room).await;
                break;
            }
            None => {}
        }

        if playing {
            let elapsed = iteration_start.elapsed().as_secs_f64();
            let wait = PHYSICS_DT.min(BROADCAST_DT) / 2.0 - elapsed;
            if wait > 0.0 {
                sleep(Duration::from_secs_f64(wait)).await;
            } else {
                tokio::task::yield_now().await;
            }
        } else {
            sleep(Duration::from_secs_f64(BROADCAST_DT)).await;
        }
    }

    room.lock().await.loop_running = false;
    info!("game {game_id}: simulation loop stopped");
}

/// Persist a finished game, announce the result, give the clients a moment
/// to render it, then close both sockets normally.
async fn finish(app: &Arc<App>, room: &SharedRoom, group: &str) {
    let (game_id, outcome, winner, final_state) = {
        let state = room.lock().await;
        (
            state.game_id,
            state.outcome(),
            state.winner,
            state.snapshot(),
        )
    };

    let mut persisted = false;
    for attempt in 1..=3 {
        match app.store.finalize_game(outcome).await {
            Ok(_) => {
                persisted = true;
                break;
            }
            Err(e) => {
                error!("game {game_id}: persistence attempt {attempt} failed: {e:?}");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
    if !persisted {
        // keep the room alive; the disconnect path retries once everyone
        // is gone
        return;
    }

    app.bus
        .group_frame(
            group,
            ServerMessage::GameCompleted {
                winner,
                final_state,
            },
        )
        .await;
    sleep(GAME_OVER_LINGER).await;
    app.bus
        .group_send(
            group,
            Outbound::Close {
                code: 1000,
                reason: "game over".to_string(),
            },
        )
        .await;
    let _ = app.registry.delete(game_id).await;
}

/// Nobody has been connected for the inactivity window: persist whatever
/// terminal state the room reached and drop it.
async fn reclaim(app: &Arc<App>, room: &SharedRoom) {
    let (game_id, outcome, game_over) = {
        let state = room.lock().await;
        (
            state.game_id,
            state.outcome(),
            state.game_status == RoomStatus::GameOver,
        )
    };
    info!("game {game_id}: reclaiming inactive room");

    let result = if game_over {
        app.store.finalize_game(outcome).await.map(|_| ())
    } else {
        app.store.cancel_game(game_id).await
    };
    if let Err(e) = result {
        error!("game {game_id}: failed to persist reclaimed room: {e:?}");
    }

    let _ = app.registry.delete(game_id).await;
}
