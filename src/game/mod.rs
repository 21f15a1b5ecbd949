//! In-memory state for live game rooms: the room registry, the room state
//! itself, and the factory that materializes a room from a stored game.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::data::{Difficulty, DifficultySettings, GameId, GameRecord, Side, UserId};

mod conn;
mod physics;
mod room_loop;

pub use conn::handle_game_socket;
pub use physics::{check_match_end, step, StepOutcome};

// Field geometry. Velocities are expressed in units per rendered frame at
// the 60 Hz reference rate; positions advance by `d * dt * 60`.
pub const BASE_WIDTH: f64 = 800.0;
pub const BASE_HEIGHT: f64 = 500.0;
pub const PADDLE_WIDTH: f64 = 18.0;
pub const PADDLE_HEIGHT: f64 = 100.0;
pub const BALL_RADIUS: f64 = 10.0;
pub const PADDLE_SPEED: f64 = 8.0;

pub const POINTS_TO_WIN_MATCH: i64 = 5;
pub const MATCHES_TO_WIN_GAME: i64 = 3;

/// Live status of a room. Serialized in the camelCase spelling the clients
/// render (`matchOver`, `gameOver`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomStatus {
    Waiting,
    Menu,
    Playing,
    Paused,
    MatchOver,
    GameOver,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ball {
    pub x: f64,
    pub y: f64,
    pub dx: f64,
    pub dy: f64,
    pub speed: f64,
    pub radius: f64,
    pub prev_x: f64,
    pub prev_y: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Paddle {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub speed: f64,
    pub score: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchWins {
    pub player1: i64,
    pub player2: i64,
}

impl MatchWins {
    pub fn on(&self, side: Side) -> i64 {
        match side {
            Side::Player1 => self.player1,
            Side::Player2 => self.player2,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PlayerSlot {
    pub id: UserId,
    pub connected: bool,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Players {
    pub player1: PlayerSlot,
    pub player2: PlayerSlot,
}

impl Players {
    fn slot_mut(&mut self, side: Side) -> &mut PlayerSlot {
        match side {
            Side::Player1 => &mut self.player1,
            Side::Player2 => &mut self.player2,
        }
    }
}

/// Serialized copy of a room, broadcast to both clients for rendering.
/// `broadcast_time`/`physics_interval` are attached by the room loop so the
/// client can interpolate between snapshots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub game_id: GameId,
    pub ball: Ball,
    pub left_paddle: Paddle,
    pub right_paddle: Paddle,
    pub match_wins: MatchWins,
    pub current_match: i64,
    pub game_status: RoomStatus,
    pub winner: Option<Side>,
    pub players: Players,
    pub difficulty: Difficulty,
    pub settings: DifficultySettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broadcast_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub physics_interval: Option<f64>,
}

/// What changed when a player's connection flag flipped.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionChange {
    pub status_changed: bool,
    pub new_status: RoomStatus,
    pub both_connected: bool,
    pub any_connected: bool,
}

/// Authoritative live state of one game. Owned by its registry entry and
/// mutated by the room loop (physics) and connection tasks (paddle and
/// connection flags), serialized by the room mutex.
pub struct RoomState {
    pub game_id: GameId,
    pub ball: Ball,
    pub left_paddle: Paddle,
    pub right_paddle: Paddle,
    pub match_wins: MatchWins,
    pub current_match: i64,
    pub game_status: RoomStatus,
    pub winner: Option<Side>,
    pub players: Players,
    pub difficulty: Difficulty,
    pub settings: DifficultySettings,
    pub last_update_time: Instant,
    pub last_seen_connected: Instant,
    pub loop_running: bool,
    pub rng: StdRng,
    clock_base: Instant,
}

impl RoomState {
    /// Materialize a fresh room from its stored game record.
    pub fn new(game: &GameRecord, seed: u64) -> RoomState {
        let settings = game.difficulty.settings();
        let now = Instant::now();

        RoomState {
            game_id: game.id,
            ball: Ball {
                x: BASE_WIDTH / 2.0,
                y: BASE_HEIGHT / 2.0,
                dx: settings.ball_speed,
                dy: settings.ball_speed * BASE_HEIGHT / BASE_WIDTH,
                speed: settings.ball_speed,
                radius: BALL_RADIUS,
                prev_x: BASE_WIDTH / 2.0,
                prev_y: BASE_HEIGHT / 2.0,
            },
            left_paddle: Paddle {
                x: 20.0,
                y: BASE_HEIGHT / 2.0 - PADDLE_HEIGHT / 2.0,
                width: PADDLE_WIDTH,
                height: PADDLE_HEIGHT,
                speed: PADDLE_SPEED,
                score: 0,
            },
            right_paddle: Paddle {
                x: BASE_WIDTH - 20.0 - PADDLE_WIDTH,
                y: BASE_HEIGHT / 2.0 - PADDLE_HEIGHT / 2.0,
                width: PADDLE_WIDTH,
                height: PADDLE_HEIGHT,
                speed: PADDLE_SPEED,
                score: 0,
            },
            match_wins: MatchWins::default(),
            current_match: 1,
            game_status: RoomStatus::Waiting,
            winner: None,
            players: Players {
                player1: PlayerSlot {
                    id: game.player1,
                    connected: false,
                },
                player2: PlayerSlot {
                    id: game.player2,
                    connected: false,
                },
            },
            difficulty: game.difficulty,
            settings,
            last_update_time: now,
            last_seen_connected: now,
            loop_running: false,
            rng: StdRng::seed_from_u64(seed),
            clock_base: now,
        }
    }

    pub fn paddle(&self, side: Side) -> &Paddle {
        match side {
            Side::Player1 => &self.left_paddle,
            Side::Player2 => &self.right_paddle,
        }
    }

    pub fn paddle_mut(&mut self, side: Side) -> &mut Paddle {
        match side {
            Side::Player1 => &mut self.left_paddle,
            Side::Player2 => &mut self.right_paddle,
        }
    }

    pub fn both_connected(&self) -> bool {
        self.players.player1.connected && self.players.player2.connected
    }

    pub fn any_connected(&self) -> bool {
        self.players.player1.connected || self.players.player2.connected
    }

    /// Monotonic room clock in seconds, used to stamp snapshots so clients
    /// observe strictly increasing `broadcast_time`.
    pub fn clock(&self) -> f64 {
        self.clock_base.elapsed().as_secs_f64()
    }

    /// Flip a player's connection flag and work out the resulting status
    /// transition: both players arriving moves `waiting` to `menu`.
    pub fn set_connection(&mut self, side: Side, connected: bool) -> ConnectionChange {
        self.players.slot_mut(side).connected = connected;
        if self.any_connected() {
            self.last_seen_connected = Instant::now();
        }

        let mut status_changed = false;
        if self.both_connected() && self.game_status == RoomStatus::Waiting {
            self.game_status = RoomStatus::Menu;
            status_changed = true;
        }

        ConnectionChange {
            status_changed,
            new_status: self.game_status,
            both_connected: self.both_connected(),
            any_connected: self.any_connected(),
        }
    }

    /// Apply a client paddle move. Targets outside the field are snapped to
    /// the nearest legal position; a jump larger than the paddle could cover
    /// in ten rendered frames is rejected outright.
    pub fn apply_paddle_move(&mut self, side: Side, position: f64) -> bool {
        let clamped = position.clamp(0.0, BASE_HEIGHT - PADDLE_HEIGHT);
        let paddle = self.paddle_mut(side);
        if (clamped - paddle.y).abs() > paddle.speed * 10.0 {
            return false;
        }
        paddle.y = clamped;
        true
    }

    /// Reset ball, paddles and scores for the next match. The room returns
    /// to the menu; callers decide when play resumes.
    pub fn reset_for_new_match(&mut self) {
        self.ball.x = BASE_WIDTH / 2.0;
        self.ball.y = BASE_HEIGHT / 2.0;
        self.ball.prev_x = self.ball.x;
        self.ball.prev_y = self.ball.y;
        self.ball.dx = self.settings.ball_speed;
        self.ball.dy = self.settings.ball_speed * BASE_HEIGHT / BASE_WIDTH;
        self.ball.speed = self.settings.ball_speed;

        self.left_paddle.y = BASE_HEIGHT / 2.0 - PADDLE_HEIGHT / 2.0;
        self.left_paddle.score = 0;
        self.right_paddle.y = BASE_HEIGHT / 2.0 - PADDLE_HEIGHT / 2.0;
        self.right_paddle.score = 0;

        self.current_match += 1;
        self.game_status = RoomStatus::Menu;
        self.winner = None;
    }

    /// Enter the playing state, restarting the frame clock so the first
    /// physics step does not swallow the time spent in the menu.
    pub fn start_playing(&mut self) {
        self.last_update_time = Instant::now();
        self.game_status = RoomStatus::Playing;
    }

    /// Terminal result to hand to the store. The winner is the explicit room
    /// winner after `gameOver` (which covers forfeits), otherwise whichever
    /// side holds more match wins.
    pub fn outcome(&self) -> crate::data::GameOutcome {
        let winner = if self.game_status == RoomStatus::GameOver {
            self.winner
        } else if self.match_wins.player1 > self.match_wins.player2 {
            Some(Side::Player1)
        } else if self.match_wins.player2 > self.match_wins.player1 {
            Some(Side::Player2)
        } else {
            None
        };

        crate::data::GameOutcome {
            game_id: self.game_id,
            winner,
            match_wins_player1: self.match_wins.player1,
            match_wins_player2: self.match_wins.player2,
            current_match: self.current_match,
            current_score_player1: self.left_paddle.score,
            current_score_player2: self.right_paddle.score,
            game_over: self.game_status == RoomStatus::GameOver,
        }
    }

    pub fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            game_id: self.game_id,
            ball: self.ball,
            left_paddle: self.left_paddle,
            right_paddle: self.right_paddle,
            match_wins: self.match_wins,
            current_match: self.current_match,
            game_status: self.game_status,
            winner: self.winner,
            players: self.players,
            difficulty: self.difficulty,
            settings: self.settings,
            broadcast_time: None,
            physics_interval: None,
        }
    }
}

pub type SharedRoom = Arc<Mutex<RoomState>>;

/// Process-wide map from game id to live room. Creation and deletion go
/// through the registry mutex; the room itself is guarded by its own lock.
#[derive(Default)]
pub struct Registry {
    rooms: Mutex<HashMap<GameId, SharedRoom>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub async fn get_or_create(&self, game: &GameRecord) -> SharedRoom {
        let mut rooms = self.rooms.lock().await;
        rooms
            .entry(game.id)
            .or_insert_with(|| Arc::new(Mutex::new(RoomState::new(game, rand::random()))))
            .clone()
    }

    pub async fn get(&self, game_id: GameId) -> Option<SharedRoom> {
        self.rooms.lock().await.get(&game_id).cloned()
    }

    pub async fn delete(&self, game_id: GameId) -> Option<SharedRoom> {
        self.rooms.lock().await.remove(&game_id)
    }

    pub async fn contains(&self, game_id: GameId) -> bool {
        self.rooms.lock().await.contains_key(&game_id)
    }
}

#[cfg(test)]
pub(crate) fn test_game(id: GameId, player1: UserId, player2: UserId) -> GameRecord {
    use crate::data::GameStatus;

    GameRecord {
        id,
        player1,
        player2,
        difficulty: Difficulty::Medium,
        status: GameStatus::Waiting,
        created_at: 0,
        started_at: None,
        completed_at: None,
        winner: None,
        final_score_player1: 0,
        final_score_player2: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_defaults_follow_difficulty() {
        let room = RoomState::new(&test_game(1, 10, 20), 7);
        assert_eq!(room.game_status, RoomStatus::Waiting);
        assert_eq!(room.current_match, 1);
        assert_eq!(room.ball.dx, 5.0);
        assert_eq!(room.ball.dy, 5.0 * BASE_HEIGHT / BASE_WIDTH);
        assert_eq!(room.ball.speed, 5.0);
        assert_eq!(room.left_paddle.x, 20.0);
        assert_eq!(room.right_paddle.x, BASE_WIDTH - 20.0 - PADDLE_WIDTH);
        assert!(!room.players.player1.connected);
        assert!(!room.loop_running);
    }

    #[test]
    fn both_players_arriving_moves_waiting_to_menu() {
        let mut room = RoomState::new(&test_game(1, 10, 20), 7);

        let change = room.set_connection(Side::Player1, true);
        assert!(!change.status_changed);
        assert!(!change.both_connected);

        let change = room.set_connection(Side::Player2, true);
        assert!(change.status_changed);
        assert_eq!(change.new_status, RoomStatus::Menu);
        assert!(change.both_connected);
    }

    #[test]
    fn paddle_moves_are_snapped_and_rate_limited() {
        let mut room = RoomState::new(&test_game(1, 10, 20), 7);
        let start = room.left_paddle.y;

        // small move is applied
        assert!(room.apply_paddle_move(Side::Player1, start + 30.0));
        assert_eq!(room.left_paddle.y, start + 30.0);

        // teleport across the field is rejected
        assert!(!room.apply_paddle_move(Side::Player1, start + 30.0 + PADDLE_SPEED * 10.0 + 1.0));
        assert_eq!(room.left_paddle.y, start + 30.0);

        // out-of-bounds target is snapped, then judged by the snapped delta
        room.left_paddle.y = 10.0;
        assert!(room.apply_paddle_move(Side::Player1, -500.0));
        assert_eq!(room.left_paddle.y, 0.0);
    }

    #[test]
    fn paddle_move_only_touches_own_side() {
        let mut room = RoomState::new(&test_game(1, 10, 20), 7);
        let right_before = room.right_paddle.y;
        assert!(room.apply_paddle_move(Side::Player1, 50.0));
        assert_eq!(room.right_paddle.y, right_before);

        let left_before = room.left_paddle.y;
        assert!(room.apply_paddle_move(Side::Player2, 260.0));
        assert_eq!(room.left_paddle.y, left_before);
    }

    #[test]
    fn reset_for_new_match_clears_scores_and_advances_counter() {
        let mut room = RoomState::new(&test_game(1, 10, 20), 7);
        room.left_paddle.score = 5;
        room.right_paddle.score = 3;
        room.game_status = RoomStatus::MatchOver;
        room.winner = Some(Side::Player1);

        room.reset_for_new_match();
        assert_eq!(room.left_paddle.score, 0);
        assert_eq!(room.right_paddle.score, 0);
        assert_eq!(room.current_match, 2);
        assert_eq!(room.game_status, RoomStatus::Menu);
        assert_eq!(room.winner, None);
        assert_eq!(room.ball.speed, room.settings.ball_speed);
    }

    #[tokio::test]
    async fn registry_creates_once_and_deletes() {
        let registry = Registry::new();
        let game = test_game(42, 1, 2);

        let a = registry.get_or_create(&game).await;
        let b = registry.get_or_create(&game).await;
        assert!(Arc::ptr_eq(&a, &b));

        assert!(registry.get(42).await.is_some());
        assert!(registry.delete(42).await.is_some());
        assert!(registry.get(42).await.is_none());
    }
}
