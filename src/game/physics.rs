//! The simulation step. Pure state-in, state-out over one fixed `dt`; no
//! I/O, no wall-clock. All randomness (bounce jitter, serve direction)
//! comes from the room's seeded rng, so a fixed seed and input trace
//! reproduce the exact same run.

use rand::Rng;

use crate::data::Side;

use super::{
    RoomState, RoomStatus, BASE_HEIGHT, BASE_WIDTH, MATCHES_TO_WIN_GAME, POINTS_TO_WIN_MATCH,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct StepOutcome {
    pub scored: bool,
    pub collided: bool,
}

/// Advance the ball by one fixed timestep, handling wall and paddle
/// collisions and scoring. `dt` is in seconds; velocities are units per
/// rendered frame, hence the `* 60.0` scale.
pub fn step(room: &mut RoomState, dt: f64) -> StepOutcome {
    let settings = room.settings;
    let mut outcome = StepOutcome::default();

    // Previous position rides along in every snapshot for interpolation.
    room.ball.prev_x = room.ball.x;
    room.ball.prev_y = room.ball.y;

    room.ball.x += room.ball.dx * dt * 60.0;
    room.ball.y += room.ball.dy * dt * 60.0;

    // Walls. Jitter breaks up perfectly repeating rallies.
    if room.ball.y + room.ball.radius >= BASE_HEIGHT {
        if room.ball.dy > 0.0 {
            let jitter = (room.rng.gen::<f64>() - 0.5) * 0.1;
            room.ball.dy = -room.ball.dy + jitter;
        }
        outcome.collided = true;
    }
    if room.ball.y - room.ball.radius <= 0.0 {
        if room.ball.dy < 0.0 {
            let jitter = (room.rng.gen::<f64>() - 0.5) * 0.1;
            room.ball.dy = -room.ball.dy + jitter;
        }
        outcome.collided = true;
    }

    let ball_left = room.ball.x - room.ball.radius;
    let ball_right = room.ball.x + room.ball.radius;
    let ball_top = room.ball.y - room.ball.radius;
    let ball_bottom = room.ball.y + room.ball.radius;

    // Left paddle.
    let left = room.left_paddle;
    if ball_left <= left.x + left.width
        && ball_left > left.x
        && ball_top <= left.y + left.height
        && ball_bottom >= left.y
        && room.ball.dx < 0.0
    {
        room.ball.dx = -room.ball.dx;
        deflect(room, Side::Player1, &settings);
        outcome.collided = true;
    }

    // Right paddle.
    let right = room.right_paddle;
    if ball_right >= right.x
        && ball_right < right.x + right.width
        && ball_top <= right.y + right.height
        && ball_bottom >= right.y
        && room.ball.dx > 0.0
    {
        room.ball.dx = -room.ball.dx;
        deflect(room, Side::Player2, &settings);
        outcome.collided = true;
    }

    // Scoring: the ball must fully leave the field.
    if room.ball.x + room.ball.radius < 0.0 {
        room.right_paddle.score += 1;
        reset_ball(room, 1.0);
        outcome.scored = true;
    } else if room.ball.x - room.ball.radius > BASE_WIDTH {
        room.left_paddle.score += 1;
        reset_ball(room, -1.0);
        outcome.scored = true;
    }

    outcome
}

/// Angle the ball off a paddle: the further from the paddle's center the
/// contact, the steeper the exit, capped at 0.8 of the ball speed. Each
/// contact also ratchets the speed up toward the difficulty cap.
fn deflect(room: &mut RoomState, side: Side, settings: &crate::data::DifficultySettings) {
    let paddle = *room.paddle(side);
    let hit_position =
        ((room.ball.y - (paddle.y + paddle.height / 2.0)) / (paddle.height / 2.0)).clamp(-0.8, 0.8);

    room.ball.dy = hit_position * room.ball.speed;
    room.ball.speed =
        (room.ball.speed * (1.0 + settings.increment_multiplier)).min(settings.max_ball_speed);
    room.ball.dx = if room.ball.dx > 0.0 {
        room.ball.speed
    } else {
        -room.ball.speed
    };

    let jitter = (room.rng.gen::<f64>() - 0.5) * 0.2;
    room.ball.dy += jitter;
}

/// Center the ball and serve it toward `direction` (+1 right, -1 left) at
/// the base speed with a randomized vertical component.
fn reset_ball(room: &mut RoomState, direction: f64) {
    room.ball.x = BASE_WIDTH / 2.0;
    room.ball.y = BASE_HEIGHT / 2.0;
    room.ball.speed = room.settings.ball_speed;
    room.ball.dx = direction * room.settings.ball_speed;
    room.ball.dy = (room.rng.gen::<f64>() * 2.0 - 1.0) * room.settings.ball_speed / 2.0;
}

/// After a score, settle match and game bookkeeping. Returns true when the
/// current match just ended; the room is left in `matchOver` or `gameOver`.
pub fn check_match_end(room: &mut RoomState) -> bool {
    let winner = if room.left_paddle.score >= POINTS_TO_WIN_MATCH {
        Side::Player1
    } else if room.right_paddle.score >= POINTS_TO_WIN_MATCH {
        Side::Player2
    } else {
        return false;
    };

    match winner {
        Side::Player1 => room.match_wins.player1 += 1,
        Side::Player2 => room.match_wins.player2 += 1,
    }
    room.winner = Some(winner);
    room.game_status = if room.match_wins.on(winner) >= MATCHES_TO_WIN_GAME {
        RoomStatus::GameOver
    } else {
        RoomStatus::MatchOver
    };

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{test_game, RoomState, BALL_RADIUS};

    const DT: f64 = 1.0 / 240.0;

    fn room_with_seed(seed: u64) -> RoomState {
        let mut room = RoomState::new(&test_game(1, 10, 20), seed);
        room.game_status = RoomStatus::Playing;
        room
    }

    #[test]
    fn fixed_seed_reproduces_the_exact_trace() {
        let mut a = room_with_seed(1234);
        let mut b = room_with_seed(1234);

        for tick in 0..5000 {
            // identical scripted inputs on both runs
            if tick % 37 == 0 {
                let target = (tick % 400) as f64;
                a.apply_paddle_move(Side::Player1, target);
                b.apply_paddle_move(Side::Player1, target);
                a.apply_paddle_move(Side::Player2, 400.0 - target);
                b.apply_paddle_move(Side::Player2, 400.0 - target);
            }
            step(&mut a, DT);
            step(&mut b, DT);

            assert_eq!(a.ball.x.to_bits(), b.ball.x.to_bits(), "tick {tick}");
            assert_eq!(a.ball.y.to_bits(), b.ball.y.to_bits(), "tick {tick}");
            assert_eq!(a.ball.dx.to_bits(), b.ball.dx.to_bits(), "tick {tick}");
            assert_eq!(a.ball.dy.to_bits(), b.ball.dy.to_bits(), "tick {tick}");
            assert_eq!(a.left_paddle.score, b.left_paddle.score);
            assert_eq!(a.right_paddle.score, b.right_paddle.score);
        }
    }

    #[test]
    fn different_seeds_diverge() {
        let mut a = room_with_seed(1);
        let mut b = room_with_seed(2);
        let mut diverged = false;
        for _ in 0..20000 {
            step(&mut a, DT);
            step(&mut b, DT);
            if a.ball.y.to_bits() != b.ball.y.to_bits() {
                diverged = true;
                break;
            }
        }
        assert!(diverged, "jitter should separate differently seeded runs");
    }

    #[test]
    fn ball_bounces_off_bottom_wall() {
        let mut room = room_with_seed(7);
        room.ball.y = BASE_HEIGHT - BALL_RADIUS - 0.1;
        room.ball.dy = 3.0;
        room.ball.dx = 0.0;

        let outcome = step(&mut room, DT);
        assert!(outcome.collided);
        assert!(room.ball.dy < 0.0, "dy must flip into the field");
    }

    #[test]
    fn ball_bounces_off_top_wall() {
        let mut room = room_with_seed(7);
        room.ball.y = BALL_RADIUS + 0.1;
        room.ball.dy = -3.0;
        room.ball.dx = 0.0;

        let outcome = step(&mut room, DT);
        assert!(outcome.collided);
        assert!(room.ball.dy > 0.0);
    }

    #[test]
    fn left_paddle_deflects_and_speeds_up() {
        let mut room = room_with_seed(7);
        let paddle = room.left_paddle;
        room.ball.x = paddle.x + paddle.width + BALL_RADIUS - 0.5;
        room.ball.y = paddle.y + paddle.height / 2.0;
        room.ball.dx = -room.ball.speed;
        room.ball.dy = 0.0;
        let before = room.ball.speed;

        let outcome = step(&mut room, DT);
        assert!(outcome.collided);
        assert!(room.ball.dx > 0.0, "ball must reflect to the right");
        assert!(room.ball.speed > before);
        assert!(room.ball.speed <= room.settings.max_ball_speed);
    }

    #[test]
    fn ball_speed_never_exceeds_difficulty_cap() {
        let mut room = room_with_seed(7);
        room.ball.speed = room.settings.max_ball_speed - 0.01;
        let paddle = room.right_paddle;
        room.ball.x = paddle.x - BALL_RADIUS + 0.5;
        room.ball.y = paddle.y + paddle.height / 2.0;
        room.ball.dx = room.ball.speed;
        room.ball.dy = 0.0;

        step(&mut room, DT);
        assert!(room.ball.speed <= room.settings.max_ball_speed);
        assert!(room.ball.speed >= room.settings.ball_speed);
    }

    #[test]
    fn ball_past_left_edge_scores_for_the_right() {
        let mut room = room_with_seed(7);
        room.ball.x = -BALL_RADIUS - 1.0;
        room.ball.y = BASE_HEIGHT / 2.0;
        room.ball.dx = -2.0;
        room.ball.dy = 0.0;

        let outcome = step(&mut room, DT);
        assert!(outcome.scored);
        assert_eq!(room.right_paddle.score, 1);
        assert_eq!(room.left_paddle.score, 0);

        // serve is reset toward the scorer's opponent at base speed
        assert_eq!(room.ball.x, BASE_WIDTH / 2.0);
        assert_eq!(room.ball.speed, room.settings.ball_speed);
        assert!(room.ball.dx > 0.0);
        assert!(room.ball.dy.abs() <= room.settings.ball_speed / 2.0);
    }

    #[test]
    fn ball_past_right_edge_scores_for_the_left() {
        let mut room = room_with_seed(7);
        room.ball.x = BASE_WIDTH + BALL_RADIUS + 1.0;
        room.ball.dx = 2.0;
        room.ball.dy = 0.0;

        let outcome = step(&mut room, DT);
        assert!(outcome.scored);
        assert_eq!(room.left_paddle.score, 1);
        assert!(room.ball.dx < 0.0);
    }

    #[test]
    fn scores_are_monotonic_and_bounded_during_play() {
        let mut room = room_with_seed(99);
        room.left_paddle.y = 0.0; // parked away from the rally line
        let mut last = (0, 0);
        for _ in 0..200_000 {
            step(&mut room, DT);
            let now = (room.left_paddle.score, room.right_paddle.score);
            assert!(now.0 >= last.0 && now.1 >= last.1);
            last = now;
            if check_match_end(&mut room) {
                assert!(
                    room.left_paddle.score == POINTS_TO_WIN_MATCH
                        || room.right_paddle.score == POINTS_TO_WIN_MATCH
                );
                assert!(room.left_paddle.score <= POINTS_TO_WIN_MATCH);
                assert!(room.right_paddle.score <= POINTS_TO_WIN_MATCH);
                break;
            }
        }
    }

    #[test]
    fn match_ends_exactly_at_five_points() {
        let mut room = room_with_seed(7);
        room.right_paddle.score = 4;
        assert!(!check_match_end(&mut room));

        room.right_paddle.score = 5;
        assert!(check_match_end(&mut room));
        assert_eq!(room.match_wins.player2, 1);
        assert_eq!(room.winner, Some(Side::Player2));
        assert_eq!(room.game_status, RoomStatus::MatchOver);
    }

    #[test]
    fn game_ends_exactly_at_three_match_wins() {
        let mut room = room_with_seed(7);
        room.match_wins.player1 = 2;
        room.left_paddle.score = 5;

        assert!(check_match_end(&mut room));
        assert_eq!(room.match_wins.player1, 3);
        assert_eq!(room.game_status, RoomStatus::GameOver);
        assert_eq!(room.winner, Some(Side::Player1));
    }

    #[test]
    fn two_wins_is_not_enough() {
        let mut room = room_with_seed(7);
        room.match_wins.player1 = 1;
        room.left_paddle.score = 5;

        assert!(check_match_end(&mut room));
        assert_eq!(room.match_wins.player1, 2);
        assert_eq!(room.game_status, RoomStatus::MatchOver);
    }

    #[test]
    fn paddle_misses_leave_five_points_for_the_opponent() {
        // Nobody touches the controls and the left paddle sits parked at the
        // top; misses rack up points until one side takes the match.
        let mut room = room_with_seed(4242);
        room.left_paddle.y = 0.0;
        let mut steps = 0u64;
        while !check_match_end(&mut room) {
            step(&mut room, DT);
            steps += 1;
            assert!(steps < 2_000_000, "match should end in bounded time");
        }
        assert_eq!(
            room.left_paddle.score.max(room.right_paddle.score),
            POINTS_TO_WIN_MATCH
        );
        assert!(room.left_paddle.score.min(room.right_paddle.score) < POINTS_TO_WIN_MATCH);
        assert!(room.winner.is_some());
    }
}
