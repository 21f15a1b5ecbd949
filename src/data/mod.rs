use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type GameId = i64;

/// XP granted per completed game.
pub const WINNER_XP: i64 = 500;
pub const LOSER_XP: i64 = 100;

/// Seconds since the unix epoch, as stored in every timestamp column.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// Ball speed constants attached to a difficulty level.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DifficultySettings {
    pub ball_speed: f64,
    pub increment_multiplier: f64,
    pub max_ball_speed: f64,
}

impl Difficulty {
    pub fn settings(self) -> DifficultySettings {
        match self {
            Difficulty::Easy => DifficultySettings {
                ball_speed: 3.0,
                increment_multiplier: 0.02,
                max_ball_speed: 6.0,
            },
            Difficulty::Medium => DifficultySettings {
                ball_speed: 5.0,
                increment_multiplier: 0.05,
                max_ball_speed: 8.0,
            },
            Difficulty::Hard => DifficultySettings {
                ball_speed: 7.0,
                increment_multiplier: 0.10,
                max_ball_speed: 11.0,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }

    pub fn parse(s: &str) -> Option<Difficulty> {
        match s {
            "easy" => Some(Difficulty::Easy),
            "medium" => Some(Difficulty::Medium),
            "hard" => Some(Difficulty::Hard),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Fire,
    Water,
}

impl Theme {
    pub fn as_str(self) -> &'static str {
        match self {
            Theme::Fire => "fire",
            Theme::Water => "water",
        }
    }

    pub fn parse(s: &str) -> Option<Theme> {
        match s {
            "fire" => Some(Theme::Fire),
            "water" => Some(Theme::Water),
            _ => None,
        }
    }
}

/// One side of a game. Player 1 owns the left paddle, player 2 the right.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "player1")]
    Player1,
    #[serde(rename = "player2")]
    Player2,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Player1 => Side::Player2,
            Side::Player2 => Side::Player1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Player1 => "player1",
            Side::Player2 => "player2",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s {
            "player1" => Some(Side::Player1),
            "player2" => Some(Side::Player2),
            _ => None,
        }
    }
}

/// Display status of a user, set by the core on socket connect/disconnect.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Presence {
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "invisible")]
    Invisible,
    #[serde(rename = "donotdisturb")]
    DoNotDisturb,
    #[serde(rename = "offline")]
    Offline,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Presence::Online => "online",
            Presence::Invisible => "invisible",
            Presence::DoNotDisturb => "donotdisturb",
            Presence::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Presence> {
        match s {
            "online" => Some(Presence::Online),
            "invisible" => Some(Presence::Invisible),
            "donotdisturb" => Some(Presence::DoNotDisturb),
            "offline" => Some(Presence::Offline),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Waiting,
    InProgress,
    Paused,
    Completed,
    Cancelled,
}

impl GameStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GameStatus::Waiting => "waiting",
            GameStatus::InProgress => "in_progress",
            GameStatus::Paused => "paused",
            GameStatus::Completed => "completed",
            GameStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<GameStatus> {
        match s {
            "waiting" => Some(GameStatus::Waiting),
            "in_progress" => Some(GameStatus::InProgress),
            "paused" => Some(GameStatus::Paused),
            "completed" => Some(GameStatus::Completed),
            "cancelled" => Some(GameStatus::Cancelled),
            _ => None,
        }
    }

}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    InProgress,
    Completed,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::InProgress => "in_progress",
            MatchStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<MatchStatus> {
        match s {
            "in_progress" => Some(MatchStatus::InProgress),
            "completed" => Some(MatchStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Waiting,
    Matched,
    TimedOut,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Waiting => "waiting",
            QueueStatus::Matched => "matched",
            QueueStatus::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<QueueStatus> {
        match s {
            "waiting" => Some(QueueStatus::Waiting),
            "matched" => Some(QueueStatus::Matched),
            "timed_out" => Some(QueueStatus::TimedOut),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InviteStatus {
    Pending,
    Accepted,
    Declined,
    Expired,
}

impl InviteStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InviteStatus::Pending => "pending",
            InviteStatus::Accepted => "accepted",
            InviteStatus::Declined => "declined",
            InviteStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<InviteStatus> {
        match s {
            "pending" => Some(InviteStatus::Pending),
            "accepted" => Some(InviteStatus::Accepted),
            "declined" => Some(InviteStatus::Declined),
            "expired" => Some(InviteStatus::Expired),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UserRow {
    pub id: UserId,
    pub username: String,
    pub avatar: String,
    pub status: Presence,
}

/// Per-user gameplay record. One row per user, created lazily.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub theme: Theme,
    pub difficulty: Difficulty,
    pub matches_played: i64,
    pub matches_won: i64,
    pub matches_lost: i64,
    pub first_win: bool,
    pub pure_win: bool,
    pub triple_win: bool,
    pub experience: i64,
    pub level: i64,
}

impl Default for PlayerProfile {
    fn default() -> Self {
        PlayerProfile {
            theme: Theme::Fire,
            difficulty: Difficulty::Medium,
            matches_played: 0,
            matches_won: 0,
            matches_lost: 0,
            first_win: false,
            pure_win: false,
            triple_win: false,
            experience: 0,
            level: 0,
        }
    }
}

impl PlayerProfile {
    /// Fold one finished game into the profile. `shutout` means the loser
    /// finished with zero match wins.
    pub fn record_result(&mut self, won: bool, shutout: bool) {
        self.matches_played += 1;
        if won {
            self.matches_won += 1;
            self.experience += WINNER_XP;
            if !self.first_win {
                self.first_win = true;
            }
            if shutout && !self.pure_win {
                self.pure_win = true;
            }
            if self.matches_won == 3 && !self.triple_win {
                self.triple_win = true;
            }
        } else {
            self.matches_lost += 1;
            self.experience += LOSER_XP;
        }

        let factor = if self.level > 0 { self.level } else { 1 };
        self.level = self.experience / (1000 * factor);
    }
}

#[derive(Clone, Debug)]
pub struct GameRecord {
    pub id: GameId,
    pub player1: UserId,
    pub player2: UserId,
    pub difficulty: Difficulty,
    pub status: GameStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub winner: Option<UserId>,
    pub final_score_player1: i64,
    pub final_score_player2: i64,
}

impl GameRecord {
    /// Which side a user plays on, if they are a participant at all.
    pub fn side_of(&self, user: UserId) -> Option<Side> {
        if user == self.player1 {
            Some(Side::Player1)
        } else if user == self.player2 {
            Some(Side::Player2)
        } else {
            None
        }
    }

    pub fn player_on(&self, side: Side) -> UserId {
        match side {
            Side::Player1 => self.player1,
            Side::Player2 => self.player2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct MatchRecord {
    pub game: GameId,
    pub match_number: i64,
    pub status: MatchStatus,
    pub score_player1: i64,
    pub score_player2: i64,
    pub winner: Option<Side>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct Invitation {
    pub id: i64,
    pub code: String,
    pub sender: UserId,
    pub recipient: UserId,
    pub difficulty: Difficulty,
    pub status: InviteStatus,
    pub created_at: i64,
    pub accepted_at: Option<i64>,
    pub declined_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub resulting_game: Option<GameId>,
}

/// An invitation joined with both parties' user rows.
#[derive(Clone, Debug)]
pub struct InvitationInfo {
    pub invitation: Invitation,
    pub sender: UserRow,
    pub recipient: UserRow,
}

/// A user's pending invitations, each paired with the counterpart's row.
#[derive(Clone, Debug, Default)]
pub struct InvitationsOf {
    pub sent: Vec<(Invitation, UserRow)>,
    pub received: Vec<(Invitation, UserRow)>,
}

/// Result of trying to accept an invitation.
#[derive(Clone, Debug)]
pub enum AcceptOutcome {
    Created(GameId),
    AlreadyAccepted(GameId),
    NotPending(InviteStatus),
    NotFound,
}

/// A freshly paired game produced by one matchmaker tick.
#[derive(Clone, Debug)]
pub struct MatchMade {
    pub game_id: GameId,
    pub player1: UserRow,
    pub player2: UserRow,
}

/// Terminal result of a room, handed to the store for persistence.
#[derive(Clone, Copy, Debug)]
pub struct GameOutcome {
    pub game_id: GameId,
    pub winner: Option<Side>,
    pub match_wins_player1: i64,
    pub match_wins_player2: i64,
    pub current_match: i64,
    pub current_score_player1: i64,
    pub current_score_player2: i64,
    pub game_over: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn winner_gains_experience_and_levels_up() {
        let mut profile = PlayerProfile::default();
        profile.record_result(true, false);
        assert_eq!(profile.matches_played, 1);
        assert_eq!(profile.matches_won, 1);
        assert_eq!(profile.experience, 500);
        assert_eq!(profile.level, 0);
        assert!(profile.first_win);
        assert!(!profile.pure_win);

        profile.record_result(true, false);
        assert_eq!(profile.experience, 1000);
        assert_eq!(profile.level, 1);
    }

    #[test]
    fn loser_gains_small_experience() {
        let mut profile = PlayerProfile::default();
        profile.record_result(false, false);
        assert_eq!(profile.matches_lost, 1);
        assert_eq!(profile.experience, 100);
        assert!(!profile.first_win);
    }

    #[test]
    fn shutout_sets_pure_win() {
        let mut profile = PlayerProfile::default();
        profile.record_result(true, true);
        assert!(profile.pure_win);
    }

    #[test]
    fn third_win_sets_triple_win() {
        let mut profile = PlayerProfile::default();
        profile.record_result(true, false);
        profile.record_result(true, false);
        assert!(!profile.triple_win);
        profile.record_result(true, false);
        assert!(profile.triple_win);
    }

    #[test]
    fn difficulty_settings_table() {
        assert_eq!(Difficulty::Easy.settings().ball_speed, 3.0);
        assert_eq!(Difficulty::Medium.settings().max_ball_speed, 8.0);
        assert_eq!(Difficulty::Hard.settings().increment_multiplier, 0.10);
    }

    #[test]
    fn status_round_trips() {
        for s in [
            GameStatus::Waiting,
            GameStatus::InProgress,
            GameStatus::Paused,
            GameStatus::Completed,
            GameStatus::Cancelled,
        ] {
            assert_eq!(GameStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            QueueStatus::Waiting,
            QueueStatus::Matched,
            QueueStatus::TimedOut,
        ] {
            assert_eq!(QueueStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            InviteStatus::Pending,
            InviteStatus::Accepted,
            InviteStatus::Declined,
            InviteStatus::Expired,
        ] {
            assert_eq!(InviteStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(MatchStatus::parse("in_progress"), Some(MatchStatus::InProgress));
        assert_eq!(Theme::parse("water"), Some(Theme::Water));
        assert_eq!(Difficulty::parse("hard"), Some(Difficulty::Hard));
        assert_eq!(Side::parse("player2"), Some(Side::Player2));
        assert_eq!(Presence::parse("donotdisturb"), Some(Presence::DoNotDisturb));
    }
}
