use anyhow::{anyhow, bail, Result};
use log::error;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};
use rusqlite_migration::{Migrations, M};

use crate::data::{
    unix_now, AcceptOutcome, Difficulty, GameId, GameOutcome, GameRecord, GameStatus, Invitation,
    InvitationInfo, InvitationsOf, InviteStatus, MatchMade, MatchRecord, MatchStatus,
    PlayerProfile, Presence, QueueStatus, Side, Theme, UserId, UserRow,
};
use crate::game::POINTS_TO_WIN_MATCH;
use crate::messages::QueueReport;

use super::Command;

pub(super) struct DB {
    conn: Connection,
}

fn parse_difficulty(s: &str) -> Result<Difficulty> {
    Difficulty::parse(s).ok_or_else(|| anyhow!("unknown difficulty {s:?}"))
}

fn parse_game_status(s: &str) -> Result<GameStatus> {
    GameStatus::parse(s).ok_or_else(|| anyhow!("unknown game status {s:?}"))
}

fn fetch_user(conn: &Connection, user: UserId) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare("SELECT user_id, username, avatar, status FROM users WHERE user_id = ?1")?;
    let row: Option<(UserId, String, String, String)> = stmt
        .query_row([user], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .optional()?;

    match row {
        Some((id, username, avatar, status)) => Ok(Some(UserRow {
            id,
            username,
            avatar,
            status: Presence::parse(&status).unwrap_or(Presence::Offline),
        })),
        None => Ok(None),
    }
}

fn fetch_game(conn: &Connection, game: GameId) -> Result<Option<GameRecord>> {
    let mut stmt = conn.prepare(
        "SELECT game_id, player1, player2, difficulty, status, created_at, started_at,
                completed_at, winner, final_score_player1, final_score_player2
         FROM games WHERE game_id = ?1",
    )?;

    type GameTuple = (
        GameId,
        UserId,
        UserId,
        String,
        String,
        i64,
        Option<i64>,
        Option<i64>,
        Option<UserId>,
        i64,
        i64,
    );
    let row: Option<GameTuple> = stmt
        .query_row([game], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
                row.get(10)?,
            ))
        })
        .optional()?;

    match row {
        Some((
            id,
            player1,
            player2,
            difficulty,
            status,
            created_at,
            started_at,
            completed_at,
            winner,
            final_score_player1,
            final_score_player2,
        )) => Ok(Some(GameRecord {
            id,
            player1,
            player2,
            difficulty: parse_difficulty(&difficulty)?,
            status: parse_game_status(&status)?,
            created_at,
            started_at,
            completed_at,
            winner,
            final_score_player1,
            final_score_player2,
        })),
        None => Ok(None),
    }
}

fn fetch_profile(conn: &Connection, user: UserId) -> Result<Option<PlayerProfile>> {
    let mut stmt = conn.prepare(
        "SELECT theme, difficulty, matches_played, matches_won, matches_lost,
                first_win, pure_win, triple_win, experience, level
         FROM profiles WHERE user_id = ?1",
    )?;

    type ProfileTuple = (String, String, i64, i64, i64, bool, bool, bool, i64, i64);
    let row: Option<ProfileTuple> = stmt
        .query_row([user], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
                row.get(9)?,
            ))
        })
        .optional()?;

    match row {
        Some((
            theme,
            difficulty,
            matches_played,
            matches_won,
            matches_lost,
            first_win,
            pure_win,
            triple_win,
            experience,
            level,
        )) => Ok(Some(PlayerProfile {
            theme: Theme::parse(&theme).unwrap_or(Theme::Fire),
            difficulty: parse_difficulty(&difficulty)?,
            matches_played,
            matches_won,
            matches_lost,
            first_win,
            pure_win,
            triple_win,
            experience,
            level,
        })),
        None => Ok(None),
    }
}

fn ensure_profile(conn: &Connection, user: UserId) -> Result<PlayerProfile> {
    if let Some(profile) = fetch_profile(conn, user)? {
        return Ok(profile);
    }
    conn.execute(
        "INSERT OR IGNORE INTO profiles (user_id) VALUES (?1)",
        [user],
    )?;
    Ok(PlayerProfile::default())
}

fn write_profile(conn: &Connection, user: UserId, profile: &PlayerProfile) -> Result<()> {
    conn.execute(
        "UPDATE profiles SET theme = ?1, difficulty = ?2, matches_played = ?3,
                matches_won = ?4, matches_lost = ?5, first_win = ?6, pure_win = ?7,
                triple_win = ?8, experience = ?9, level = ?10
         WHERE user_id = ?11",
        params![
            profile.theme.as_str(),
            profile.difficulty.as_str(),
            profile.matches_played,
            profile.matches_won,
            profile.matches_lost,
            profile.first_win,
            profile.pure_win,
            profile.triple_win,
            profile.experience,
            profile.level,
            user,
        ],
    )?;
    Ok(())
}

fn read_invitation_row(row: &rusqlite::Row) -> rusqlite::Result<Invitation> {
    Ok(Invitation {
        id: row.get(0)?,
        code: row.get(1)?,
        sender: row.get(2)?,
        recipient: row.get(3)?,
        difficulty: Difficulty::parse(&row.get::<_, String>(4)?).unwrap_or(Difficulty::Medium),
        status: InviteStatus::parse(&row.get::<_, String>(5)?).unwrap_or(InviteStatus::Expired),
        created_at: row.get(6)?,
        accepted_at: row.get(7)?,
        declined_at: row.get(8)?,
        expires_at: row.get(9)?,
        resulting_game: row.get(10)?,
    })
}

const INVITATION_COLUMNS: &str = "invite_id, invitation_code, sender, recipient, difficulty,
     status, created_at, accepted_at, declined_at, expires_at, resulting_game";

fn fetch_invitation(conn: &Connection, code: &str) -> Result<Option<Invitation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {INVITATION_COLUMNS} FROM invitations WHERE invitation_code = ?1"
    ))?;
    Ok(stmt.query_row([code], read_invitation_row).optional()?)
}

/// 1-based FIFO position of an entry within its difficulty bucket.
fn queue_position(conn: &Connection, entry_id: i64) -> Result<i64> {
    let mut stmt = conn.prepare(
        "SELECT COUNT(*) + 1 FROM queue_entries other, queue_entries mine
         WHERE mine.entry_id = ?1
           AND other.difficulty_preference = mine.difficulty_preference
           AND other.is_active = 1 AND other.status = 'waiting'
           AND (other.joined_at < mine.joined_at
                OR (other.joined_at = mine.joined_at AND other.entry_id < mine.entry_id))",
    )?;
    Ok(stmt.query_row([entry_id], |row| row.get(0))?)
}

fn waiting_count(conn: &Connection, difficulty: Difficulty) -> Result<i64> {
    let mut stmt = conn.prepare(
        "SELECT COUNT(*) FROM queue_entries
         WHERE difficulty_preference = ?1 AND is_active = 1 AND status = 'waiting'",
    )?;
    Ok(stmt.query_row([difficulty.as_str()], |row| row.get(0))?)
}

impl DB {
    fn lookup_session(&mut self, token: String) -> Result<Option<UserId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM sessions WHERE token = ?1")?;
        let user = stmt.query_row([token], |row| row.get(0)).optional()?;
        Ok(user)
    }

    fn create_user(&mut self, username: String, avatar: String) -> Result<UserId> {
        let mut stmt = self
            .conn
            .prepare("INSERT INTO users (username, avatar, status) VALUES (?1, ?2, 'offline')")?;
        let user = stmt.insert(params![username, avatar])?;
        self.conn.execute(
            "INSERT OR IGNORE INTO profiles (user_id) VALUES (?1)",
            [user],
        )?;
        Ok(user)
    }

    fn create_session(&mut self, token: String, user: UserId) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sessions (token, user_id) VALUES (?1, ?2)",
            params![token, user],
        )?;
        Ok(())
    }

    fn set_presence(&mut self, user: UserId, online: bool) -> Result<()> {
        // only flip between online and offline; invisible and do-not-disturb
        // are user-chosen and must survive reconnects
        if online {
            self.conn.execute(
                "UPDATE users SET status = 'online' WHERE user_id = ?1 AND status = 'offline'",
                [user],
            )?;
        } else {
            self.conn.execute(
                "UPDATE users SET status = 'offline' WHERE user_id = ?1 AND status = 'online'",
                [user],
            )?;
        }
        Ok(())
    }

    fn blocked(&mut self, a: UserId, b: UserId) -> Result<bool> {
        let mut stmt = self.conn.prepare(
            "SELECT COUNT(*) FROM blocks
             WHERE (blocker = ?1 AND blocked = ?2) OR (blocker = ?2 AND blocked = ?1)",
        )?;
        let count: i64 = stmt.query_row(params![a, b], |row| row.get(0))?;
        Ok(count > 0)
    }

    fn mark_game_started(&mut self, game: GameId) -> Result<()> {
        self.conn.execute(
            "UPDATE games SET status = 'in_progress', started_at = ?2
             WHERE game_id = ?1 AND status = 'waiting'",
            params![game, unix_now()],
        )?;
        Ok(())
    }

    fn cancel_game(&mut self, game: GameId) -> Result<()> {
        self.conn.execute(
            "UPDATE games SET status = 'cancelled'
             WHERE game_id = ?1 AND status NOT IN ('completed', 'cancelled')",
            [game],
        )?;
        Ok(())
    }

    fn active_game_for(&mut self, user: UserId) -> Result<Option<GameId>> {
        let mut stmt = self.conn.prepare(
            "SELECT game_id FROM games
             WHERE (player1 = ?1 OR player2 = ?1)
               AND status IN ('waiting', 'in_progress', 'paused')
             LIMIT 1",
        )?;
        Ok(stmt.query_row([user], |row| row.get(0)).optional()?)
    }

    fn start_match(&mut self, game: GameId, match_number: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO matches (game_id, match_number, status, started_at)
             VALUES (?1, ?2, 'in_progress', ?3)",
            params![game, match_number, unix_now()],
        )?;
        Ok(())
    }

    fn complete_match(
        &mut self,
        game: GameId,
        match_number: i64,
        score_player1: i64,
        score_player2: i64,
        winner: Side,
    ) -> Result<()> {
        let now = unix_now();
        let changed = self.conn.execute(
            "UPDATE matches SET score_player1 = ?3, score_player2 = ?4, winner = ?5,
                    status = 'completed', completed_at = ?6
             WHERE game_id = ?1 AND match_number = ?2 AND status = 'in_progress'",
            params![game, match_number, score_player1, score_player2, winner.as_str(), now],
        )?;

        if changed == 0 {
            // the in_progress row went missing somehow; record the result anyway
            self.conn.execute(
                "INSERT OR IGNORE INTO matches
                     (game_id, match_number, status, score_player1, score_player2,
                      winner, started_at, completed_at)
                 VALUES (?1, ?2, 'completed', ?3, ?4, ?5, ?6, ?6)",
                params![game, match_number, score_player1, score_player2, winner.as_str(), now],
            )?;
        }
        Ok(())
    }

    fn get_matches(&mut self, game: GameId) -> Result<Vec<MatchRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT game_id, match_number, status, score_player1, score_player2,
                    winner, started_at, completed_at
             FROM matches WHERE game_id = ?1 ORDER BY match_number",
        )?;
        let rows = stmt.query_map([game], |row| {
            Ok((
                row.get::<_, GameId>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, Option<i64>>(7)?,
            ))
        })?;

        let mut matches = Vec::new();
        for row in rows {
            let (game, match_number, status, score_player1, score_player2, winner, started_at, completed_at) =
                row?;
            matches.push(MatchRecord {
                game,
                match_number,
                status: MatchStatus::parse(&status)
                    .ok_or_else(|| anyhow!("unknown match status {status:?}"))?,
                score_player1,
                score_player2,
                winner: winner.as_deref().and_then(Side::parse),
                started_at,
                completed_at,
            });
        }
        Ok(matches)
    }

    /// Terminal persistence of a room, as one transaction: the game row, the
    /// in-flight match, any missing match rows, and both player profiles.
    fn finalize_game(&mut self, outcome: GameOutcome) -> Result<bool> {
        let tx = self.conn.transaction()?;

        let game = match fetch_game(&tx, outcome.game_id)? {
            Some(game) => game,
            None => bail!("finalizing unknown game {}", outcome.game_id),
        };
        if matches!(game.status, GameStatus::Cancelled | GameStatus::Completed) {
            return Ok(false);
        }

        let now = unix_now();
        let winner_user = outcome.winner.map(|side| game.player_on(side));
        tx.execute(
            "UPDATE games SET status = 'completed', completed_at = ?2, winner = ?3,
                    final_score_player1 = ?4, final_score_player2 = ?5
             WHERE game_id = ?1",
            params![
                game.id,
                now,
                winner_user,
                outcome.match_wins_player1,
                outcome.match_wins_player2,
            ],
        )?;

        for number in 1..=outcome.current_match {
            let exists: bool = tx
                .prepare("SELECT 1 FROM matches WHERE game_id = ?1 AND match_number = ?2")?
                .query_row(params![game.id, number], |_| Ok(()))
                .optional()?
                .is_some();

            if number == outcome.current_match {
                // the live match: real scores from the room; it only gets a
                // winner if the game actually finished here
                let status = if outcome.game_over {
                    MatchStatus::Completed.as_str()
                } else {
                    MatchStatus::InProgress.as_str()
                };
                let completed_at = outcome.game_over.then_some(now);
                let match_winner = if outcome.game_over {
                    outcome.winner
                } else {
                    None
                };
                if exists {
                    tx.execute(
                        "UPDATE matches SET score_player1 = ?3, score_player2 = ?4,
                                winner = ?5, status = ?6, completed_at = ?7
                         WHERE game_id = ?1 AND match_number = ?2",
                        params![
                            game.id,
                            number,
                            outcome.current_score_player1,
                            outcome.current_score_player2,
                            match_winner.map(Side::as_str),
                            status,
                            completed_at,
                        ],
                    )?;
                } else {
                    tx.execute(
                        "INSERT INTO matches
                             (game_id, match_number, status, score_player1, score_player2,
                              winner, started_at, completed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            game.id,
                            number,
                            status,
                            outcome.current_score_player1,
                            outcome.current_score_player2,
                            match_winner.map(Side::as_str),
                            now,
                            completed_at,
                        ],
                    )?;
                }
            } else if !exists {
                // Reconstruct a match that was never persisted live: the
                // tallies say who won it, the loser's score is approximate.
                let mut rng = rand::thread_rng();
                let (winner, score_player1, score_player2) =
                    if number <= outcome.match_wins_player1 {
                        (
                            Side::Player1,
                            POINTS_TO_WIN_MATCH,
                            rng.gen_range(0..POINTS_TO_WIN_MATCH),
                        )
                    } else {
                        (
                            Side::Player2,
                            rng.gen_range(0..POINTS_TO_WIN_MATCH),
                            POINTS_TO_WIN_MATCH,
                        )
                    };
                tx.execute(
                    "INSERT INTO matches
                         (game_id, match_number, status, score_player1, score_player2,
                          winner, started_at, completed_at)
                     VALUES (?1, ?2, 'completed', ?3, ?4, ?5, ?6, ?6)",
                    params![game.id, number, score_player1, score_player2, winner.as_str(), now],
                )?;
            }
        }

        if let Some(winner_side) = outcome.winner {
            let loser_side = winner_side.other();
            let loser_wins = match loser_side {
                Side::Player1 => outcome.match_wins_player1,
                Side::Player2 => outcome.match_wins_player2,
            };
            let shutout = loser_wins == 0;

            let winner_user = game.player_on(winner_side);
            let loser_user = game.player_on(loser_side);

            let mut winner_profile = ensure_profile(&tx, winner_user)?;
            winner_profile.record_result(true, shutout);
            write_profile(&tx, winner_user, &winner_profile)?;

            let mut loser_profile = ensure_profile(&tx, loser_user)?;
            loser_profile.record_result(false, shutout);
            write_profile(&tx, loser_user, &loser_profile)?;
        }

        tx.commit()?;
        Ok(true)
    }

    fn join_queue(&mut self, user: UserId, difficulty: Option<Difficulty>) -> Result<QueueReport> {
        let difficulty = match difficulty {
            Some(difficulty) => difficulty,
            None => ensure_profile(&self.conn, user)?.difficulty,
        };

        let existing: Option<(i64, String)> = self
            .conn
            .prepare(
                "SELECT entry_id, difficulty_preference FROM queue_entries
                 WHERE player = ?1 AND is_active = 1 LIMIT 1",
            )?
            .query_row([user], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        if let Some((entry_id, current)) = existing {
            if current != difficulty.as_str() {
                self.conn.execute(
                    "UPDATE queue_entries SET difficulty_preference = ?2 WHERE entry_id = ?1",
                    params![entry_id, difficulty.as_str()],
                )?;
            }
            let position = queue_position(&self.conn, entry_id)?;
            return Ok(QueueReport::AlreadyInQueue { position });
        }

        let joined_at = unix_now();
        let entry_id = self
            .conn
            .prepare(
                "INSERT INTO queue_entries (player, joined_at, difficulty_preference, is_active, status)
                 VALUES (?1, ?2, ?3, 1, ?4)",
            )?
            .insert(params![
                user,
                joined_at,
                difficulty.as_str(),
                QueueStatus::Waiting.as_str()
            ])?;

        Ok(QueueReport::InQueue {
            position: queue_position(&self.conn, entry_id)?,
            total_waiting: waiting_count(&self.conn, difficulty)?,
            difficulty,
            joined_at,
        })
    }

    fn leave_queue(&mut self, user: UserId) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE queue_entries SET is_active = 0, status = ?2
             WHERE player = ?1 AND is_active = 1",
            params![user, QueueStatus::TimedOut.as_str()],
        )?;
        Ok(changed > 0)
    }

    fn queue_status(&mut self, user: UserId) -> Result<QueueReport> {
        let entry: Option<(i64, String, i64)> = self
            .conn
            .prepare(
                "SELECT entry_id, difficulty_preference, joined_at FROM queue_entries
                 WHERE player = ?1 AND is_active = 1 AND status = 'waiting' LIMIT 1",
            )?
            .query_row([user], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .optional()?;

        match entry {
            Some((entry_id, difficulty, joined_at)) => {
                let difficulty = parse_difficulty(&difficulty)?;
                Ok(QueueReport::InQueue {
                    position: queue_position(&self.conn, entry_id)?,
                    total_waiting: waiting_count(&self.conn, difficulty)?,
                    difficulty,
                    joined_at,
                })
            }
            None => Ok(QueueReport::NotInQueue),
        }
    }

    fn in_queue(&mut self, user: UserId) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT COUNT(*) FROM queue_entries WHERE player = ?1 AND is_active = 1")?;
        let count: i64 = stmt.query_row([user], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// One pairing pass: strict FIFO within each difficulty bucket, inside a
    /// single transaction so two entries can never be matched twice.
    fn find_matches(&mut self) -> Result<Vec<MatchMade>> {
        let now = unix_now();
        let tx = self.conn.transaction()?;
        let mut made = Vec::new();

        let difficulties: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT DISTINCT difficulty_preference FROM queue_entries
                 WHERE is_active = 1 AND status = 'waiting'",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for difficulty in difficulties {
            let mut waiting: Vec<(i64, UserId)> = {
                let mut stmt = tx.prepare(
                    "SELECT entry_id, player FROM queue_entries
                     WHERE difficulty_preference = ?1 AND is_active = 1 AND status = 'waiting'
                     ORDER BY joined_at, entry_id",
                )?;
                let rows = stmt.query_map([&difficulty], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<rusqlite::Result<_>>()?
            };

            while waiting.len() >= 2 {
                let (first_entry, first_player) = waiting[0];

                // skip duplicate entries of the same user
                let partner = waiting
                    .iter()
                    .enumerate()
                    .skip(1)
                    .find(|(_, (_, player))| *player != first_player)
                    .map(|(index, _)| index);
                let partner_index = match partner {
                    Some(index) => index,
                    None => break,
                };
                let (second_entry, second_player) = waiting[partner_index];

                tx.execute(
                    "INSERT INTO games (player1, player2, difficulty, status, created_at)
                     VALUES (?1, ?2, ?3, 'waiting', ?4)",
                    params![first_player, second_player, difficulty, now],
                )?;
                let game_id = tx.last_insert_rowid();

                tx.execute(
                    "UPDATE queue_entries SET status = ?5, is_active = 0,
                            matched_at = ?1, resulting_game = ?2
                     WHERE entry_id IN (?3, ?4)",
                    params![
                        now,
                        game_id,
                        first_entry,
                        second_entry,
                        QueueStatus::Matched.as_str()
                    ],
                )?;

                let player1 = fetch_user(&tx, first_player)?
                    .ok_or_else(|| anyhow!("queued player {first_player} has no user row"))?;
                let player2 = fetch_user(&tx, second_player)?
                    .ok_or_else(|| anyhow!("queued player {second_player} has no user row"))?;
                made.push(MatchMade {
                    game_id,
                    player1,
                    player2,
                });

                waiting.remove(partner_index);
                waiting.remove(0);
            }
        }

        tx.commit()?;
        Ok(made)
    }

    fn create_invitation(
        &mut self,
        sender: UserId,
        recipient: UserId,
        difficulty: Difficulty,
        code: String,
    ) -> Result<Invitation> {
        let created_at = unix_now();
        let mut stmt = self.conn.prepare(
            "INSERT INTO invitations (invitation_code, sender, recipient, difficulty,
                                      status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
        )?;
        let id = stmt.insert(params![code, sender, recipient, difficulty.as_str(), created_at])?;

        Ok(Invitation {
            id,
            code,
            sender,
            recipient,
            difficulty,
            status: InviteStatus::Pending,
            created_at,
            accepted_at: None,
            declined_at: None,
            expires_at: None,
            resulting_game: None,
        })
    }

    fn get_invitation(&mut self, code: String) -> Result<Option<InvitationInfo>> {
        let invitation = match fetch_invitation(&self.conn, &code)? {
            Some(invitation) => invitation,
            None => return Ok(None),
        };
        let sender = fetch_user(&self.conn, invitation.sender)?
            .ok_or_else(|| anyhow!("invitation sender missing"))?;
        let recipient = fetch_user(&self.conn, invitation.recipient)?
            .ok_or_else(|| anyhow!("invitation recipient missing"))?;
        Ok(Some(InvitationInfo {
            invitation,
            sender,
            recipient,
        }))
    }

    /// Accept a pending invitation and create its game, atomically. Accepting
    /// an already-accepted invitation yields the existing game instead.
    fn accept_invitation(&mut self, code: String) -> Result<AcceptOutcome> {
        let tx = self.conn.transaction()?;

        let invitation = match fetch_invitation(&tx, &code)? {
            Some(invitation) => invitation,
            None => return Ok(AcceptOutcome::NotFound),
        };

        match invitation.status {
            InviteStatus::Pending => {}
            InviteStatus::Accepted => {
                return match invitation.resulting_game {
                    Some(game) => Ok(AcceptOutcome::AlreadyAccepted(game)),
                    None => Ok(AcceptOutcome::NotPending(InviteStatus::Accepted)),
                };
            }
            status => return Ok(AcceptOutcome::NotPending(status)),
        }

        let now = unix_now();
        tx.execute(
            "INSERT INTO games (player1, player2, difficulty, status, created_at)
             VALUES (?1, ?2, ?3, 'waiting', ?4)",
            params![
                invitation.sender,
                invitation.recipient,
                invitation.difficulty.as_str(),
                now,
            ],
        )?;
        let game_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE invitations SET status = 'accepted', accepted_at = ?2, resulting_game = ?3
             WHERE invite_id = ?1",
            params![invitation.id, now, game_id],
        )?;

        tx.commit()?;
        Ok(AcceptOutcome::Created(game_id))
    }

    fn decline_invitation(&mut self, code: String) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE invitations SET status = 'declined', declined_at = ?2
             WHERE invitation_code = ?1 AND status = 'pending'",
            params![code, unix_now()],
        )?;
        Ok(changed > 0)
    }

    fn expire_invitation(&mut self, code: String) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE invitations SET status = 'expired', expires_at = ?2
             WHERE invitation_code = ?1 AND status = 'pending'",
            params![code, unix_now()],
        )?;
        Ok(changed > 0)
    }

    fn pending_between(&mut self, sender: UserId, recipient: UserId) -> Result<bool> {
        let mut stmt = self.conn.prepare(
            "SELECT COUNT(*) FROM invitations
             WHERE sender = ?1 AND recipient = ?2 AND status = 'pending'",
        )?;
        let count: i64 = stmt.query_row(params![sender, recipient], |row| row.get(0))?;
        Ok(count > 0)
    }

    fn active_invitations(&mut self, user: UserId) -> Result<InvitationsOf> {
        let mut dump = InvitationsOf::default();

        let sent: Vec<Invitation> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {INVITATION_COLUMNS} FROM invitations
                 WHERE sender = ?1 AND status = 'pending' ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map([user], read_invitation_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for invitation in sent {
            if let Some(counterpart) = fetch_user(&self.conn, invitation.recipient)? {
                dump.sent.push((invitation, counterpart));
            }
        }

        let received: Vec<Invitation> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {INVITATION_COLUMNS} FROM invitations
                 WHERE recipient = ?1 AND status = 'pending' ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map([user], read_invitation_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for invitation in received {
            if let Some(counterpart) = fetch_user(&self.conn, invitation.sender)? {
                dump.received.push((invitation, counterpart));
            }
        }

        Ok(dump)
    }

    fn add_notification(
        &mut self,
        username: String,
        kind: String,
        message: String,
        data: String,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO notifications (username, kind, message, data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![username, kind, message, data, unix_now()],
        )?;
        Ok(())
    }

    pub(super) fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::LookupSession { token, resp } => {
                resp.send(self.lookup_session(token)).is_ok()
            }
            Command::CreateUser {
                username,
                avatar,
                resp,
            } => resp.send(self.create_user(username, avatar)).is_ok(),
            Command::CreateSession { token, user, resp } => {
                resp.send(self.create_session(token, user)).is_ok()
            }
            Command::GetUser { user, resp } => resp.send(fetch_user(&self.conn, user)).is_ok(),
            Command::GetUserByName { username, resp } => {
                let result = (|| -> Result<Option<UserRow>> {
                    let id: Option<UserId> = self
                        .conn
                        .prepare("SELECT user_id FROM users WHERE username = ?1")?
                        .query_row([&username], |row| row.get(0))
                        .optional()?;
                    match id {
                        Some(id) => fetch_user(&self.conn, id),
                        None => Ok(None),
                    }
                })();
                resp.send(result).is_ok()
            }
            Command::SetPresence { user, online } => match self.set_presence(user, online) {
                Ok(()) => true,
                Err(e) => {
                    error!("failed to update presence for {user}: {e:?}");
                    false
                }
            },
            Command::GetOrCreateProfile { user, resp } => {
                resp.send(ensure_profile(&self.conn, user)).is_ok()
            }
            Command::Blocked { a, b, resp } => resp.send(self.blocked(a, b)).is_ok(),
            Command::GetGame { game, resp } => resp.send(fetch_game(&self.conn, game)).is_ok(),
            Command::MarkGameStarted { game, resp } => {
                resp.send(self.mark_game_started(game)).is_ok()
            }
            Command::CancelGame { game, resp } => resp.send(self.cancel_game(game)).is_ok(),
            Command::ActiveGameFor { user, resp } => resp.send(self.active_game_for(user)).is_ok(),
            Command::StartMatch {
                game,
                match_number,
                resp,
            } => resp.send(self.start_match(game, match_number)).is_ok(),
            Command::CompleteMatch {
                game,
                match_number,
                score_player1,
                score_player2,
                winner,
                resp,
            } => resp
                .send(self.complete_match(game, match_number, score_player1, score_player2, winner))
                .is_ok(),
            Command::FinalizeGame { outcome, resp } => {
                resp.send(self.finalize_game(outcome)).is_ok()
            }
            Command::GetMatches { game, resp } => resp.send(self.get_matches(game)).is_ok(),
            Command::JoinQueue {
                user,
                difficulty,
                resp,
            } => resp.send(self.join_queue(user, difficulty)).is_ok(),
            Command::LeaveQueue { user, resp } => resp.send(self.leave_queue(user)).is_ok(),
            Command::QueueStatus { user, resp } => resp.send(self.queue_status(user)).is_ok(),
            Command::InQueue { user, resp } => resp.send(self.in_queue(user)).is_ok(),
            Command::FindMatches { resp } => resp.send(self.find_matches()).is_ok(),
            Command::CreateInvitation {
                sender,
                recipient,
                difficulty,
                code,
                resp,
            } => resp
                .send(self.create_invitation(sender, recipient, difficulty, code))
                .is_ok(),
            Command::GetInvitation { code, resp } => resp.send(self.get_invitation(code)).is_ok(),
            Command::AcceptInvitation { code, resp } => {
                resp.send(self.accept_invitation(code)).is_ok()
            }
            Command::DeclineInvitation { code, resp } => {
                resp.send(self.decline_invitation(code)).is_ok()
            }
            Command::ExpireInvitation { code, resp } => {
                resp.send(self.expire_invitation(code)).is_ok()
            }
            Command::PendingBetween {
                sender,
                recipient,
                resp,
            } => resp.send(self.pending_between(sender, recipient)).is_ok(),
            Command::ActiveInvitations { user, resp } => {
                resp.send(self.active_invitations(user)).is_ok()
            }
            Command::AddNotification {
                username,
                kind,
                message,
                data,
            } => match self.add_notification(username, kind, message, data) {
                Ok(()) => true,
                Err(e) => {
                    error!("failed to store notification: {e:?}");
                    false
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> DB {
        create(":memory:").unwrap()
    }

    fn add_user(db: &mut DB, name: &str) -> UserId {
        db.create_user(name.to_string(), format!("{name}.png"))
            .unwrap()
    }

    fn paired_game(db: &mut DB, a: UserId, b: UserId) -> GameId {
        db.join_queue(a, Some(Difficulty::Medium)).unwrap();
        db.join_queue(b, Some(Difficulty::Medium)).unwrap();
        let made = db.find_matches().unwrap();
        assert_eq!(made.len(), 1);
        made[0].game_id
    }

    #[test]
    fn queue_position_is_first_come_first_served() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");
        let c = add_user(&mut db, "carol");
        let d = add_user(&mut db, "dave");

        assert!(matches!(
            db.join_queue(a, Some(Difficulty::Medium)).unwrap(),
            QueueReport::InQueue { position: 1, .. }
        ));
        assert!(matches!(
            db.join_queue(b, Some(Difficulty::Medium)).unwrap(),
            QueueReport::InQueue { position: 2, .. }
        ));
        assert!(matches!(
            db.join_queue(c, Some(Difficulty::Medium)).unwrap(),
            QueueReport::InQueue { position: 3, .. }
        ));
        // separate difficulty bucket starts at 1
        assert!(matches!(
            db.join_queue(d, Some(Difficulty::Hard)).unwrap(),
            QueueReport::InQueue { position: 1, .. }
        ));
    }

    #[test]
    fn join_queue_is_idempotent_and_updates_preference() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");

        assert!(matches!(
            db.join_queue(a, Some(Difficulty::Medium)).unwrap(),
            QueueReport::InQueue { .. }
        ));
        assert!(matches!(
            db.join_queue(a, Some(Difficulty::Hard)).unwrap(),
            QueueReport::AlreadyInQueue { position: 1 }
        ));
        match db.queue_status(a).unwrap() {
            QueueReport::InQueue { difficulty, .. } => assert_eq!(difficulty, Difficulty::Hard),
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[test]
    fn join_queue_defaults_to_profile_difficulty() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        db.conn
            .execute(
                "UPDATE profiles SET difficulty = 'hard' WHERE user_id = ?1",
                [a],
            )
            .unwrap();

        match db.join_queue(a, None).unwrap() {
            QueueReport::InQueue { difficulty, .. } => assert_eq!(difficulty, Difficulty::Hard),
            other => panic!("unexpected report {other:?}"),
        }
    }

    #[test]
    fn leave_queue_times_the_entry_out() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        db.join_queue(a, None).unwrap();

        assert!(db.leave_queue(a).unwrap());
        assert!(matches!(
            db.queue_status(a).unwrap(),
            QueueReport::NotInQueue
        ));
        assert!(!db.leave_queue(a).unwrap());

        let status: String = db
            .conn
            .query_row(
                "SELECT status FROM queue_entries WHERE player = ?1",
                [a],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(status, "timed_out");
    }

    #[test]
    fn pairing_is_fifo_within_each_difficulty() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");
        let c = add_user(&mut db, "carol");
        let d = add_user(&mut db, "dave");
        let e = add_user(&mut db, "erin");

        db.join_queue(a, Some(Difficulty::Medium)).unwrap();
        db.join_queue(b, Some(Difficulty::Medium)).unwrap();
        db.join_queue(c, Some(Difficulty::Medium)).unwrap();
        db.join_queue(d, Some(Difficulty::Hard)).unwrap();
        db.join_queue(e, Some(Difficulty::Hard)).unwrap();

        let mut made = db.find_matches().unwrap();
        made.sort_by_key(|m| m.game_id);
        assert_eq!(made.len(), 2);

        // the two earliest medium waiters pair first
        let medium = made
            .iter()
            .find(|m| m.player1.id == a || m.player2.id == a)
            .expect("alice should be matched");
        assert_eq!((medium.player1.id, medium.player2.id), (a, b));

        let hard = made
            .iter()
            .find(|m| m.player1.id == d)
            .expect("dave should be matched");
        assert_eq!(hard.player2.id, e);

        // the odd one out keeps waiting at the head of the queue
        assert!(matches!(
            db.queue_status(c).unwrap(),
            QueueReport::InQueue { position: 1, .. }
        ));
        // and a later pass with nobody else finds nothing
        assert!(db.find_matches().unwrap().is_empty());

        let game = fetch_game(&db.conn, medium.game_id).unwrap().unwrap();
        assert_eq!(game.status, GameStatus::Waiting);
        assert_eq!(game.difficulty, Difficulty::Medium);
        assert_eq!((game.player1, game.player2), (a, b));

        let (status, active, resulting): (String, bool, Option<GameId>) = db
            .conn
            .query_row(
                "SELECT status, is_active, resulting_game FROM queue_entries WHERE player = ?1",
                [a],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(status, "matched");
        assert!(!active);
        assert_eq!(resulting, Some(medium.game_id));
    }

    #[test]
    fn duplicate_entries_of_one_user_never_pair_together() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");

        // two live entries for the same user, inserted behind the API's back
        for _ in 0..2 {
            db.conn
                .execute(
                    "INSERT INTO queue_entries
                         (player, joined_at, difficulty_preference, is_active, status)
                     VALUES (?1, 0, 'medium', 1, 'waiting')",
                    [a],
                )
                .unwrap();
        }

        assert!(db.find_matches().unwrap().is_empty());

        // a real opponent pairs with exactly one of them
        let b = add_user(&mut db, "bob");
        db.join_queue(b, Some(Difficulty::Medium)).unwrap();
        let made = db.find_matches().unwrap();
        assert_eq!(made.len(), 1);
        assert_eq!((made[0].player1.id, made[0].player2.id), (a, b));
    }

    #[test]
    fn invitation_accept_creates_the_game_once() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");

        db.create_invitation(a, b, Difficulty::Hard, "CODE1234".to_string())
            .unwrap();

        let game_id = match db.accept_invitation("CODE1234".to_string()).unwrap() {
            AcceptOutcome::Created(game_id) => game_id,
            other => panic!("unexpected outcome {other:?}"),
        };

        let game = fetch_game(&db.conn, game_id).unwrap().unwrap();
        assert_eq!((game.player1, game.player2), (a, b));
        assert_eq!(game.difficulty, Difficulty::Hard);
        assert_eq!(game.status, GameStatus::Waiting);

        // accepting again yields the same game instead of a second one
        match db.accept_invitation("CODE1234".to_string()).unwrap() {
            AcceptOutcome::AlreadyAccepted(existing) => assert_eq!(existing, game_id),
            other => panic!("unexpected outcome {other:?}"),
        }

        // and it can no longer be declined
        assert!(!db.decline_invitation("CODE1234".to_string()).unwrap());
    }

    #[test]
    fn declined_and_expired_invitations_cannot_be_accepted() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");

        db.create_invitation(a, b, Difficulty::Medium, "DECLINED".to_string())
            .unwrap();
        assert!(db.decline_invitation("DECLINED".to_string()).unwrap());
        assert!(matches!(
            db.accept_invitation("DECLINED".to_string()).unwrap(),
            AcceptOutcome::NotPending(InviteStatus::Declined)
        ));

        db.create_invitation(a, b, Difficulty::Medium, "EXPIRED0".to_string())
            .unwrap();
        assert!(db.expire_invitation("EXPIRED0".to_string()).unwrap());
        assert!(matches!(
            db.accept_invitation("EXPIRED0".to_string()).unwrap(),
            AcceptOutcome::NotPending(InviteStatus::Expired)
        ));

        assert!(matches!(
            db.accept_invitation("MISSING0".to_string()).unwrap(),
            AcceptOutcome::NotFound
        ));
    }

    #[test]
    fn pending_invitations_are_listed_for_both_sides() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");

        db.create_invitation(a, b, Difficulty::Easy, "PENDING1".to_string())
            .unwrap();
        assert!(db.pending_between(a, b).unwrap());
        assert!(!db.pending_between(b, a).unwrap());

        let of_a = db.active_invitations(a).unwrap();
        assert_eq!(of_a.sent.len(), 1);
        assert_eq!(of_a.sent[0].1.username, "bob");
        assert!(of_a.received.is_empty());

        let of_b = db.active_invitations(b).unwrap();
        assert_eq!(of_b.received.len(), 1);
        assert_eq!(of_b.received[0].1.username, "alice");
    }

    #[test]
    fn finalize_writes_game_matches_and_profiles() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");
        let game_id = paired_game(&mut db, a, b);
        db.mark_game_started(game_id).unwrap();

        // two matches persisted live, the third finishes with the game
        db.start_match(game_id, 1).unwrap();
        db.complete_match(game_id, 1, 5, 2, Side::Player1).unwrap();
        db.start_match(game_id, 2).unwrap();
        db.complete_match(game_id, 2, 5, 4, Side::Player1).unwrap();
        db.start_match(game_id, 3).unwrap();

        let applied = db
            .finalize_game(GameOutcome {
                game_id,
                winner: Some(Side::Player1),
                match_wins_player1: 3,
                match_wins_player2: 0,
                current_match: 3,
                current_score_player1: 5,
                current_score_player2: 1,
                game_over: true,
            })
            .unwrap();
        assert!(applied);

        let game = fetch_game(&db.conn, game_id).unwrap().unwrap();
        assert_eq!(game.status, GameStatus::Completed);
        assert_eq!(game.winner, Some(a));
        assert_eq!(game.final_score_player1, 3);
        assert_eq!(game.final_score_player2, 0);
        assert!(game.completed_at.is_some());

        let matches = db.get_matches(game_id).unwrap();
        assert_eq!(matches.len(), 3);
        assert!(matches
            .iter()
            .all(|m| m.status == MatchStatus::Completed && m.winner == Some(Side::Player1)));
        assert_eq!(matches[2].score_player1, 5);
        assert_eq!(matches[2].score_player2, 1);

        let winner = fetch_profile(&db.conn, a).unwrap().unwrap();
        assert_eq!(winner.matches_played, 1);
        assert_eq!(winner.matches_won, 1);
        assert_eq!(winner.experience, 500);
        assert!(winner.first_win);
        assert!(winner.pure_win, "3-0 is a shutout");

        let loser = fetch_profile(&db.conn, b).unwrap().unwrap();
        assert_eq!(loser.matches_played, 1);
        assert_eq!(loser.matches_lost, 1);
        assert_eq!(loser.experience, 100);
        assert!(!loser.first_win);

        // terminal persistence happens once
        assert!(!db
            .finalize_game(GameOutcome {
                game_id,
                winner: Some(Side::Player1),
                match_wins_player1: 3,
                match_wins_player2: 0,
                current_match: 3,
                current_score_player1: 5,
                current_score_player2: 1,
                game_over: true,
            })
            .unwrap());
        let winner = fetch_profile(&db.conn, a).unwrap().unwrap();
        assert_eq!(winner.matches_played, 1);
    }

    #[test]
    fn finalize_backfills_matches_that_were_never_persisted() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");
        let game_id = paired_game(&mut db, a, b);
        db.mark_game_started(game_id).unwrap();

        db.finalize_game(GameOutcome {
            game_id,
            winner: Some(Side::Player2),
            match_wins_player1: 1,
            match_wins_player2: 3,
            current_match: 4,
            current_score_player1: 2,
            current_score_player2: 5,
            game_over: true,
        })
        .unwrap();

        let matches = db.get_matches(game_id).unwrap();
        assert_eq!(matches.len(), 4);

        // the tallies decide the reconstructed winners
        assert_eq!(matches[0].winner, Some(Side::Player1));
        assert_eq!(matches[0].score_player1, POINTS_TO_WIN_MATCH);
        assert!(matches[0].score_player2 < POINTS_TO_WIN_MATCH);
        assert_eq!(matches[1].winner, Some(Side::Player2));
        assert_eq!(matches[2].winner, Some(Side::Player2));

        // the in-flight match keeps its real scores
        assert_eq!(matches[3].score_player1, 2);
        assert_eq!(matches[3].score_player2, 5);
        assert_eq!(matches[3].winner, Some(Side::Player2));
    }

    #[test]
    fn finalize_is_a_no_op_for_cancelled_games() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");
        let game_id = paired_game(&mut db, a, b);

        db.cancel_game(game_id).unwrap();
        let applied = db
            .finalize_game(GameOutcome {
                game_id,
                winner: Some(Side::Player1),
                match_wins_player1: 1,
                match_wins_player2: 0,
                current_match: 1,
                current_score_player1: 5,
                current_score_player2: 0,
                game_over: true,
            })
            .unwrap();
        assert!(!applied);

        let game = fetch_game(&db.conn, game_id).unwrap().unwrap();
        assert_eq!(game.status, GameStatus::Cancelled);
        assert!(fetch_profile(&db.conn, a).unwrap().unwrap().matches_played == 0);
    }

    #[test]
    fn cancel_never_downgrades_a_completed_game() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");
        let game_id = paired_game(&mut db, a, b);

        db.finalize_game(GameOutcome {
            game_id,
            winner: Some(Side::Player1),
            match_wins_player1: 3,
            match_wins_player2: 1,
            current_match: 4,
            current_score_player1: 5,
            current_score_player2: 3,
            game_over: true,
        })
        .unwrap();

        db.cancel_game(game_id).unwrap();
        let game = fetch_game(&db.conn, game_id).unwrap().unwrap();
        assert_eq!(game.status, GameStatus::Completed);
    }

    #[test]
    fn forfeit_awards_the_remaining_player() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");
        let game_id = paired_game(&mut db, a, b);
        db.mark_game_started(game_id).unwrap();
        db.start_match(game_id, 1).unwrap();

        // player 1 dropped mid-rally at 3-2; player 2 wins by forfeit
        db.finalize_game(GameOutcome {
            game_id,
            winner: Some(Side::Player2),
            match_wins_player1: 0,
            match_wins_player2: 0,
            current_match: 1,
            current_score_player1: 3,
            current_score_player2: 2,
            game_over: true,
        })
        .unwrap();

        let game = fetch_game(&db.conn, game_id).unwrap().unwrap();
        assert_eq!(game.status, GameStatus::Completed);
        assert_eq!(game.winner, Some(b));

        let winner = fetch_profile(&db.conn, b).unwrap().unwrap();
        assert_eq!(winner.matches_won, 1);
        assert_eq!(winner.experience, 500);
        let loser = fetch_profile(&db.conn, a).unwrap().unwrap();
        assert_eq!(loser.matches_lost, 1);
        assert_eq!(loser.experience, 100);
    }

    #[test]
    fn active_game_owns_its_players() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");
        assert!(db.active_game_for(a).unwrap().is_none());

        let game_id = paired_game(&mut db, a, b);
        assert_eq!(db.active_game_for(a).unwrap(), Some(game_id));
        assert_eq!(db.active_game_for(b).unwrap(), Some(game_id));

        db.cancel_game(game_id).unwrap();
        assert!(db.active_game_for(a).unwrap().is_none());
    }

    #[test]
    fn game_start_transition_happens_once() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");
        let game_id = paired_game(&mut db, a, b);

        db.mark_game_started(game_id).unwrap();
        let game = fetch_game(&db.conn, game_id).unwrap().unwrap();
        assert_eq!(game.status, GameStatus::InProgress);
        let started_at = game.started_at.expect("started_at should be set");

        db.mark_game_started(game_id).unwrap();
        let game = fetch_game(&db.conn, game_id).unwrap().unwrap();
        assert_eq!(game.started_at, Some(started_at));
    }

    #[test]
    fn presence_only_flips_between_online_and_offline() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");

        db.set_presence(a, true).unwrap();
        assert_eq!(
            fetch_user(&db.conn, a).unwrap().unwrap().status,
            Presence::Online
        );
        db.set_presence(a, false).unwrap();
        assert_eq!(
            fetch_user(&db.conn, a).unwrap().unwrap().status,
            Presence::Offline
        );

        // a user-chosen status survives connects and disconnects
        db.conn
            .execute(
                "UPDATE users SET status = 'donotdisturb' WHERE user_id = ?1",
                [a],
            )
            .unwrap();
        db.set_presence(a, true).unwrap();
        db.set_presence(a, false).unwrap();
        assert_eq!(
            fetch_user(&db.conn, a).unwrap().unwrap().status,
            Presence::DoNotDisturb
        );
    }

    #[test]
    fn blocks_apply_in_both_directions() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        let b = add_user(&mut db, "bob");
        assert!(!db.blocked(a, b).unwrap());

        db.conn
            .execute(
                "INSERT INTO blocks (blocker, blocked) VALUES (?1, ?2)",
                params![a, b],
            )
            .unwrap();
        assert!(db.blocked(a, b).unwrap());
        assert!(db.blocked(b, a).unwrap());
    }

    #[test]
    fn sessions_resolve_to_user_ids() {
        let mut db = test_db();
        let a = add_user(&mut db, "alice");
        db.create_session("tok-alice".to_string(), a).unwrap();

        assert_eq!(db.lookup_session("tok-alice".to_string()).unwrap(), Some(a));
        assert_eq!(db.lookup_session("tok-nobody".to_string()).unwrap(), None);
    }
}

pub(super) fn create(path: &str) -> Result<DB> {
    let migrations = Migrations::new(vec![
        M::up(
            "CREATE TABLE users(
				user_id INTEGER PRIMARY KEY NOT NULL,
				username TEXT NOT NULL UNIQUE,
				avatar TEXT NOT NULL DEFAULT '',
				status TEXT NOT NULL DEFAULT 'offline'
			);",
        ),
        M::up(
            "CREATE TABLE sessions(
				token TEXT PRIMARY KEY NOT NULL,
				user_id INTEGER NOT NULL,
				FOREIGN KEY (user_id) REFERENCES users(user_id)
			);",
        ),
        M::up(
            "CREATE TABLE blocks(
				blocker INTEGER NOT NULL,
				blocked INTEGER NOT NULL,
				PRIMARY KEY (blocker, blocked)
			);",
        ),
        M::up(
            "CREATE TABLE profiles(
				user_id INTEGER PRIMARY KEY NOT NULL,
				theme TEXT NOT NULL DEFAULT 'fire',
				difficulty TEXT NOT NULL DEFAULT 'medium',
				matches_played INTEGER NOT NULL DEFAULT 0,
				matches_won INTEGER NOT NULL DEFAULT 0,
				matches_lost INTEGER NOT NULL DEFAULT 0,
				first_win INTEGER NOT NULL DEFAULT 0,
				pure_win INTEGER NOT NULL DEFAULT 0,
				triple_win INTEGER NOT NULL DEFAULT 0,
				experience INTEGER NOT NULL DEFAULT 0,
				level INTEGER NOT NULL DEFAULT 0,
				FOREIGN KEY (user_id) REFERENCES users(user_id)
			);",
        ),
        M::up(
            "CREATE TABLE games(
				game_id INTEGER PRIMARY KEY NOT NULL,
				player1 INTEGER NOT NULL,
				player2 INTEGER NOT NULL,
				difficulty TEXT NOT NULL DEFAULT 'medium',
				status TEXT NOT NULL DEFAULT 'waiting',
				created_at INTEGER NOT NULL,
				started_at INTEGER,
				completed_at INTEGER,
				winner INTEGER,
				final_score_player1 INTEGER NOT NULL DEFAULT 0,
				final_score_player2 INTEGER NOT NULL DEFAULT 0
			);
			CREATE INDEX idx_games_status ON games(status);
			CREATE INDEX idx_games_player1 ON games(player1);
			CREATE INDEX idx_games_player2 ON games(player2);",
        ),
        M::up(
            "CREATE TABLE matches(
				match_id INTEGER PRIMARY KEY NOT NULL,
				game_id INTEGER NOT NULL,
				match_number INTEGER NOT NULL,
				status TEXT NOT NULL DEFAULT 'in_progress',
				score_player1 INTEGER NOT NULL DEFAULT 0,
				score_player2 INTEGER NOT NULL DEFAULT 0,
				winner TEXT,
				started_at INTEGER,
				completed_at INTEGER,
				UNIQUE (game_id, match_number),
				FOREIGN KEY (game_id) REFERENCES games(game_id)
			);",
        ),
        M::up(
            "CREATE TABLE queue_entries(
				entry_id INTEGER PRIMARY KEY NOT NULL,
				player INTEGER NOT NULL,
				joined_at INTEGER NOT NULL,
				matched_at INTEGER,
				difficulty_preference TEXT NOT NULL DEFAULT 'medium',
				is_active INTEGER NOT NULL DEFAULT 1,
				status TEXT NOT NULL DEFAULT 'waiting',
				resulting_game INTEGER
			);
			CREATE INDEX idx_queue_active ON queue_entries(is_active, status);
			CREATE INDEX idx_queue_difficulty ON queue_entries(difficulty_preference, is_active);",
        ),
        M::up(
            "CREATE TABLE invitations(
				invite_id INTEGER PRIMARY KEY NOT NULL,
				invitation_code TEXT NOT NULL UNIQUE,
				sender INTEGER NOT NULL,
				recipient INTEGER NOT NULL,
				difficulty TEXT NOT NULL DEFAULT 'medium',
				status TEXT NOT NULL DEFAULT 'pending',
				created_at INTEGER NOT NULL,
				accepted_at INTEGER,
				declined_at INTEGER,
				expires_at INTEGER,
				resulting_game INTEGER
			);
			CREATE INDEX idx_invitations_status ON invitations(status);",
        ),
        M::up(
            "CREATE TABLE notifications(
				notification_id INTEGER PRIMARY KEY NOT NULL,
				username TEXT NOT NULL,
				kind TEXT NOT NULL,
				message TEXT NOT NULL,
				data TEXT NOT NULL DEFAULT '{}',
				created_at INTEGER NOT NULL,
				is_read INTEGER NOT NULL DEFAULT 0
			);",
        ),
    ]);

    let mut conn = Connection::open(path)?;

    migrations.to_latest(&mut conn)?;

    let db = DB { conn };
    Ok(db)
}
