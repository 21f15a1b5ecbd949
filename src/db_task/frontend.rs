use anyhow::Result;
use tokio::sync::{mpsc, oneshot};

use crate::data::{
    AcceptOutcome, Difficulty, GameId, GameOutcome, GameRecord, Invitation, InvitationInfo,
    InvitationsOf, MatchMade, MatchRecord, PlayerProfile, Side, UserId, UserRow,
};
use crate::messages::QueueReport;

use super::Command;

/// Cloneable handle to the store task. Every method is one command round
/// trip; fire-and-forget writes skip the responder.
#[derive(Clone)]
pub struct Store {
    pub(super) tx: mpsc::Sender<Command>,
}

impl Store {
    pub async fn lookup_session(&self, token: &str) -> Result<Option<UserId>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::LookupSession {
                token: token.to_string(),
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn create_user(&self, username: &str, avatar: &str) -> Result<UserId> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::CreateUser {
                username: username.to_string(),
                avatar: avatar.to_string(),
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn create_session(&self, token: &str, user: UserId) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::CreateSession {
                token: token.to_string(),
                user,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn get_user(&self, user: UserId) -> Result<Option<UserRow>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::GetUser { user, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn get_user_by_name(&self, username: &str) -> Result<Option<UserRow>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::GetUserByName {
                username: username.to_string(),
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    /// Presence write; never blocks the caller on the database.
    pub async fn set_presence(&self, user: UserId, online: bool) {
        self.tx
            .send(Command::SetPresence { user, online })
            .await
            .unwrap();
    }

    pub async fn get_or_create_profile(&self, user: UserId) -> Result<PlayerProfile> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::GetOrCreateProfile { user, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn blocked(&self, a: UserId, b: UserId) -> Result<bool> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::Blocked { a, b, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn get_game(&self, game: GameId) -> Result<Option<GameRecord>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::GetGame { game, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn mark_game_started(&self, game: GameId) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::MarkGameStarted { game, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn cancel_game(&self, game: GameId) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::CancelGame { game, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn active_game_for(&self, user: UserId) -> Result<Option<GameId>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::ActiveGameFor { user, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn start_match(&self, game: GameId, match_number: i64) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::StartMatch {
                game,
                match_number,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn complete_match(
        &self,
        game: GameId,
        match_number: i64,
        score_player1: i64,
        score_player2: i64,
        winner: Side,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::CompleteMatch {
                game,
                match_number,
                score_player1,
                score_player2,
                winner,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    /// Terminal persistence of a room. Returns false when the game was
    /// already cancelled or completed and nothing was written.
    pub async fn finalize_game(&self, outcome: GameOutcome) -> Result<bool> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::FinalizeGame { outcome, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn get_matches(&self, game: GameId) -> Result<Vec<MatchRecord>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::GetMatches { game, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn join_queue(
        &self,
        user: UserId,
        difficulty: Option<Difficulty>,
    ) -> Result<QueueReport> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::JoinQueue {
                user,
                difficulty,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn leave_queue(&self, user: UserId) -> Result<bool> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::LeaveQueue { user, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn queue_status(&self, user: UserId) -> Result<QueueReport> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::QueueStatus { user, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn in_queue(&self, user: UserId) -> Result<bool> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::InQueue { user, resp })
            .await
            .unwrap();
        rx.await?
    }

    /// One pairing pass over the whole queue. Caller must hold the
    /// matchmaking lock.
    pub async fn find_matches(&self) -> Result<Vec<MatchMade>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::FindMatches { resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn create_invitation(
        &self,
        sender: UserId,
        recipient: UserId,
        difficulty: Difficulty,
        code: &str,
    ) -> Result<Invitation> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::CreateInvitation {
                sender,
                recipient,
                difficulty,
                code: code.to_string(),
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn get_invitation(&self, code: &str) -> Result<Option<InvitationInfo>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::GetInvitation {
                code: code.to_string(),
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn accept_invitation(&self, code: &str) -> Result<AcceptOutcome> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::AcceptInvitation {
                code: code.to_string(),
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn decline_invitation(&self, code: &str) -> Result<bool> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::DeclineInvitation {
                code: code.to_string(),
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn expire_invitation(&self, code: &str) -> Result<bool> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::ExpireInvitation {
                code: code.to_string(),
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn pending_between(&self, sender: UserId, recipient: UserId) -> Result<bool> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::PendingBetween {
                sender,
                recipient,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn active_invitations(&self, user: UserId) -> Result<InvitationsOf> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::ActiveInvitations { user, resp })
            .await
            .unwrap();
        rx.await?
    }

    /// Fire-and-forget notification row for the external delivery pipeline.
    pub async fn add_notification(&self, username: &str, kind: &str, message: &str, data: String) {
        self.tx
            .send(Command::AddNotification {
                username: username.to_string(),
                kind: kind.to_string(),
                message: message.to_string(),
                data,
            })
            .await
            .unwrap();
    }
}
