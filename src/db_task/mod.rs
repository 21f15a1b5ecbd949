use anyhow::Result;
use log::error;
use tokio::sync::{mpsc, oneshot};

mod backend;
mod frontend;

pub use frontend::Store;

use crate::data::{
    AcceptOutcome, Difficulty, GameId, GameOutcome, GameRecord, Invitation, InvitationInfo,
    InvitationsOf, MatchMade, MatchRecord, PlayerProfile, Side, UserId, UserRow,
};
use crate::messages::QueueReport;

enum Command {
    LookupSession {
        token: String,
        resp: Responder<Result<Option<UserId>>>,
    },
    CreateUser {
        username: String,
        avatar: String,
        resp: Responder<Result<UserId>>,
    },
    CreateSession {
        token: String,
        user: UserId,
        resp: Responder<Result<()>>,
    },
    GetUser {
        user: UserId,
        resp: Responder<Result<Option<UserRow>>>,
    },
    GetUserByName {
        username: String,
        resp: Responder<Result<Option<UserRow>>>,
    },
    SetPresence {
        user: UserId,
        online: bool,
    },
    GetOrCreateProfile {
        user: UserId,
        resp: Responder<Result<PlayerProfile>>,
    },
    Blocked {
        a: UserId,
        b: UserId,
        resp: Responder<Result<bool>>,
    },

    GetGame {
        game: GameId,
        resp: Responder<Result<Option<GameRecord>>>,
    },
    MarkGameStarted {
        game: GameId,
        resp: Responder<Result<()>>,
    },
    CancelGame {
        game: GameId,
        resp: Responder<Result<()>>,
    },
    ActiveGameFor {
        user: UserId,
        resp: Responder<Result<Option<GameId>>>,
    },
    StartMatch {
        game: GameId,
        match_number: i64,
        resp: Responder<Result<()>>,
    },
    CompleteMatch {
        game: GameId,
        match_number: i64,
        score_player1: i64,
        score_player2: i64,
        winner: Side,
        resp: Responder<Result<()>>,
    },
    FinalizeGame {
        outcome: GameOutcome,
        resp: Responder<Result<bool>>,
    },
    GetMatches {
        game: GameId,
        resp: Responder<Result<Vec<MatchRecord>>>,
    },

    JoinQueue {
        user: UserId,
        difficulty: Option<Difficulty>,
        resp: Responder<Result<QueueReport>>,
    },
    LeaveQueue {
        user: UserId,
        resp: Responder<Result<bool>>,
    },
    QueueStatus {
        user: UserId,
        resp: Responder<Result<QueueReport>>,
    },
    InQueue {
        user: UserId,
        resp: Responder<Result<bool>>,
    },
    FindMatches {
        resp: Responder<Result<Vec<MatchMade>>>,
    },

    CreateInvitation {
        sender: UserId,
        recipient: UserId,
        difficulty: Difficulty,
        code: String,
        resp: Responder<Result<Invitation>>,
    },
    GetInvitation {
        code: String,
        resp: Responder<Result<Option<InvitationInfo>>>,
    },
    AcceptInvitation {
        code: String,
        resp: Responder<Result<AcceptOutcome>>,
    },
    DeclineInvitation {
        code: String,
        resp: Responder<Result<bool>>,
    },
    ExpireInvitation {
        code: String,
        resp: Responder<Result<bool>>,
    },
    PendingBetween {
        sender: UserId,
        recipient: UserId,
        resp: Responder<Result<bool>>,
    },
    ActiveInvitations {
        user: UserId,
        resp: Responder<Result<InvitationsOf>>,
    },

    AddNotification {
        username: String,
        kind: String,
        message: String,
        data: String,
    },
}

type Responder<T> = oneshot::Sender<T>;

/// Start the store task over the database at `path` (`:memory:` in tests)
/// and hand back a cloneable handle to it.
pub fn run(path: &str) -> Result<Store> {
    let mut db = backend::create(path)?;
    let (tx, mut rx) = mpsc::channel(256);

    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if !db.handle_command(cmd) {
                error!("store command failed");
            }
        }
    });

    Ok(Store { tx })
}
