//! JSON frames exchanged with clients. Every frame carries a `type` tag;
//! inbound frames that fail to parse are answered with an `error` frame
//! rather than dropping the connection.

use serde::{Deserialize, Serialize};

use crate::data::{Difficulty, GameId, Side};
use crate::game::{GameSnapshot, RoomStatus};

/// Everything a client may send, across all three sockets. Each socket
/// handles the subset that concerns it and answers the rest with an error.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // game socket
    PaddleMove {
        position: f64,
    },
    StartGame,
    TogglePause,
    NextMatch,
    Ping,

    // matchmaking socket
    JoinQueue {
        #[serde(default)]
        difficulty: Option<Difficulty>,
    },
    LeaveQueue,
    RequestStatus,

    // invitation socket
    SendInvitation {
        username: String,
        #[serde(default)]
        difficulty: Option<Difficulty>,
    },
    AcceptInvitation {
        invitation_code: String,
    },
    DeclineInvitation {
        invitation_code: String,
    },
    CancelInvitation {
        invitation_code: String,
    },
    GetActiveInvitations,
}

/// Queue position report, sent as the `status` payload of `queue_status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueueReport {
    InQueue {
        position: i64,
        total_waiting: i64,
        difficulty: Difficulty,
        joined_at: i64,
    },
    AlreadyInQueue {
        position: i64,
    },
    LeftQueue,
    NotInQueue,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InviteSummary {
    pub invitation_code: String,
    pub username: String,
    pub avatar: String,
    pub difficulty: Difficulty,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct InvitationDump {
    pub sent: Vec<InviteSummary>,
    pub received: Vec<InviteSummary>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        #[serde(skip_serializing_if = "Option::is_none")]
        player_number: Option<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        game_id: Option<GameId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    GameState {
        state: GameSnapshot,
    },
    GameStatusChanged {
        status: RoomStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        winner: Option<Side>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    PlayerStatus {
        player: u8,
        connected: bool,
    },
    ForceDisconnect {
        reason: String,
    },
    WaitingForOpponent {
        seconds_elapsed: u64,
        seconds_remaining: u64,
    },
    Timeout {
        message: String,
    },
    GameCompleted {
        winner: Option<Side>,
        final_state: GameSnapshot,
    },
    Pong,
    Error {
        message: String,
    },

    QueueStatus {
        status: QueueReport,
    },
    MatchFound {
        game_id: GameId,
        player1: String,
        player2: String,
        opponent_avatar: String,
        game_url: String,
    },

    ActiveInvitations {
        invitations: InvitationDump,
    },
    InvitationSent {
        invitation_code: String,
        recipient: String,
        difficulty: Difficulty,
    },
    InvitationReceived {
        invitation_code: String,
        sender: String,
        sender_avatar: String,
        difficulty: Difficulty,
    },
    InvitationAccepted {
        invitation_code: String,
        game_id: GameId,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    InvitationDeclined {
        invitation_code: String,
        username: String,
    },
    InvitationCancelled {
        invitation_code: String,
        username: String,
    },
    InvitationExpired {
        invitation_code: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> ServerMessage {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_parse_by_type_tag() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"paddle_move","position":120.5}"#).unwrap();
        assert!(matches!(msg, ClientMessage::PaddleMove { position } if position == 120.5));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join_queue","difficulty":"hard"}"#).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::JoinQueue {
                difficulty: Some(Difficulty::Hard)
            }
        ));

        // difficulty may be omitted entirely
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"join_queue"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinQueue { difficulty: None }));

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch_missiles"}"#).is_err());
    }

    #[test]
    fn server_frames_carry_type_tag() {
        let json = serde_json::to_string(&ServerMessage::PlayerStatus {
            player: 1,
            connected: true,
        })
        .unwrap();
        assert!(json.contains(r#""type":"player_status""#));

        let json = serde_json::to_string(&ServerMessage::QueueStatus {
            status: QueueReport::NotInQueue,
        })
        .unwrap();
        assert!(json.contains(r#""status":{"status":"not_in_queue"}"#));
    }

    #[test]
    fn optional_fields_are_omitted() {
        let json = serde_json::to_string(&ServerMessage::ConnectionEstablished {
            player_number: Some(2),
            game_id: Some(7),
            message: None,
        })
        .unwrap();
        assert!(json.contains(r#""player_number":2"#));
        assert!(!json.contains("message"));
    }
}
