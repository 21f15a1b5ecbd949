//! Notification sink. The core's only obligation is to persist the event;
//! delivery to the user is someone else's pipeline.

use serde_json::Value;

use crate::db_task::Store;

#[derive(Clone, Copy, Debug)]
pub enum NotifyKind {
    GameInvite,
    GameInviteAccepted,
    GameInviteDeclined,
    CancelRequest,
}

impl NotifyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyKind::GameInvite => "game_invite",
            NotifyKind::GameInviteAccepted => "game_invite_accepted",
            NotifyKind::GameInviteDeclined => "game_invite_declined",
            NotifyKind::CancelRequest => "cancel_request",
        }
    }
}

pub async fn notify(store: &Store, username: &str, kind: NotifyKind, message: &str, data: Value) {
    store
        .add_notification(username, kind.as_str(), message, data.to_string())
        .await;
}
