//! The invitation socket: a small state machine per invitation
//! (`pending → accepted | declined | expired`), whose accepted terminal
//! state feeds the same game-creation path as the matchmaker.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use thiserror::Error;

use crate::auth;
use crate::bus::user_group;
use crate::data::{AcceptOutcome, Difficulty, InvitationInfo, UserRow};
use crate::messages::{ClientMessage, InvitationDump, InviteSummary, ServerMessage};
use crate::notify::{notify, NotifyKind};
use crate::App;

const INVITATION_GROUP: &str = "game_invitations";
const CODE_LENGTH: usize = 8;

#[derive(Error, Debug)]
enum InviteError {
    #[error("recipient not found")]
    RecipientNotFound,
    #[error("you cannot invite yourself")]
    SelfInvite,
    #[error("you cannot invite this player")]
    Blocked,
    #[error("recipient is unavailable for a game")]
    Unavailable,
    #[error("a pending invitation to this player already exists")]
    Duplicate,
    #[error("invitation not found")]
    NotFound,
    #[error("this invitation is not for you")]
    NotRecipient,
    #[error("this is not your invitation to cancel")]
    NotSender,
    #[error("invitation is already {0}")]
    AlreadyHandled(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

type WsSender = SplitSink<WebSocket, Message>;

async fn send_frame(tx: &mut WsSender, frame: &ServerMessage) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    tx.send(Message::Text(json.into())).await?;
    Ok(())
}

pub async fn handle_invitation_socket(app: Arc<App>, mut socket: WebSocket, token: Option<String>) {
    let user_id = match auth::authenticate(&app.store, token.as_deref()).await {
        Some(user_id) => user_id,
        None => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 4001,
                    reason: "authentication required".into(),
                })))
                .await;
            return;
        }
    };

    let me = match app.store.get_user(user_id).await {
        Ok(Some(me)) => me,
        Ok(None) => {
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: 4001,
                    reason: "unknown user".into(),
                })))
                .await;
            return;
        }
        Err(e) => {
            error!("invitations: failed to load user {user_id}: {e:?}");
            return;
        }
    };

    if let Err(e) = session(app, socket, me).await {
        error!("invitations: connection for user {user_id} failed: {e:?}");
    }
}

async fn session(app: Arc<App>, socket: WebSocket, me: UserRow) -> Result<()> {
    let (channel_id, mut outbound) = app.bus.register();
    app.bus.group_add(INVITATION_GROUP, channel_id);
    app.bus.group_add(&user_group(me.id), channel_id);

    // this is the social socket, so it carries presence
    app.store.set_presence(me.id, true).await;
    info!("invitations: user {} ({}) connected", me.id, me.username);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let greeted: Result<()> = async {
        send_frame(
            &mut ws_tx,
            &ServerMessage::ConnectionEstablished {
                player_number: None,
                game_id: None,
                message: Some("Connected to invitation server".to_string()),
            },
        )
        .await?;

        let invitations = pending_dump(&app, me.id).await.unwrap_or_default();
        send_frame(&mut ws_tx, &ServerMessage::ActiveInvitations { invitations }).await?;
        Ok(())
    }
    .await;

    if let Err(e) = &greeted {
        warn!("invitations: could not greet user {}: {e:?}", me.id);
    }

    // a failed greeting still runs the teardown below
    while greeted.is_ok() {
        tokio::select! {
            delivery = outbound.recv() => {
                match delivery {
                    None => break,
                    Some(crate::bus::Outbound::Frame(frame)) => {
                        if send_frame(&mut ws_tx, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(crate::bus::Outbound::Close { code, reason }) => {
                        let _ = ws_tx
                            .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
                            .await;
                        break;
                    }
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => {
                                if let Err(e) = handle_message(&app, &me, message, &mut ws_tx).await {
                                    if let InviteError::Other(inner) = &e {
                                        error!("invitations: internal error: {inner:?}");
                                    }
                                    let _ = send_frame(
                                        &mut ws_tx,
                                        &ServerMessage::error(e.to_string()),
                                    )
                                    .await;
                                }
                            }
                            Err(e) => {
                                debug!("invitations: unparseable frame: {e}");
                                let _ = send_frame(&mut ws_tx, &ServerMessage::error("invalid message")).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("invitations: read from user {} failed: {e:?}", me.id);
                        break;
                    }
                }
            }
        }
    }

    app.store.set_presence(me.id, false).await;
    app.bus.group_discard(INVITATION_GROUP, channel_id);
    app.bus.group_discard(&user_group(me.id), channel_id);
    app.bus.unregister(channel_id);
    info!("invitations: user {} disconnected", me.id);

    Ok(())
}

async fn handle_message(
    app: &Arc<App>,
    me: &UserRow,
    message: ClientMessage,
    ws_tx: &mut WsSender,
) -> Result<(), InviteError> {
    match message {
        ClientMessage::SendInvitation {
            username,
            difficulty,
        } => send_invitation(app, me, &username, difficulty, ws_tx).await,
        ClientMessage::AcceptInvitation { invitation_code } => {
            accept_invitation(app, me, &invitation_code, ws_tx).await
        }
        ClientMessage::DeclineInvitation { invitation_code } => {
            decline_invitation(app, me, &invitation_code, ws_tx).await
        }
        ClientMessage::CancelInvitation { invitation_code } => {
            cancel_invitation(app, me, &invitation_code, ws_tx).await
        }
        ClientMessage::GetActiveInvitations => {
            let invitations = pending_dump(app, me.id).await?;
            send_frame(ws_tx, &ServerMessage::ActiveInvitations { invitations })
                .await
                .map_err(InviteError::Other)?;
            Ok(())
        }
        ClientMessage::Ping => {
            send_frame(ws_tx, &ServerMessage::Pong)
                .await
                .map_err(InviteError::Other)?;
            Ok(())
        }
        _ => {
            send_frame(ws_tx, &ServerMessage::error("unsupported message on this socket"))
                .await
                .map_err(InviteError::Other)?;
            Ok(())
        }
    }
}

/// A recipient must exist, not be the sender, not be blocked either way,
/// not be mid-game, not be queued, and not already hold a pending invite
/// from this sender.
async fn send_invitation(
    app: &Arc<App>,
    me: &UserRow,
    username: &str,
    difficulty: Option<Difficulty>,
    ws_tx: &mut WsSender,
) -> Result<(), InviteError> {
    let recipient = app
        .store
        .get_user_by_name(username)
        .await?
        .ok_or(InviteError::RecipientNotFound)?;

    if recipient.id == me.id {
        return Err(InviteError::SelfInvite);
    }
    if app.store.blocked(me.id, recipient.id).await? {
        return Err(InviteError::Blocked);
    }
    if app.store.active_game_for(recipient.id).await?.is_some() {
        return Err(InviteError::Unavailable);
    }
    if app.store.in_queue(recipient.id).await? {
        return Err(InviteError::Unavailable);
    }
    if app.store.pending_between(me.id, recipient.id).await? {
        return Err(InviteError::Duplicate);
    }

    let difficulty = match difficulty {
        Some(difficulty) => difficulty,
        None => app.store.get_or_create_profile(me.id).await?.difficulty,
    };

    let code = fresh_code(app).await?;
    let invitation = app
        .store
        .create_invitation(me.id, recipient.id, difficulty, &code)
        .await?;

    notify(
        &app.store,
        &recipient.username,
        NotifyKind::GameInvite,
        &format!("{} invited you to play Pong", me.username),
        json!({
            "invitation_code": invitation.code,
            "sender_username": me.username,
            "sender_avatar": me.avatar,
        }),
    )
    .await;

    app.bus
        .group_frame(
            &user_group(recipient.id),
            ServerMessage::InvitationReceived {
                invitation_code: invitation.code.clone(),
                sender: me.username.clone(),
                sender_avatar: me.avatar.clone(),
                difficulty,
            },
        )
        .await;

    send_frame(
        ws_tx,
        &ServerMessage::InvitationSent {
            invitation_code: invitation.code,
            recipient: recipient.username,
            difficulty,
        },
    )
    .await
    .map_err(InviteError::Other)?;

    Ok(())
}

async fn accept_invitation(
    app: &Arc<App>,
    me: &UserRow,
    code: &str,
    ws_tx: &mut WsSender,
) -> Result<(), InviteError> {
    let info = load_invitation(app, code).await?;
    if info.invitation.recipient != me.id {
        return Err(InviteError::NotRecipient);
    }

    match app.store.accept_invitation(code).await? {
        AcceptOutcome::Created(game_id) => {
            notify(
                &app.store,
                &info.sender.username,
                NotifyKind::GameInviteAccepted,
                &format!("{} accepted your game invitation", me.username),
                json!({
                    "game_id": game_id,
                    "invitation_code": code,
                    "join_url": format!("/game/{game_id}/"),
                }),
            )
            .await;

            app.bus
                .group_frame(
                    &user_group(info.sender.id),
                    ServerMessage::InvitationAccepted {
                        invitation_code: code.to_string(),
                        game_id,
                        message: None,
                    },
                )
                .await;

            send_frame(
                ws_tx,
                &ServerMessage::InvitationAccepted {
                    invitation_code: code.to_string(),
                    game_id,
                    message: None,
                },
            )
            .await
            .map_err(InviteError::Other)?;
            Ok(())
        }

        AcceptOutcome::AlreadyAccepted(game_id) => {
            send_frame(
                ws_tx,
                &ServerMessage::InvitationAccepted {
                    invitation_code: code.to_string(),
                    game_id,
                    message: Some("Invitation was already accepted".to_string()),
                },
            )
            .await
            .map_err(InviteError::Other)?;
            Ok(())
        }

        AcceptOutcome::NotPending(status) => Err(InviteError::AlreadyHandled(status.as_str())),
        AcceptOutcome::NotFound => Err(InviteError::NotFound),
    }
}

async fn decline_invitation(
    app: &Arc<App>,
    me: &UserRow,
    code: &str,
    ws_tx: &mut WsSender,
) -> Result<(), InviteError> {
    let info = load_invitation(app, code).await?;
    if info.invitation.recipient != me.id {
        return Err(InviteError::NotRecipient);
    }

    if !app.store.decline_invitation(code).await? {
        return Err(InviteError::AlreadyHandled(info.invitation.status.as_str()));
    }

    notify(
        &app.store,
        &info.sender.username,
        NotifyKind::GameInviteDeclined,
        &format!("{} declined your game invitation", me.username),
        json!({ "invitation_code": code }),
    )
    .await;

    app.bus
        .group_frame(
            &user_group(info.sender.id),
            ServerMessage::InvitationDeclined {
                invitation_code: code.to_string(),
                username: me.username.clone(),
            },
        )
        .await;

    send_frame(
        ws_tx,
        &ServerMessage::InvitationDeclined {
            invitation_code: code.to_string(),
            username: info.sender.username,
        },
    )
    .await
    .map_err(InviteError::Other)?;

    Ok(())
}

async fn cancel_invitation(
    app: &Arc<App>,
    me: &UserRow,
    code: &str,
    ws_tx: &mut WsSender,
) -> Result<(), InviteError> {
    let info = load_invitation(app, code).await?;
    if info.invitation.sender != me.id {
        return Err(InviteError::NotSender);
    }

    if !app.store.expire_invitation(code).await? {
        return Err(InviteError::AlreadyHandled(info.invitation.status.as_str()));
    }

    notify(
        &app.store,
        &info.recipient.username,
        NotifyKind::CancelRequest,
        &format!("{} withdrew their game invitation", me.username),
        json!({ "invitation_code": code }),
    )
    .await;

    app.bus
        .group_frame(
            &user_group(info.recipient.id),
            ServerMessage::InvitationCancelled {
                invitation_code: code.to_string(),
                username: me.username.clone(),
            },
        )
        .await;

    send_frame(
        ws_tx,
        &ServerMessage::InvitationCancelled {
            invitation_code: code.to_string(),
            username: info.recipient.username,
        },
    )
    .await
    .map_err(InviteError::Other)?;

    Ok(())
}

async fn load_invitation(app: &Arc<App>, code: &str) -> Result<InvitationInfo, InviteError> {
    app.store
        .get_invitation(code)
        .await?
        .ok_or(InviteError::NotFound)
}

async fn pending_dump(app: &Arc<App>, user: crate::data::UserId) -> Result<InvitationDump> {
    let raw = app.store.active_invitations(user).await?;
    Ok(InvitationDump {
        sent: raw
            .sent
            .into_iter()
            .map(|(invitation, counterpart)| InviteSummary {
                invitation_code: invitation.code,
                username: counterpart.username,
                avatar: counterpart.avatar,
                difficulty: invitation.difficulty,
            })
            .collect(),
        received: raw
            .received
            .into_iter()
            .map(|(invitation, counterpart)| InviteSummary {
                invitation_code: invitation.code,
                username: counterpart.username,
                avatar: counterpart.avatar,
                difficulty: invitation.difficulty,
            })
            .collect(),
    })
}

/// Invitation codes are short and visible to users; retry on the unlikely
/// collision with an existing one.
async fn fresh_code(app: &Arc<App>) -> Result<String, InviteError> {
    for _ in 0..8 {
        let code: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CODE_LENGTH)
            .map(char::from)
            .collect();
        if app.store.get_invitation(&code).await?.is_none() {
            return Ok(code);
        }
    }
    Err(InviteError::Other(anyhow::anyhow!(
        "could not generate a unique invitation code"
    )))
}
