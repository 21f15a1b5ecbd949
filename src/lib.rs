//! Realtime backend of a two-player Pong platform: matchmaking, direct
//! invitations, and an authoritative per-room simulation over WebSockets,
//! with durable results in SQLite.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::info;

pub mod auth;
pub mod bus;
pub mod config;
pub mod data;
pub mod db_task;
pub mod game;
pub mod invitations;
pub mod matchmaking;
pub mod messages;
pub mod notify;

use bus::Bus;
use config::Config;
use db_task::Store;
use game::Registry;

/// Everything the connection handlers share: the store handle, the
/// in-process bus, and the room registry.
pub struct App {
    pub store: Store,
    pub bus: Bus,
    pub registry: Registry,
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/ws/matchmaking/", get(matchmaking_handler))
        .route("/ws/game/{game_id}/", get(game_handler))
        .route("/ws/invitations/", get(invitation_handler))
        .with_state(app)
}

pub async fn serve(config: Config) -> Result<()> {
    let store = db_task::run(&config.db_path)?;
    let app = Arc::new(App {
        store,
        bus: Bus::new(),
        registry: Registry::new(),
    });

    info!("starting server on {}", config.bind_addr);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, router(app)).await?;
    Ok(())
}

fn token_of(params: &HashMap<String, String>) -> Option<String> {
    params.get("token").cloned()
}

async fn matchmaking_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(app): State<Arc<App>>,
) -> impl IntoResponse {
    let token = token_of(&params);
    ws.on_upgrade(move |socket| matchmaking::handle_matchmaking_socket(app, socket, token))
}

async fn game_handler(
    ws: WebSocketUpgrade,
    Path(game_id): Path<i64>,
    Query(params): Query<HashMap<String, String>>,
    State(app): State<Arc<App>>,
) -> impl IntoResponse {
    let token = token_of(&params);
    ws.on_upgrade(move |socket| game::handle_game_socket(app, socket, game_id, token))
}

async fn invitation_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(app): State<Arc<App>>,
) -> impl IntoResponse {
    let token = token_of(&params);
    ws.on_upgrade(move |socket| invitations::handle_invitation_socket(app, socket, token))
}
