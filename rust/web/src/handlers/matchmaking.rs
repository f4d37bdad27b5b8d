use std::sync::Arc;

use serde::Deserialize;
use warp::http::StatusCode;
use warp::reply::Response;

use crate::server::AppContext;
use crate::session::{CreateGameOptions, GameSession};

use super::{error_response, success_response};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub game_type: String,
    pub player_count: u8,
    pub player_id: String,
    pub player_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequest {
    pub player_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    pub player_id: String,
}

/// `POST /matchmaking/join` — enqueue, and create a session the moment
/// the (gameType, playerCount) bucket fills.
pub async fn join(ctx: AppContext, request: JoinRequest) -> Response {
    ctx.metrics().record_request();
    let store = ctx.store();
    let result = ctx.matchmaker().join(
        &request.game_type,
        request.player_count,
        &request.player_id,
        &request.player_name,
        |members| {
            let game_id = uuid::Uuid::new_v4().to_string();
            let options = CreateGameOptions {
                game_type: request.game_type.clone(),
                player_count: members.len() as u8,
                player_names: Some(members.iter().map(|m| m.player_name.clone()).collect()),
                player_ids: Some(members.iter().map(|m| m.player_id.clone()).collect()),
                ..Default::default()
            };
            let session = GameSession::create(
                game_id.clone(),
                options,
                store.registry(),
                store.settings(),
                store.backend(),
            )?;
            store.create_game(Arc::clone(&session))?;
            ctx.metrics().session_opened();
            Ok(game_id)
        },
    );
    match result {
        Ok(status) => success_response(StatusCode::OK, status),
        Err(err) => {
            ctx.metrics().record_failure();
            error_response(err)
        }
    }
}

/// `POST /matchmaking/leave`
pub async fn leave(ctx: AppContext, request: LeaveRequest) -> Response {
    ctx.metrics().record_request();
    let removed = ctx.matchmaker().leave(&request.player_id);
    success_response(StatusCode::OK, serde_json::json!({ "removed": removed }))
}

/// `GET /matchmaking/status?playerId={id}`
pub async fn status(ctx: AppContext, query: StatusQuery) -> Response {
    ctx.metrics().record_request();
    match ctx.matchmaker().status(&query.player_id) {
        Ok(status) => success_response(StatusCode::OK, status),
        Err(err) => error_response(err),
    }
}
