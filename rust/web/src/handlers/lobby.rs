use serde::Deserialize;
use serde_json::{json, Map, Value};
use warp::http::StatusCode;
use warp::reply::Response;

use gametable_engine::Seat;

use crate::errors::ApiError;
use crate::lobby::Lobby;
use crate::server::AppContext;

use super::{error_response, success_response};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub seat: Seat,
    pub player_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRequest {
    pub player_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyRequest {
    pub player_id: String,
    pub ready: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameRequest {
    pub player_id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatRequest {
    pub player_id: String,
    pub seat: Seat,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotAiRequest {
    pub player_id: String,
    pub seat: Seat,
    pub is_ai: bool,
    #[serde(default)]
    pub ai_level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerOptionsRequest {
    pub player_id: String,
    #[serde(default)]
    pub player_options: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotPlayerOptionsRequest {
    pub player_id: String,
    pub seat: Seat,
    #[serde(default)]
    pub player_options: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameOptionsRequest {
    pub player_id: String,
    #[serde(default)]
    pub game_options: Map<String, Value>,
}

fn lobby_reply(result: Result<Lobby, ApiError>, ctx: &AppContext) -> Response {
    match result {
        Ok(lobby) => success_response(StatusCode::OK, json!({ "lobby": lobby })),
        Err(err) => {
            ctx.metrics().record_failure();
            error_response(err)
        }
    }
}

/// `GET /games/{id}/lobby`
pub async fn get_lobby(ctx: AppContext, game_id: String) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => session.get_lobby().await,
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/claim-position`
pub async fn claim_position(ctx: AppContext, game_id: String, request: ClaimRequest) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => {
            session
                .claim_seat(request.seat, &request.player_id, &request.name)
                .await
        }
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/leave-position`
pub async fn leave_position(ctx: AppContext, game_id: String, request: PlayerRequest) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => session.leave_seat(&request.player_id).await,
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/set-ready`
pub async fn set_ready(ctx: AppContext, game_id: String, request: ReadyRequest) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => session.set_ready(&request.player_id, request.ready).await,
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/update-name`
pub async fn update_name(ctx: AppContext, game_id: String, request: NameRequest) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => session.update_slot_name(&request.player_id, &request.name).await,
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/add-slot`
pub async fn add_slot(ctx: AppContext, game_id: String, request: PlayerRequest) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => session.add_slot(&request.player_id).await,
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/remove-slot`
pub async fn remove_slot(ctx: AppContext, game_id: String, request: SeatRequest) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => session.remove_slot(&request.player_id, request.seat).await,
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/set-slot-ai`
pub async fn set_slot_ai(ctx: AppContext, game_id: String, request: SlotAiRequest) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => {
            session
                .set_slot_ai(
                    &request.player_id,
                    request.seat,
                    request.is_ai,
                    request.ai_level.as_deref(),
                )
                .await
        }
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/kick-player`
pub async fn kick_player(ctx: AppContext, game_id: String, request: SeatRequest) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => session.kick_player(&request.player_id, request.seat).await,
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/player-options`
pub async fn player_options(
    ctx: AppContext,
    game_id: String,
    request: PlayerOptionsRequest,
) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => {
            session
                .update_player_options(&request.player_id, &request.player_options)
                .await
        }
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/slot-player-options`
pub async fn slot_player_options(
    ctx: AppContext,
    game_id: String,
    request: SlotPlayerOptionsRequest,
) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => {
            session
                .update_slot_player_options(
                    &request.player_id,
                    request.seat,
                    &request.player_options,
                )
                .await
        }
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/game-options`
pub async fn game_options(
    ctx: AppContext,
    game_id: String,
    request: GameOptionsRequest,
) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => {
            session
                .update_game_options(&request.player_id, &request.game_options)
                .await
        }
        Err(err) => Err(err),
    };
    lobby_reply(result, &ctx)
}

/// `POST /games/{id}/start` — the host fires the waiting -> playing edge.
pub async fn start_game(ctx: AppContext, game_id: String, request: PlayerRequest) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => session.start_game(&request.player_id).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(response) => success_response(StatusCode::OK, response),
        Err(err) => {
            ctx.metrics().record_failure();
            error_response(err)
        }
    }
}
