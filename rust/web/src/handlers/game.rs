use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::reply::Response;

use gametable_engine::{Seat, SerializedValue};

use crate::errors::ApiError;
use crate::server::AppContext;
use crate::session::{CreateGameOptions, GameSession};

use super::{error_response, success_response};

#[derive(Debug, Deserialize)]
pub struct StateQuery {
    #[serde(default)]
    pub player: Option<Seat>,
}

#[derive(Debug, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    pub player: Seat,
    #[serde(default)]
    pub args: BTreeMap<String, SerializedValue>,
}

#[derive(Debug, Deserialize)]
pub struct UndoRequest {
    pub player: Seat,
}

#[derive(Debug, Deserialize)]
pub struct RewindRequest {
    pub index: usize,
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub from: usize,
    pub to: usize,
    #[serde(default)]
    pub player: Option<Seat>,
}

async fn resolve(ctx: &AppContext, game_id: &str) -> Result<Arc<GameSession>, ApiError> {
    ctx.store().require_game(game_id)
}

/// `POST /games`
pub async fn create_game(ctx: AppContext, options: CreateGameOptions) -> Response {
    ctx.metrics().record_request();
    let game_id = uuid::Uuid::new_v4().to_string();
    let created = GameSession::create(
        game_id.clone(),
        options,
        ctx.store().registry(),
        ctx.store().settings(),
        ctx.store().backend(),
    )
    .and_then(|session| {
        ctx.store().create_game(Arc::clone(&session))?;
        Ok(session)
    });

    match created {
        Ok(session) => {
            ctx.metrics().session_opened();
            let state = session.get_state(None).await;
            success_response(
                StatusCode::CREATED,
                json!({
                    "gameId": session.game_id(),
                    "state": state.state,
                    "flowState": state.flow_state,
                    "lobby": state.lobby,
                }),
            )
        }
        Err(err) => {
            ctx.metrics().record_failure();
            error_response(err)
        }
    }
}

/// `GET /games` — active game ids.
pub async fn list_games(ctx: AppContext) -> Response {
    ctx.metrics().record_request();
    success_response(StatusCode::OK, json!({ "games": ctx.store().list_active() }))
}

/// `GET /games/{id}?player={seat}`
pub async fn get_state(ctx: AppContext, game_id: String, query: StateQuery) -> Response {
    ctx.metrics().record_request();
    match resolve(&ctx, &game_id).await {
        Ok(session) => {
            let state = session.get_state(query.player).await;
            success_response(StatusCode::OK, state)
        }
        Err(err) => error_response(err),
    }
}

/// `POST /games/{id}/action` — one-shot action with concrete args.
pub async fn post_action(ctx: AppContext, game_id: String, request: ActionRequest) -> Response {
    ctx.metrics().record_request();
    let result = match resolve(&ctx, &game_id).await {
        Ok(session) => {
            session
                .perform_action(&request.action, request.player, request.args)
                .await
        }
        Err(err) => Err(err),
    };
    match result {
        Ok(response) => {
            if let Err(err) = ctx.store().persist(&game_id) {
                ctx.metrics().record_failure();
                return error_response(err);
            }
            success_response(StatusCode::OK, response)
        }
        Err(err) => {
            ctx.metrics().record_failure();
            error_response(err)
        }
    }
}

/// `GET /games/{id}/history`
pub async fn get_history(ctx: AppContext, game_id: String) -> Response {
    ctx.metrics().record_request();
    match resolve(&ctx, &game_id).await {
        Ok(session) => success_response(StatusCode::OK, session.get_history().await),
        Err(err) => error_response(err),
    }
}

/// `POST /games/{id}/undo`
pub async fn post_undo(ctx: AppContext, game_id: String, request: UndoRequest) -> Response {
    ctx.metrics().record_request();
    let result = match resolve(&ctx, &game_id).await {
        Ok(session) => session.undo_to_turn_start(request.player).await,
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

/// `POST /games/{id}/restart` — same id, fresh seed, empty log.
pub async fn post_restart(ctx: AppContext, game_id: String) -> Response {
    ctx.metrics().record_request();
    let result = match resolve(&ctx, &game_id).await {
        Ok(session) => session.restart().await,
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

/// `POST /games/{id}/rewind` — debug-only arbitrary rewind.
pub async fn post_rewind(ctx: AppContext, game_id: String, request: RewindRequest) -> Response {
    ctx.metrics().record_request();
    let result = match resolve(&ctx, &game_id).await {
        Ok(session) => session.rewind_to_action(request.index).await,
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

/// `GET /games/{id}/state-at/{idx}?player={seat}` — time-travel read.
pub async fn get_state_at(
    ctx: AppContext,
    game_id: String,
    idx: usize,
    query: StateQuery,
) -> Response {
    ctx.metrics().record_request();
    let result = match resolve(&ctx, &game_id).await {
        Ok(session) => session.get_state_at_action(idx, query.player).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(response) => success_response(StatusCode::OK, response),
        Err(err) => error_response(err),
    }
}

/// `GET /games/{id}/state-diff?from=&to=&player=`
pub async fn get_state_diff(ctx: AppContext, game_id: String, query: DiffQuery) -> Response {
    ctx.metrics().record_request();
    let result = match resolve(&ctx, &game_id).await {
        Ok(session) => session.get_state_diff(query.from, query.to, query.player).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(diff) => success_response(StatusCode::OK, diff),
        Err(err) => error_response(err),
    }
}
