use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::json;
use warp::http::StatusCode;
use warp::reply::Response;

use gametable_engine::{Seat, SerializedValue};

use crate::server::AppContext;

use super::{error_response, success_response};

#[derive(Debug, Deserialize)]
pub struct StartActionRequest {
    pub action: String,
    pub player: Seat,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionStepRequest {
    pub player: Seat,
    pub selection: String,
    pub value: SerializedValue,
    /// Implicitly starts this action when no pending exists.
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub initial_args: Option<BTreeMap<String, SerializedValue>>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub player: Seat,
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    pub player: Seat,
}

#[derive(Debug, Deserialize)]
pub struct ChoicesQuery {
    pub action: String,
    pub selection: String,
    pub player: Seat,
    /// URL-encoded JSON object of already-made selections.
    #[serde(default)]
    pub args: Option<String>,
}

/// `POST /games/{id}/start-action`
pub async fn start_action(
    ctx: AppContext,
    game_id: String,
    request: StartActionRequest,
) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => {
            session
                .start_pending_action(&request.action, request.player)
                .await
        }
        Err(err) => Err(err),
    };
    match result {
        Ok(pending) => success_response(StatusCode::OK, json!({ "pendingState": pending })),
        Err(err) => {
            ctx.metrics().record_failure();
            error_response(err)
        }
    }
}

/// `POST /games/{id}/selection-step`
pub async fn selection_step(
    ctx: AppContext,
    game_id: String,
    request: SelectionStepRequest,
) -> Response {
    ctx.metrics().record_request();
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => {
            session
                .process_selection_step(
                    request.player,
                    &request.selection,
                    request.value,
                    request.action.as_deref(),
                    request.initial_args,
                )
                .await
        }
        Err(err) => Err(err),
    };
    match result {
        Ok(step) => success_response(StatusCode::OK, step),
        Err(err) => {
            ctx.metrics().record_failure();
            error_response(err)
        }
    }
}

/// `POST /games/{id}/cancel-action`
pub async fn cancel_action(ctx: AppContext, game_id: String, request: CancelRequest) -> Response {
    ctx.metrics().record_request();
    match ctx.store().require_game(&game_id) {
        Ok(session) => {
            let canceled = session.cancel_pending_action(request.player).await;
            success_response(StatusCode::OK, json!({ "canceled": canceled }))
        }
        Err(err) => error_response(err),
    }
}

/// `GET /games/{id}/pending-action?player={seat}`
pub async fn get_pending(ctx: AppContext, game_id: String, query: PendingQuery) -> Response {
    ctx.metrics().record_request();
    match ctx.store().require_game(&game_id) {
        Ok(session) => {
            let pending = session.get_pending(query.player).await;
            success_response(StatusCode::OK, json!({ "pendingState": pending }))
        }
        Err(err) => error_response(err),
    }
}

/// `GET /games/{id}/selection-choices?action=&selection=&player=&args=`
pub async fn selection_choices(ctx: AppContext, game_id: String, query: ChoicesQuery) -> Response {
    ctx.metrics().record_request();
    let args: BTreeMap<String, SerializedValue> = match &query.args {
        None => BTreeMap::new(),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(args) => args,
            Err(err) => {
                return error_response(crate::errors::ApiError::invalid_args(format!(
                    "args must be a JSON object: {err}"
                )))
            }
        },
    };
    let result = match ctx.store().require_game(&game_id) {
        Ok(session) => {
            session
                .get_selection_choices(&query.action, &query.selection, query.player, args)
                .await
        }
        Err(err) => Err(err),
    };
    match result {
        Ok(choices) => success_response(
            StatusCode::OK,
            json!({
                "choices": choices.choices,
                "validElements": choices.valid_elements,
                "multiSelect": choices.multi_select,
            }),
        ),
        Err(err) => error_response(err),
    }
}
