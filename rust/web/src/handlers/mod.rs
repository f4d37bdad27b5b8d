pub mod game;
pub mod health;
pub mod lobby;
pub mod matchmaking;
pub mod pending;
pub mod ws;

use serde::Serialize;
use serde_json::Value;
use warp::http::StatusCode;
use warp::reply::{self, Response};
use warp::Reply;

use crate::errors::{ApiError, IntoErrorResponse};

/// Success envelope: `{ success: true, ...payload }`.
pub(crate) fn success_response<T: Serialize>(status: StatusCode, payload: T) -> Response {
    let value = serde_json::to_value(payload).unwrap_or(Value::Null);
    let wrapped = match value {
        Value::Object(mut map) => {
            map.insert("success".to_string(), Value::Bool(true));
            Value::Object(map)
        }
        Value::Null => serde_json::json!({ "success": true }),
        other => serde_json::json!({ "success": true, "result": other }),
    };
    reply::with_status(reply::json(&wrapped), status).into_response()
}

pub(crate) fn error_response(err: ApiError) -> Response {
    err.into_http_response()
}
