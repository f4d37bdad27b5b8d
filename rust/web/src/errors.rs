//! Error handling for the server core.
//!
//! Every handler-facing failure is an [`ApiError`]: a stable machine
//! `errorCode`, an HTTP status, and a human message. Engine and storage
//! errors convert into it at the session boundary so clients always see
//! the same `{ success: false, error, errorCode }` shape.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use warp::http::StatusCode;
use warp::reply::{self, Response};
use warp::Reply;

use gametable_engine::EngineError;

/// Stable machine-readable error codes surfaced as `errorCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    Forbidden,
    IllegalAction,
    InvalidArgs,
    InvalidStep,
    GameOver,
    OutOfRange,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::IllegalAction => "ILLEGAL_ACTION",
            ErrorCode::InvalidArgs => "INVALID_ARGS",
            ErrorCode::InvalidStep => "INVALID_STEP",
            ErrorCode::GameOver => "GAME_OVER",
            ErrorCode::OutOfRange => "OUT_OF_RANGE",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::IllegalAction
            | ErrorCode::InvalidArgs
            | ErrorCode::InvalidStep
            | ErrorCode::GameOver
            | ErrorCode::OutOfRange => StatusCode::BAD_REQUEST,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The one failure type handlers and the session layer trade in.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn illegal_action(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::IllegalAction, message)
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgs, message)
    }

    pub fn invalid_step(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidStep, message)
    }

    pub fn game_over() -> Self {
        Self::new(ErrorCode::GameOver, "game is already complete")
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::OutOfRange, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let code = match &err {
            EngineError::NotYourTurn { .. } | EngineError::IllegalAction(_) => {
                ErrorCode::IllegalAction
            }
            EngineError::GameOver => ErrorCode::GameOver,
            EngineError::UnknownAction(_) => ErrorCode::NotFound,
            EngineError::UnknownSelection { .. }
            | EngineError::InvalidArgs(_)
            | EngineError::DanglingRef(_) => ErrorCode::InvalidArgs,
            EngineError::SnapshotVersion { .. } | EngineError::CorruptSnapshot(_) => {
                ErrorCode::Internal
            }
        };
        ApiError::new(code, err.to_string())
    }
}

/// Standard failure body for all endpoints: spec'd `success: false` plus
/// the machine code and human message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    #[serde(rename = "errorCode")]
    pub error_code: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
            error_code: code.as_str().to_string(),
        }
    }

    pub fn into_response(self, status: StatusCode) -> Response {
        reply::with_status(reply::json(&self), status).into_response()
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.error)
    }
}

/// Error classification for logging levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Client errors (4xx), expected in normal operation.
    Client,
    /// Server errors (5xx), need investigation.
    Server,
}

/// Conversion of errors to HTTP responses with severity-driven logging.
pub trait IntoErrorResponse {
    fn status_code(&self) -> StatusCode;
    fn error_code(&self) -> ErrorCode;
    fn error_message(&self) -> String;

    fn severity(&self) -> ErrorSeverity {
        if self.status_code().is_server_error() {
            ErrorSeverity::Server
        } else {
            ErrorSeverity::Client
        }
    }

    fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.error_code(), self.error_message())
    }

    fn into_http_response(self) -> Response
    where
        Self: Sized,
    {
        let status = self.status_code();
        let body = self.to_error_response();
        match self.severity() {
            ErrorSeverity::Client => {
                tracing::info!(code = body.error_code.as_str(), error = %body.error, "client error");
            }
            ErrorSeverity::Server => {
                tracing::error!(code = body.error_code.as_str(), error = %body.error, "server error");
            }
        }
        body.into_response(status)
    }
}

impl IntoErrorResponse for ApiError {
    fn status_code(&self) -> StatusCode {
        self.code.status()
    }

    fn error_code(&self) -> ErrorCode {
        self.code
    }

    fn error_message(&self) -> String {
        self.message.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_shape() {
        let body = ErrorResponse::new(ErrorCode::Conflict, "slot already claimed");
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(json["success"], false);
        assert_eq!(json["errorCode"], "CONFLICT");
        assert_eq!(json["error"], "slot already claimed");
    }

    #[test]
    fn engine_errors_map_to_codes() {
        let err: ApiError = EngineError::GameOver.into();
        assert_eq!(err.code, ErrorCode::GameOver);

        let err: ApiError = EngineError::NotYourTurn { expected: 1, actual: 2 }.into();
        assert_eq!(err.code, ErrorCode::IllegalAction);

        let err: ApiError = EngineError::DanglingRef("element id 9".into()).into();
        assert_eq!(err.code, ErrorCode::InvalidArgs);

        let err: ApiError = EngineError::CorruptSnapshot("bad".into()).into();
        assert_eq!(err.code, ErrorCode::Internal);
    }

    #[test]
    fn status_codes_follow_the_contract() {
        assert_eq!(ErrorCode::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::IllegalAction.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::Internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn severity_tracks_status() {
        assert_eq!(ApiError::not_found("x").severity(), ErrorSeverity::Client);
        assert_eq!(ApiError::internal("x").severity(), ErrorSeverity::Server);
    }
}
