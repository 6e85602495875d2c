use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::fmt::Display;

use crate::ai::AiError;

pub type AppResult<T> = Result<T, AppErr>;
pub type HubResult<T> = Result<T, HubError>;

/* ── HTTP surface ── */
#[derive(thiserror::Error, Debug)]
pub enum AppErr {
    #[error("Bad request: {0}")]
    Bad(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error(transparent)]
    Ai(#[from] AiError),
}

impl IntoResponse for AppErr {
    fn into_response(self) -> axum::response::Response {
        let code = match &self {
            AppErr::Bad(_) => StatusCode::BAD_REQUEST,
            AppErr::NotFound(_) => StatusCode::NOT_FOUND,
            AppErr::Ai(e) => e.status(),
        };
        let body = Json(json!({ "error": self.to_string(), "status": "error" }));
        (code, body).into_response()
    }
}

pub fn bad<E: Display>(e: E) -> AppErr { AppErr::Bad(e.to_string()) }

/* ── room / chat operations ──
 * Display text is what ends up in `*_result.message` and `error.message`. */
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    #[error("Not registered")]
    NotRegistered,

    #[error("Not in a room")]
    NotInRoom,

    #[error("Room not found")]
    RoomNotFound,

    #[error("Room is full")]
    RoomFull,

    #[error("Only the host can {0}")]
    NotHost(&'static str),

    #[error("Target user not found")]
    UserNotFound,

    #[error("Target user is not in the same room")]
    TargetNotInRoom,

    #[error("You cannot target yourself")]
    SelfTarget,

    #[error("Broadcast mode is not enabled")]
    BroadcastDisabled,

    #[error("Message not found")]
    MessageNotFound,

    #[error("Not authorized to {0} this message")]
    NotAuthor(&'static str),

    #[error("{0}")]
    Invalid(String),
}

pub fn invalid<E: Display>(e: E) -> HubError { HubError::Invalid(e.to_string()) }
