use std::sync::Arc;

use axum::{extract::Extension, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::{ai::AiClient, hub::Hub};

pub mod ai;
pub mod files;
pub mod group_ws;
pub mod ws;

pub fn router() -> Router {
    Router::new()
        .merge(ws::router())
        .merge(group_ws::router())
        .merge(files::router())
        .merge(ai::router())
        .route("/health", get(health))
}

async fn health(Extension(hub): Extension<Arc<Hub>>, Extension(ai): Extension<Arc<AiClient>>) -> Json<Value> {
    let (rooms, users, chat_rooms, chat_users) = hub.counts().await;
    Json(json!({
        "status": "healthy",
        "websocket": ["/ws", "/group-ws"],
        "ai_enabled": ai.enabled(),
        "rooms": rooms,
        "users": users,
        "chat_rooms": chat_rooms,
        "chat_users": chat_users,
    }))
}
