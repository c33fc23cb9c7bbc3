//! HTTP surface: chat turns over SSE plus a liveness probe.

mod chat;

use crate::turn::ChatServices;
use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use chat::chat_turn;

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<ChatServices>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat_turn))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
