mod history;
mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chatHub", get(ws::chat_ws))
        .route("/api/messages", get(history::history))
}
