pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod groups;
pub mod hub;
pub mod identity;
pub mod notifier;
pub mod presence;
pub mod protocol;
pub mod store;

use std::sync::Arc;

use axum::{extract::FromRef, http::StatusCode, response::{IntoResponse, Response}, Router};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::{
    error::ChatError,
    hub::Hub,
    identity::Identity,
    presence::PresenceRegistry,
    store::MessageStore,
};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub hub: Hub,
    pub identity: Identity,
    pub push_buffer: PushBuffer,
}

/// Depth of each connection's outbound queue.
#[derive(Clone, Copy, Debug)]
pub struct PushBuffer(pub usize);

impl AppState {
    pub fn new(db_pool: SqlitePool, identity: Identity, push_buffer: usize) -> Self {
        let hub = Hub::new(MessageStore::new(db_pool), Arc::new(PresenceRegistry::new()));
        AppState {
            hub,
            identity,
            push_buffer: PushBuffer(push_buffer),
        }
    }
}

pub fn app(app_state: AppState) -> Router {
    Router::new()
        .merge(chat::router())
        .nest("/api/groups", groups::router())
        .with_state(app_state)
        .layer(CorsLayer::permissive())
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<ChatError>() {
            Some(ChatError::Unauthenticated) => StatusCode::UNAUTHORIZED,
            Some(ChatError::InvalidMessage(_) | ChatError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            Some(ChatError::SenderNotFound(_) | ChatError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(ChatError::Forbidden(_)) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(err = ?self.0, "request failed");
            return (status, format!("{}\n\n{}", self.0, self.0.backtrace())).into_response();
        }
        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
