//! REST handlers over the message store. Every write that creates a
//! message also publishes it to the realtime dispatcher.

use axum::{
    Router,
    http::StatusCode,
    middleware as axum_middleware,
    routing::{get, post, put},
};
use tracing::error;

use streak_db::Database;

pub mod auth;
pub mod conversations;
pub mod groups;
pub mod messages;
pub mod middleware;

use auth::AppState;

/// Public auth routes plus the JWT-protected message routes.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/messages", post(messages::send_message))
        .route("/conversations", get(conversations::list_conversations))
        .route("/conversations/{key}/messages", get(messages::get_messages))
        .route("/conversations/{key}/read", put(conversations::mark_read))
        .route("/groups", post(groups::create_group))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::require_auth))
        .with_state(state);

    Router::new().merge(public_routes).merge(protected_routes)
}

/// Run a database call off the async runtime.
pub(crate) async fn with_db<F, T>(state: &AppState, f: F) -> Result<T, StatusCode>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            error!("Database error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

#[cfg(test)]
mod tests;
