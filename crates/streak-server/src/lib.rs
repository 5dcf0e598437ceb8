//! Composition of storage, REST API and realtime gateway into one router.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use streak_api::auth::{AppState, AppStateInner};
use streak_db::Database;
use streak_gateway::{Dispatcher, handle_connection};

/// Server settings read from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let jwt_secret =
            std::env::var("STREAK_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
        let db_path = std::env::var("STREAK_DB_PATH").unwrap_or_else(|_| "streak.db".into());
        let host = std::env::var("STREAK_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = std::env::var("STREAK_PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .context("STREAK_PORT is not a port number")?;

        Ok(Self {
            jwt_secret,
            db_path: PathBuf::from(db_path),
            addr: format!("{}:{}", host, port).parse()?,
        })
    }
}

#[derive(Clone)]
struct ServerState {
    db: Arc<Database>,
    dispatcher: Dispatcher,
    jwt_secret: String,
}

/// Full HTTP surface: REST routes plus the `/realtime` WebSocket.
pub fn app(db: Database, jwt_secret: String) -> Router {
    let db = Arc::new(db);
    let dispatcher = Dispatcher::new();

    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        jwt_secret: jwt_secret.clone(),
        dispatcher: dispatcher.clone(),
    });

    let state = ServerState {
        db,
        dispatcher,
        jwt_secret,
    };

    let ws_route = Router::new()
        .route("/realtime", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .merge(streak_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handle_connection(socket, state.dispatcher, state.db, state.jwt_secret)
    })
}
