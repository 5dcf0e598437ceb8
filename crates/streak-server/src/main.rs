use tracing::info;

use streak_db::Database;
use streak_server::{ServerConfig, app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streak=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let db = Database::open(&config.db_path)?;

    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    info!("Streak server listening on {}", config.addr);

    axum::serve(listener, app(db, config.jwt_secret)).await?;

    Ok(())
}
