//! Runs the notification service for one account and logs the unread flag
//! and connection state as they change.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};

use streak_realtime::{ConnectionState, HttpStore, NotificationService, ReconnectConfig, WsChangeFeed};

/// How long to sit in `Failed` before asking for a manual reconnect.
const FAILED_COOLDOWN: Duration = Duration::from_secs(30);

struct WatchConfig {
    api_url: String,
    gateway_url: String,
    username: String,
    password: String,
}

impl WatchConfig {
    fn from_env() -> anyhow::Result<Self> {
        let api_url = std::env::var("STREAK_API_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".into());
        let gateway_url = std::env::var("STREAK_GATEWAY_URL").unwrap_or_else(|_| {
            format!(
                "{}/realtime",
                api_url.replacen("http", "ws", 1).trim_end_matches('/')
            )
        });

        Ok(Self {
            username: std::env::var("STREAK_USERNAME").context("STREAK_USERNAME must be set")?,
            password: std::env::var("STREAK_PASSWORD").context("STREAK_PASSWORD must be set")?,
            api_url,
            gateway_url,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "streak=info".into()),
        )
        .init();

    let config = WatchConfig::from_env()?;
    let reconnect = ReconnectConfig::from_env()?;

    let login = HttpStore::login(&config.api_url, &config.username, &config.password)
        .await
        .context("login failed")?;
    info!("Logged in as {} ({})", login.username, login.user_id);

    let store = Arc::new(HttpStore::new(&config.api_url, &login.token, login.user_id));
    let feed = Arc::new(WsChangeFeed::new(&config.gateway_url, &login.token).with_timeout(reconnect.open_timeout));
    let service = NotificationService::new(feed, store, reconnect);

    let mut watch = service.aggregator().watch();
    let mut messages = service.subscribe_messages();
    service.start(login.user_id).await;

    let mut status_poll = tokio::time::interval(Duration::from_secs(1));
    let mut last_state = ConnectionState::Idle;
    let mut failed_since: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            changed = watch.changed() => match changed {
                Some(flag) => info!("has_new_messages = {}", flag),
                None => break,
            },
            message = messages.recv() => match message {
                Ok(message) => info!(
                    "Message {} from {} ({} chars)",
                    message.id,
                    message.sender_id,
                    message.content.as_deref().map_or(0, str::len)
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Skipped {} live messages", n);
                }
                Err(_) => break,
            },
            _ = status_poll.tick() => {
                let Some(status) = service.connection_status().await else {
                    continue;
                };
                if status.state != last_state {
                    info!("Connection {} (attempt {})", status.state, status.attempt);
                    last_state = status.state;
                }
                if status.state == ConnectionState::Failed {
                    let since = *failed_since.get_or_insert_with(tokio::time::Instant::now);
                    if since.elapsed() >= FAILED_COOLDOWN {
                        error!("Feed still failed after {}s, reconnecting", FAILED_COOLDOWN.as_secs());
                        failed_since = None;
                        service.reconnect().await;
                    }
                } else {
                    failed_since = None;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    service.stop().await;
    Ok(())
}
