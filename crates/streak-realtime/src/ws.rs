use std::convert::Infallible;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use streak_types::events::{FeedCommand, FeedEvent, FeedFilter, frame_preview};

use crate::config::ReconnectConfig;
use crate::feed::{ChangeFeed, FeedHandle, FeedSink, FeedStatus};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("timed out during {0}")]
    Timeout(&'static str),

    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("bad frame: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("server rejected subscription: {0}")]
    Rejected(String),

    #[error("connection closed")]
    Closed,
}

impl FeedError {
    fn status(&self) -> FeedStatus {
        match self {
            Self::Timeout(_) => FeedStatus::TimedOut,
            _ => FeedStatus::Error,
        }
    }
}

/// [`ChangeFeed`] over the gateway's `/realtime` WebSocket.
///
/// Each `open` runs its own connection task: connect, `Identify`, wait for
/// `Ready`, `Subscribe`, wait for `Subscribed`, then stream `Change` frames
/// into the sink until the connection ends or the handle is closed.
#[derive(Clone)]
pub struct WsChangeFeed {
    url: String,
    token: String,
    timeout: Duration,
}

impl WsChangeFeed {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            timeout: ReconnectConfig::default().open_timeout,
        }
    }

    /// Bound on the connect step and on each handshake reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl ChangeFeed for WsChangeFeed {
    fn open(&self, filter: FeedFilter, sink: FeedSink) -> Box<dyn FeedHandle> {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let feed = self.clone();

        tokio::spawn(async move {
            let generation = sink.generation();
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    debug!("Feed gen={} closed", generation);
                }
                result = feed.run(filter, &sink) => {
                    let Err(e) = result;
                    warn!("Feed gen={} for {} ended: {}", generation, filter, e);
                    sink.on_status(e.status());
                }
            }
        });

        Box::new(WsHandle { cancel })
    }
}

impl WsChangeFeed {
    async fn run(&self, filter: FeedFilter, sink: &FeedSink) -> Result<Infallible, FeedError> {
        sink.on_status(FeedStatus::Connecting);

        let (ws, _) = tokio::time::timeout(self.timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| FeedError::Timeout("connect"))??;
        let (mut tx, mut rx) = ws.split();

        send(&mut tx, &FeedCommand::Identify {
            token: self.token.clone(),
        })
        .await?;
        let ready = tokio::time::timeout(
            self.timeout,
            expect(&mut rx, |e| matches!(e, FeedEvent::Ready { .. })),
        )
        .await
        .map_err(|_| FeedError::Timeout("identify"))??;
        if let FeedEvent::Ready { username, .. } = ready {
            debug!("Feed identified as {}", username);
        }

        send(&mut tx, &FeedCommand::Subscribe { filter }).await?;
        tokio::time::timeout(
            self.timeout,
            expect(&mut rx, |e| matches!(e, FeedEvent::Subscribed { .. })),
        )
        .await
        .map_err(|_| FeedError::Timeout("subscribe"))??;

        info!("Subscribed to {}", filter);
        sink.on_status(FeedStatus::Subscribed);

        loop {
            match next_event(&mut rx).await? {
                FeedEvent::Change { event } => {
                    trace!("Change for message {}", event.message.id);
                    sink.on_event(event);
                }
                FeedEvent::Error { message } => return Err(FeedError::Rejected(message)),
                _ => {}
            }
        }
    }
}

struct WsHandle {
    cancel: CancellationToken,
}

impl FeedHandle for WsHandle {
    fn close(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for WsHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn send(tx: &mut SplitSink<WsStream, Message>, command: &FeedCommand) -> Result<(), FeedError> {
    let text = serde_json::to_string(command)?;
    tx.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Read events until one satisfies `want`. An `Error` frame ends the wait.
async fn expect(
    rx: &mut SplitStream<WsStream>,
    want: impl Fn(&FeedEvent) -> bool,
) -> Result<FeedEvent, FeedError> {
    loop {
        let event = next_event(rx).await?;
        if want(&event) {
            return Ok(event);
        }
        if let FeedEvent::Error { message } = event {
            return Err(FeedError::Rejected(message));
        }
    }
}

async fn next_event(rx: &mut SplitStream<WsStream>) -> Result<FeedEvent, FeedError> {
    while let Some(msg) = rx.next().await {
        match msg? {
            Message::Text(text) => match serde_json::from_str::<FeedEvent>(&text) {
                Ok(event) => return Ok(event),
                Err(e) => warn!("Undecodable feed frame: {} -- raw: {}", e, frame_preview(&text, 200)),
            },
            Message::Close(_) => return Err(FeedError::Closed),
            _ => {}
        }
    }
    Err(FeedError::Closed)
}
