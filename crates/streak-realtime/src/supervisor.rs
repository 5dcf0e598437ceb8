//! Keeps one change-feed subscription alive per target.
//!
//! The supervisor runs as a single task that owns the live
//! [`FeedHandle`]. Commands, feed signals and the backoff timer are all
//! handled inside one `select!` loop, so state transitions never race.
//! Every subscription is opened under a fresh generation number; signals
//! carrying any other generation belong to a subscription that has already
//! been replaced and are dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use streak_types::events::{ChangeEvent, FeedFilter};

use crate::config::ReconnectConfig;
use crate::feed::{ChangeFeed, FeedHandle, FeedSignal, FeedSink, FeedStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Subscribed,
    Error,
    TimedOut,
    /// Retry budget exhausted. Only `reconnect()` or a new target leaves it.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Error => "error",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub state: ConnectionState,
    pub attempt: u32,
    pub target: Option<FeedFilter>,
}

/// Output of a supervisor, in feed order.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A subscription became live. Changes made while disconnected were not
    /// delivered, so consumers should reconcile against storage.
    Subscribed { target: FeedFilter },
    Change(ChangeEvent),
}

/// What the caller must do after feeding a status into [`Supervision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Signal from a replaced subscription, or arriving while idle/failed.
    Stale,
    /// Nothing to do.
    Unchanged,
    Subscribed,
    /// Close the live handle and open a new one after `delay`.
    Retry { delay: Duration },
    /// Close the live handle and stop.
    Failed,
}

/// The supervisor state machine, free of any I/O.
#[derive(Debug, Clone)]
pub struct Supervision {
    config: ReconnectConfig,
    target: Option<FeedFilter>,
    state: ConnectionState,
    attempt: u32,
    generation: u64,
}

impl Supervision {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            target: None,
            state: ConnectionState::Idle,
            attempt: 0,
            generation: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn target(&self) -> Option<FeedFilter> {
        self.target
    }

    pub fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state,
            attempt: self.attempt,
            target: self.target,
        }
    }

    /// Point at a new target. Returns the generation to open under.
    pub fn retarget(&mut self, target: FeedFilter) -> u64 {
        self.target = Some(target);
        self.start_fresh()
    }

    /// Manual reconnect: reset the counter and open again immediately.
    /// Returns `None` when there is no target.
    pub fn restart(&mut self) -> Option<u64> {
        self.target?;
        Some(self.start_fresh())
    }

    /// The backoff timer fired. The attempt counter is kept.
    pub fn begin_retry(&mut self) -> u64 {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.generation
    }

    /// Invalidate the current generation and go idle.
    pub fn stop(&mut self) {
        self.generation += 1;
        self.state = ConnectionState::Idle;
        self.attempt = 0;
    }

    pub fn on_status(&mut self, generation: u64, status: FeedStatus) -> Transition {
        if generation != self.generation {
            return Transition::Stale;
        }

        match self.state {
            ConnectionState::Idle | ConnectionState::Failed => return Transition::Stale,
            // Already failed under this generation and waiting on the timer.
            ConnectionState::Error | ConnectionState::TimedOut => return Transition::Unchanged,
            ConnectionState::Connecting | ConnectionState::Subscribed => {}
        }

        match status {
            FeedStatus::Connecting => {
                self.state = ConnectionState::Connecting;
                Transition::Unchanged
            }
            FeedStatus::Subscribed => {
                if self.state == ConnectionState::Subscribed {
                    return Transition::Unchanged;
                }
                self.state = ConnectionState::Subscribed;
                self.attempt = 0;
                Transition::Subscribed
            }
            FeedStatus::Error | FeedStatus::TimedOut => {
                self.attempt += 1;
                if self.attempt >= self.config.max_attempts {
                    self.state = ConnectionState::Failed;
                    return Transition::Failed;
                }
                self.state = if status == FeedStatus::Error {
                    ConnectionState::Error
                } else {
                    ConnectionState::TimedOut
                };
                Transition::Retry {
                    delay: self.config.backoff_delay(self.attempt),
                }
            }
        }
    }

    fn start_fresh(&mut self) -> u64 {
        self.attempt = 0;
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.generation
    }
}

enum SupervisorCmd {
    SetTarget(FeedFilter),
    Reconnect,
    Shutdown,
}

/// Handle to a running supervisor task.
///
/// Dropping the handle stops the task as well; [`shutdown`](Self::shutdown)
/// additionally waits until the live subscription is closed.
pub struct ReconnectSupervisor {
    cmd_tx: mpsc::UnboundedSender<SupervisorCmd>,
    status_rx: watch::Receiver<SupervisorStatus>,
    task: JoinHandle<()>,
}

impl ReconnectSupervisor {
    /// Start supervising `target`. Returns the supervisor and the stream of
    /// events from its live subscription.
    pub fn spawn(
        feed: Arc<dyn ChangeFeed>,
        target: FeedFilter,
        config: ReconnectConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let mut supervision = Supervision::new(config);
        let generation = supervision.retarget(target);
        let (status_tx, status_rx) = watch::channel(supervision.status());

        let driver = Driver {
            feed,
            supervision,
            live: None,
            retry_at: None,
            signal_tx,
            events_tx,
            status_tx,
        };
        let task = tokio::spawn(driver.run(generation, cmd_rx, signal_rx));

        (
            Self {
                cmd_tx,
                status_rx,
                task,
            },
            events_rx,
        )
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_rx.clone()
    }

    /// Tear down the current subscription and start over on `target`.
    pub fn set_target(&self, target: FeedFilter) {
        let _ = self.cmd_tx.send(SupervisorCmd::SetTarget(target));
    }

    /// Reset the attempt counter and reconnect now, including from `Failed`.
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.send(SupervisorCmd::Reconnect);
    }

    /// Cancel any pending retry, close the live subscription and wait for
    /// the task to exit.
    pub async fn shutdown(self) {
        let _ = self.cmd_tx.send(SupervisorCmd::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Supervisor task ended abnormally: {}", e);
        }
    }
}

struct LiveHandle {
    generation: u64,
    handle: Box<dyn FeedHandle>,
}

struct Driver {
    feed: Arc<dyn ChangeFeed>,
    supervision: Supervision,
    live: Option<LiveHandle>,
    retry_at: Option<Instant>,
    signal_tx: mpsc::UnboundedSender<(u64, FeedSignal)>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    status_tx: watch::Sender<SupervisorStatus>,
}

impl Driver {
    async fn run(
        mut self,
        generation: u64,
        mut cmd_rx: mpsc::UnboundedReceiver<SupervisorCmd>,
        mut signal_rx: mpsc::UnboundedReceiver<(u64, FeedSignal)>,
    ) {
        self.open(generation);
        self.publish();

        loop {
            let retry_sleep = tokio::time::sleep_until(self.retry_at.unwrap_or_else(Instant::now));
            tokio::pin!(retry_sleep);

            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(SupervisorCmd::SetTarget(target)) => {
                        self.teardown();
                        let generation = self.supervision.retarget(target);
                        info!("Switching feed target to {}", target);
                        self.open(generation);
                    }
                    Some(SupervisorCmd::Reconnect) => {
                        self.teardown();
                        if let Some(generation) = self.supervision.restart() {
                            info!("Manual reconnect requested");
                            self.open(generation);
                        }
                    }
                    Some(SupervisorCmd::Shutdown) | None => {
                        self.teardown();
                        self.supervision.stop();
                        self.publish();
                        debug!("Supervisor stopped");
                        return;
                    }
                },

                Some((generation, signal)) = signal_rx.recv() => {
                    self.on_signal(generation, signal);
                }

                _ = &mut retry_sleep, if self.retry_at.is_some() => {
                    self.retry_at = None;
                    let generation = self.supervision.begin_retry();
                    info!(
                        "Reconnecting feed (attempt {})",
                        self.supervision.attempt() + 1
                    );
                    self.open(generation);
                }
            }

            self.publish();
        }
    }

    fn on_signal(&mut self, generation: u64, signal: FeedSignal) {
        match signal {
            FeedSignal::Event(event) => {
                if generation != self.supervision.generation() {
                    debug!("Dropping change from stale subscription (gen={})", generation);
                    return;
                }
                let _ = self.events_tx.send(SupervisorEvent::Change(event));
            }
            FeedSignal::Status(status) => match self.supervision.on_status(generation, status) {
                Transition::Stale => {
                    debug!("Ignoring stale status {} (gen={})", status, generation);
                }
                Transition::Unchanged => {}
                Transition::Subscribed => {
                    if let Some(target) = self.supervision.target() {
                        info!("Feed subscribed: {}", target);
                        let _ = self.events_tx.send(SupervisorEvent::Subscribed { target });
                    }
                }
                Transition::Retry { delay } => {
                    self.teardown();
                    warn!(
                        "Feed {} (attempt {}), retrying in {}ms",
                        status,
                        self.supervision.attempt(),
                        delay.as_millis()
                    );
                    self.retry_at = Some(Instant::now() + delay);
                }
                Transition::Failed => {
                    self.teardown();
                    warn!(
                        "Feed failed after {} attempts, giving up",
                        self.supervision.attempt()
                    );
                }
            },
        }
    }

    /// The single place a subscription is opened. Always closes the
    /// previous one first.
    fn open(&mut self, generation: u64) {
        self.teardown();
        let Some(target) = self.supervision.target() else {
            return;
        };
        let sink = FeedSink::new(generation, self.signal_tx.clone());
        let handle = self.feed.open(target, sink);
        self.live = Some(LiveHandle { generation, handle });
    }

    fn teardown(&mut self) {
        self.retry_at = None;
        if let Some(mut live) = self.live.take() {
            debug!("Closing subscription gen={}", live.generation);
            live.handle.close();
        }
    }

    fn publish(&self) {
        let status = self.supervision.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
