use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use streak_types::events::{ChangeEvent, FeedFilter};

/// Connection status vocabulary reported by a change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStatus {
    Connecting,
    Subscribed,
    Error,
    TimedOut,
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Error => "error",
            Self::TimedOut => "timed_out",
        })
    }
}

#[derive(Debug, Clone)]
pub enum FeedSignal {
    Status(FeedStatus),
    Event(ChangeEvent),
}

/// Where a feed subscription reports to. Every signal is tagged with the
/// generation the subscription was opened under, so the receiver can tell
/// a live subscription from one it has already replaced.
#[derive(Debug, Clone)]
pub struct FeedSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, FeedSignal)>,
}

impl FeedSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, FeedSignal)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver a matching change. Delivery is at-least-once.
    pub fn on_event(&self, event: ChangeEvent) {
        let _ = self.tx.send((self.generation, FeedSignal::Event(event)));
    }

    pub fn on_status(&self, status: FeedStatus) {
        let _ = self.tx.send((self.generation, FeedSignal::Status(status)));
    }
}

/// One open subscription. Closing is idempotent; implementations also
/// close on drop.
pub trait FeedHandle: Send {
    fn close(&mut self);
}

/// Publish/subscribe primitive for row-level changes.
///
/// `open` never fails synchronously: connection progress and every failure
/// are reported through [`FeedSink::on_status`].
pub trait ChangeFeed: Send + Sync + 'static {
    fn open(&self, filter: FeedFilter, sink: FeedSink) -> Box<dyn FeedHandle>;
}
