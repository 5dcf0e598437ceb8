//! Realtime messaging core: a supervised change-feed subscription feeding
//! per-conversation unread state, folded into one "has new messages" flag.
//!
//! ```text
//! ChangeFeed ──signals──▶ ReconnectSupervisor ──events──▶ UnreadTracker ──▶ NotificationAggregator
//! ```
//!
//! [`NotificationService`] wires the pieces together for one signed-in user.

pub mod aggregator;
pub mod config;
pub mod feed;
pub mod service;
pub mod store;
pub mod supervisor;
pub mod unread;
pub mod ws;

pub use aggregator::{NotificationAggregator, NotificationWatch};
pub use config::ReconnectConfig;
pub use feed::{ChangeFeed, FeedHandle, FeedSignal, FeedSink, FeedStatus};
pub use service::NotificationService;
pub use store::{HttpStore, MessageStore, StoreError};
pub use supervisor::{ConnectionState, ReconnectSupervisor, SupervisorEvent, SupervisorStatus};
pub use unread::{ConversationSnapshot, UnreadState, UnreadTracker};
pub use ws::{FeedError, WsChangeFeed};

#[cfg(test)]
pub(crate) mod testing;
