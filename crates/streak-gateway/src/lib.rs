//! Server side of the change feed: fans message inserts out to WebSocket
//! subscribers whose filter admits them.

pub mod connection;
pub mod dispatcher;
pub mod filter;

pub use connection::handle_connection;
pub use dispatcher::{ConnectionNotice, Dispatcher};
pub use filter::{ActiveFilter, SubscribeError, authorize};
