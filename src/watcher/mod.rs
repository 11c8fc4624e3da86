//! Subscription to the external file-watching daemon.
//!
//! This module provides:
//! - Raw newline-delimited JSON connections (socket and mock)
//! - Socket discovery and a per-subscription connection factory
//! - The subscribe/listen protocol producing batches of changed paths

mod connection;
mod discovery;
mod subscriber;

pub use connection::{with_connection, Connection, MockConnection, Response, SocketConnection};
pub use discovery::{create, get_sockname, parse_discovery, Opener, ProcessStatus};
pub use subscriber::{
    initial_clock, interpret, listen, listen_until, subscribe, with_subscription,
    with_subscription_until, Notification, SubscriberHandle, SubscriberSetting, SUBSCRIPTION_NAME,
};
