//! The incremental server.
//!
//! This module provides:
//! - The request protocol and its local socket transport
//! - The dispatcher owning the analysis state
//! - Client subscriptions for pushed type errors
//! - Logging and metrics setup

mod app;
mod client;
mod handler;
mod metrics;
mod notification;
mod observability;
mod protocol;
mod state;
mod subscriptions;

pub use app::App;
pub use client::{Client, ErrorStream};
pub use handler::{check_all, display_type_errors, process_request};
pub use metrics::{init_metrics, render as render_metrics};
pub use notification::{consume as consume_notification, critical_file_message};
pub use observability::init_tracing;
pub use protocol::{ClientMessage, Request, Response, ServerInfo, ServerMessage, StopReason};
pub use state::ServerState;
pub use subscriptions::{Snapshot, SubscriptionReceiver, SubscriptionRegistry};
