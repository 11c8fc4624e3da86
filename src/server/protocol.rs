//! Client protocol: requests, responses and the socket envelopes.

use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::analysis::DisplayedError;
use crate::error::ServerError;
use crate::{Error, Result};

use super::state::ServerState;

/// Longest line accepted on the client socket.
const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Newline-delimited JSON over the client socket.
pub(crate) type Lines = Framed<UnixStream, LinesCodec>;

/// Frame a client socket stream.
pub(crate) fn lines(stream: UnixStream) -> Lines {
    lines_with_limit(stream, MAX_MESSAGE_BYTES)
}

fn lines_with_limit(stream: UnixStream, max_length: usize) -> Lines {
    Framed::new(stream, LinesCodec::new_with_max_length(max_length))
}

/// Request handled by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    /// Version, process and configuration details.
    GetInfo,
    /// Current type errors of the given files, or of every module if empty.
    DisplayTypeError { paths: Vec<PathBuf> },
    /// Recheck after the given files changed.
    IncrementalUpdate { paths: Vec<PathBuf> },
    /// Stop the server.
    Stop,
}

impl Request {
    /// Short name used in logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetInfo => "get_info",
            Self::DisplayTypeError { .. } => "display_type_error",
            Self::IncrementalUpdate { .. } => "incremental_update",
            Self::Stop => "stop",
        }
    }
}

/// Why the server stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum StopReason {
    /// A client asked for it.
    Requested,
    /// A file the incremental state depends on changed; restart required.
    CriticalFileChanged { path: PathBuf, pattern: String },
}

/// Server details returned for [`Request::GetInfo`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub pid: u32,
    pub socket: PathBuf,
    pub configuration: serde_json::Value,
    /// Names of the open subscriptions.
    pub subscriptions: Vec<String>,
}

impl ServerInfo {
    /// Describe the running server.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn new(state: &ServerState) -> Result<Self> {
        Ok(Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            socket: state.socket_path.clone(),
            configuration: serde_json::to_value(&state.config)?,
            subscriptions: state.subscriptions.names().map(str::to_string).collect(),
        })
    }
}

/// Answer to one [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Info(ServerInfo),
    TypeErrors { errors: Vec<DisplayedError> },
    Ok,
    Stop { reason: StopReason },
}

/// One line sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A single request, answered once.
    Request { request: Request },
    /// Receive the full error list after every incremental update.
    Subscribe { name: String },
}

/// One line sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response { response: Response },
    Error { message: String },
    TypeErrors { errors: Vec<DisplayedError> },
}

/// Write one message as a single line.
pub(crate) async fn write_message<T: Serialize>(lines: &mut Lines, message: &T) -> Result<()> {
    let line = serde_json::to_string(message)?;
    lines.send(line).await.map_err(codec_error)
}

/// Read the next message; `None` once the peer closed the socket.
pub(crate) async fn read_message<T: DeserializeOwned>(lines: &mut Lines) -> Result<Option<T>> {
    match lines.next().await {
        None => Ok(None),
        Some(line) => Ok(Some(serde_json::from_str(&line.map_err(codec_error)?)?)),
    }
}

fn codec_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::Io(e) => Error::Io(e),
        other => ServerError::Request(other.to_string()).into(),
    }
}
