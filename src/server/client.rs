//! Client side of the server socket.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::net::UnixStream;
use super::protocol::{
    lines, read_message, write_message, ClientMessage, Lines, Request, Response, ServerMessage,
};
use crate::analysis::DisplayedError;
use crate::error::ServerError;
use crate::Result;

/// Delay between attempts while waiting for a server to come up.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connects to a running server.
#[derive(Debug, Clone)]
pub struct Client {
    socket: PathBuf,
}

impl Client {
    /// Client for the server listening on `socket`.
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// Socket this client connects to.
    #[must_use]
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    async fn connect(&self) -> Result<Lines> {
        match UnixStream::connect(&self.socket).await {
            Ok(stream) => Ok(lines(stream)),
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                Err(ServerError::NotRunning(self.socket.display().to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send one request and wait for its answer.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotRunning`] if no server listens on the
    /// socket, or [`ServerError::Request`] if the server reports a failure.
    pub async fn request(&self, request: Request) -> Result<Response> {
        let mut lines = self.connect().await?;
        write_message(&mut lines, &ClientMessage::Request { request }).await?;

        match read_message::<ServerMessage>(&mut lines).await? {
            Some(ServerMessage::Response { response }) => Ok(response),
            Some(ServerMessage::Error { message }) => Err(ServerError::Request(message).into()),
            Some(ServerMessage::TypeErrors { .. }) => {
                Err(ServerError::Request("unexpected push on a request".to_string()).into())
            }
            None => Err(ServerError::Request("server closed the connection".to_string()).into()),
        }
    }

    /// Subscribe to the type errors pushed after every incremental update.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached.
    pub async fn subscribe(&self, name: &str) -> Result<ErrorStream> {
        let mut lines = self.connect().await?;
        let message = ClientMessage::Subscribe {
            name: name.to_string(),
        };
        write_message(&mut lines, &message).await?;
        Ok(ErrorStream { lines })
    }

    /// Whether a server answers on the socket.
    pub async fn is_running(&self) -> bool {
        self.request(Request::GetInfo).await.is_ok()
    }

    /// Poll until a server answers or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotRunning`] if no server answered in time.
    pub async fn wait_until_running(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_running().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ServerError::NotRunning(self.socket.display().to_string()).into());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Type error snapshots pushed to a subscription.
pub struct ErrorStream {
    lines: Lines,
}

impl ErrorStream {
    /// Wait for the next snapshot; `None` once the server closed the stream.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed or unexpected messages.
    pub async fn next(&mut self) -> Result<Option<Vec<DisplayedError>>> {
        match read_message::<ServerMessage>(&mut self.lines).await? {
            Some(ServerMessage::TypeErrors { errors }) => Ok(Some(errors)),
            Some(ServerMessage::Error { message }) => Err(ServerError::Request(message).into()),
            Some(ServerMessage::Response { .. }) => {
                Err(ServerError::Request("unexpected response on a subscription".to_string()).into())
            }
            None => Ok(None),
        }
    }
}
