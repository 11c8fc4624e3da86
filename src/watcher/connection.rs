//! Raw connections to the file-watching daemon.
//!
//! A connection carries newline-delimited JSON in both directions. The
//! protocol layer sees it only through the [`Connection`] trait, so tests can
//! drive it with [`MockConnection`] instead of a live socket.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::codec::{Framed, LinesCodec};

use super::discovery::Opener;
use crate::error::{ConnectionError, SubscriptionError};
use crate::Result;

/// Longest message accepted from the watcher.
const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

/// Outcome of one receive on a watcher connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// A well-formed JSON message.
    Ok(Value),
    /// The peer closed the stream cleanly.
    EndOfStream,
    /// The peer sent something that is not JSON.
    Error(String),
}

/// A bidirectional JSON channel to the watcher.
pub trait Connection: Send {
    /// Send one JSON value.
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>>;

    /// Receive one message.
    fn receive(&mut self) -> BoxFuture<'_, Response>;

    /// Release the channel. Calling it on a closed channel is a no-op.
    fn shutdown(&mut self) -> BoxFuture<'_, ()>;
}

/// Run `f` against a fresh connection and shut it down afterwards,
/// whether `f` succeeds or fails.
///
/// # Errors
///
/// Returns an error if the connection cannot be opened, or whatever `f` returns.
pub async fn with_connection<T, F>(opener: &Opener, f: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a mut dyn Connection) -> BoxFuture<'a, Result<T>>,
{
    let mut connection = opener.open().await?;
    let result = f(connection.as_mut()).await;
    connection.shutdown().await;
    result
}

/// Connection over a local Unix-domain socket.
pub struct SocketConnection {
    framed: Option<Framed<UnixStream, LinesCodec>>,
}

impl SocketConnection {
    /// Connect to the watcher socket at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be connected.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| ConnectionError::Socket {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(socket = %path.display(), "Connected to watcher");
        Ok(Self::with_limit(stream, MAX_MESSAGE_BYTES))
    }

    fn with_limit(stream: UnixStream, max_length: usize) -> Self {
        Self {
            framed: Some(Framed::new(
                stream,
                LinesCodec::new_with_max_length(max_length),
            )),
        }
    }

    async fn send_line(&mut self, message: Value) -> Result<()> {
        let framed = self
            .framed
            .as_mut()
            .ok_or_else(|| SubscriptionError::Transport("connection is closed".to_string()))?;
        framed
            .send(message.to_string())
            .await
            .map_err(|e| SubscriptionError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn receive_line(&mut self) -> Response {
        let Some(framed) = self.framed.as_mut() else {
            return Response::EndOfStream;
        };
        match framed.next().await {
            None => Response::EndOfStream,
            Some(Ok(line)) => match serde_json::from_str(&line) {
                Ok(value) => Response::Ok(value),
                Err(e) => Response::Error(e.to_string()),
            },
            Some(Err(e)) => Response::Error(e.to_string()),
        }
    }

    async fn close(&mut self) {
        if let Some(framed) = self.framed.take() {
            let mut stream = framed.into_inner();
            // The peer may already have closed its half.
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(error = %e, "Watcher socket shutdown failed");
            }
        }
    }
}

impl Connection for SocketConnection {
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
        self.send_line(message).boxed()
    }

    fn receive(&mut self) -> BoxFuture<'_, Response> {
        self.receive_line().boxed()
    }

    fn shutdown(&mut self) -> BoxFuture<'_, ()> {
        self.close().boxed()
    }
}

type SendHook = Box<dyn FnMut(Value) -> Result<()> + Send>;
/// Returns `None` while no message is available; the receive then never completes.
type ReceiveHook = Box<dyn FnMut() -> Option<Response> + Send>;

/// Test double driven by caller-supplied send and receive hooks.
pub struct MockConnection {
    on_send: SendHook,
    on_receive: ReceiveHook,
    shutdowns: Arc<AtomicUsize>,
}

impl MockConnection {
    /// Create a mock from a pair of hooks.
    pub fn new(
        on_send: impl FnMut(Value) -> Result<()> + Send + 'static,
        on_receive: impl FnMut() -> Response + Send + 'static,
    ) -> Self {
        let mut on_receive = on_receive;
        Self::with_hooks(on_send, move || Some(on_receive()))
    }

    fn with_hooks(
        on_send: impl FnMut(Value) -> Result<()> + Send + 'static,
        on_receive: impl FnMut() -> Option<Response> + Send + 'static,
    ) -> Self {
        Self {
            on_send: Box::new(on_send),
            on_receive: Box::new(on_receive),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a mock that ignores sends and replays `responses`, then
    /// reports end of stream.
    #[must_use]
    pub fn scripted(responses: Vec<Response>) -> Self {
        let mut responses = responses.into_iter();
        Self::new(
            |_| Ok(()),
            move || responses.next().unwrap_or(Response::EndOfStream),
        )
    }

    /// Create a mock that replays `responses`, then stays open without
    /// sending anything else.
    #[must_use]
    pub fn held_open(responses: Vec<Response>) -> Self {
        let mut responses = responses.into_iter();
        Self::with_hooks(|_| Ok(()), move || responses.next())
    }

    /// Count shutdowns into an externally shared counter.
    #[must_use]
    pub fn with_shutdown_counter(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.shutdowns = counter;
        self
    }

    /// Number of times `shutdown` has been called.
    #[must_use]
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
        let result = (self.on_send)(message);
        async move { result }.boxed()
    }

    fn receive(&mut self) -> BoxFuture<'_, Response> {
        match (self.on_receive)() {
            Some(response) => async move { response }.boxed(),
            None => futures::future::pending().boxed(),
        }
    }

    fn shutdown(&mut self) -> BoxFuture<'_, ()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        async {}.boxed()
    }
}
