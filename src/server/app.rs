//! Main application server.
//!
//! One dispatcher owns the [`ServerState`] and processes client requests and
//! watcher batches one at a time. Client connections and the watcher
//! subscription run as separate tasks that talk to it over a channel.

use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::client::Client;
use super::handler;
use super::metrics;
use super::notification;
use super::observability::spans;
use super::protocol::{
    lines, read_message, write_message, ClientMessage, Lines, Request, Response, ServerMessage,
    StopReason,
};
use super::state::ServerState;
use super::subscriptions::{Snapshot, SubscriptionReceiver};
use crate::analysis::Checker;
use crate::error::{ServerError, SubscriptionError};
use crate::watcher::{self, Opener, SubscriberSetting};
use crate::{Config, Error, Result};

/// Pending work the dispatcher accepts before senders wait.
const COMMAND_QUEUE: usize = 64;

/// Time given to open connections and the watcher to finish on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

type WatcherTask = JoinHandle<Result<()>>;

/// Work for the dispatcher.
enum Command {
    Request {
        request: Request,
        reply: oneshot::Sender<Result<Response>>,
    },
    Subscribe {
        name: String,
        reply: oneshot::Sender<(Uuid, SubscriptionReceiver)>,
    },
    Unsubscribe {
        id: Uuid,
    },
}

/// Why the dispatcher loop ended without an error.
#[derive(Debug)]
enum Exit {
    Stopped(StopReason),
    Signal,
    WatcherClosed,
}

/// Application server.
pub struct App<C> {
    config: Config,
    checker: C,
    opener: Option<Opener>,
}

impl<C: Checker> App<C> {
    /// Create a new application.
    ///
    /// Unless [`with_opener`](Self::with_opener) supplies one, the watcher
    /// is located through discovery when the server starts.
    #[must_use]
    pub fn new(config: Config, checker: C) -> Self {
        Self {
            config,
            checker,
            opener: None,
        }
    }

    /// Use `opener` for the watcher subscription.
    #[must_use]
    pub fn with_opener(mut self, opener: Opener) -> Self {
        self.opener = Some(opener);
        self
    }

    /// Run the server until it is stopped or receives SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot start, the initial check fails,
    /// or the watcher subscription fails.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the server until it is stopped or `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let Self {
            config,
            mut checker,
            opener,
        } = self;

        if let Some(message) = notification::consume(&config.notification_path()).await? {
            tracing::warn!(message = %message, "Previous server stopped for a restart");
        }

        let opener = match opener {
            Some(opener) => Some(opener),
            None if config.no_watchman => None,
            None => Some(watcher::create(&config.watchman_binary).await?),
        };
        let setting = SubscriberSetting::from_config(&config)?;

        let mut state = ServerState::scan(config);
        handler::check_all(&mut state, &mut checker).await?;

        let socket_path = state.socket_path.clone();
        let listener = bind(&socket_path).await?;
        tracing::info!(socket = %socket_path.display(), "Server listening");

        let (commands, mut inbox) = mpsc::channel(COMMAND_QUEUE);

        let cancel = CancellationToken::new();
        let mut watcher_task: Option<WatcherTask> = opener.map(|opener| {
            tokio::spawn(watch(opener, setting, commands.clone(), cancel.clone()))
        });
        tokio::pin!(shutdown);

        let mut clients = JoinSet::new();
        let outcome = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        clients.spawn(serve_client(stream, commands.clone()));
                    }
                    Err(e) => tracing::error!(error = %e, "Accept error"),
                },
                Some(command) = inbox.recv() => {
                    if let Some(reason) = dispatch(&mut state, &mut checker, command).await {
                        break Ok(Exit::Stopped(reason));
                    }
                }
                joined = join_watcher(&mut watcher_task) => {
                    watcher_task = None;
                    break watcher_finished(joined);
                }
                () = &mut shutdown => break Ok(Exit::Signal),
                Some(finished) = clients.join_next() => {
                    if let Ok(Err(e)) = finished {
                        tracing::debug!(error = %e, "Client connection failed");
                    }
                }
            }
        };

        cancel.cancel();
        if let Some(task) = watcher_task {
            stop_watcher(task).await;
        }
        drop(listener);

        // Dropping the inbox and the state closes pending replies and
        // subscription channels so every connection can finish.
        drop(inbox);
        drop(state);
        drop(commands);
        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while clients.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::debug!("Aborting connections still open at shutdown");
            clients.abort_all();
        }

        if let Err(e) = tokio::fs::remove_file(&socket_path).await {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    error = %e,
                    socket = %socket_path.display(),
                    "Failed to remove socket"
                );
            }
        }
        tracing::debug!(metrics = %metrics::render(), "Final metrics");

        match outcome {
            Ok(exit) => {
                tracing::info!(?exit, "Server shut down gracefully");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Server stopped on watcher failure");
                Err(e)
            }
        }
    }
}

/// Bind the client socket, replacing a stale one.
async fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    if Client::new(path).is_running().await {
        return Err(ServerError::BindFailed {
            address: path.display().to_string(),
            reason: "another server is already running".to_string(),
        }
        .into());
    }

    // Left behind by a server that did not shut down cleanly.
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(socket = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    UnixListener::bind(path).map_err(|e| {
        ServerError::BindFailed {
            address: path.display().to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Process one command; returns why the server must stop, if it must.
async fn dispatch<C: Checker>(
    state: &mut ServerState,
    checker: &mut C,
    command: Command,
) -> Option<StopReason> {
    match command {
        Command::Request { request, reply } => {
            let kind = request.kind();
            let timer = metrics::REQUEST_LATENCY
                .with_label_values(&[kind])
                .start_timer();
            let result = handler::process_request(state, checker, request).await;
            timer.observe_duration();

            let status = if result.is_ok() { "ok" } else { "error" };
            metrics::REQUEST_COUNT.with_label_values(&[kind, status]).inc();

            let stop = match &result {
                Ok(Response::Stop { reason }) => Some(reason.clone()),
                Ok(_) => None,
                Err(e) => {
                    tracing::error!(kind, error = %e, "Request failed");
                    None
                }
            };
            // The requester may have disconnected meanwhile.
            let _ = reply.send(result);
            stop
        }
        Command::Subscribe { name, reply } => {
            let snapshot = handler::display_type_errors(state, &[]);
            let (id, receiver) = state.subscriptions.register(name, snapshot);
            if reply.send((id, receiver)).is_err() {
                state.subscriptions.remove(id);
            }
            None
        }
        Command::Unsubscribe { id } => {
            state.subscriptions.remove(id);
            None
        }
    }
}

/// Forward watcher batches to the dispatcher as incremental updates.
///
/// Each batch waits for its update to finish before the next message is
/// read from the watcher. Returns once `cancel` fires.
async fn watch(
    opener: Opener,
    setting: SubscriberSetting,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
) -> Result<()> {
    tracing::info!(root = %setting.root().display(), "Subscribing to file changes");
    watcher::with_subscription_until(&opener, &setting, &cancel, |paths: Vec<PathBuf>| {
        let commands = commands.clone();
        async move {
            metrics::BATCHES_TOTAL.inc();
            let (reply, done) = oneshot::channel();
            let request = Request::IncrementalUpdate { paths };
            commands
                .send(Command::Request { request, reply })
                .await
                .map_err(|_| SubscriptionError::Consumer("dispatcher stopped".to_string()))?;
            // Failures are logged by the dispatcher; the stream continues.
            let _ = done.await;
            Ok::<(), Error>(())
        }
    })
    .await
}

async fn join_watcher(
    task: &mut Option<WatcherTask>,
) -> std::result::Result<Result<()>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

/// Wait for a cancelled watcher task to close its connection.
async fn stop_watcher(mut task: WatcherTask) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
        Ok(joined) => {
            if let Err(e) = watcher_finished(joined) {
                tracing::debug!(error = %e, "Watcher failed while stopping");
            }
        }
        Err(_) => {
            tracing::warn!("Watcher did not stop in time, aborting");
            task.abort();
        }
    }
}

fn watcher_finished(joined: std::result::Result<Result<()>, JoinError>) -> Result<Exit> {
    match joined {
        Ok(Ok(())) => Ok(Exit::WatcherClosed),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(Error::internal(format!("watcher task failed: {e}"))),
    }
}

/// Serve one client connection.
async fn serve_client(stream: UnixStream, commands: mpsc::Sender<Command>) -> Result<()> {
    let mut lines: Lines = lines(stream);

    let message = match read_message::<ClientMessage>(&mut lines).await {
        Ok(Some(message)) => message,
        Ok(None) => return Ok(()),
        Err(e) => {
            let message = ServerMessage::Error {
                message: format!("invalid request: {e}"),
            };
            return write_message(&mut lines, &message).await;
        }
    };

    match message {
        ClientMessage::Request { request } => {
            let span = spans::request_span(request.kind());
            let answer = answer(request, &commands).instrument(span).await;
            write_message(&mut lines, &answer).await
        }
        ClientMessage::Subscribe { name } => serve_subscription(lines, name, &commands).await,
    }
}

async fn answer(request: Request, commands: &mpsc::Sender<Command>) -> ServerMessage {
    let (reply, response) = oneshot::channel();
    if commands
        .send(Command::Request { request, reply })
        .await
        .is_err()
    {
        return stopping();
    }

    match response.await {
        Ok(Ok(response)) => ServerMessage::Response { response },
        Ok(Err(e)) => ServerMessage::Error {
            message: e.to_string(),
        },
        Err(_) => stopping(),
    }
}

async fn serve_subscription(
    mut lines: Lines,
    name: String,
    commands: &mpsc::Sender<Command>,
) -> Result<()> {
    let (reply, registered) = oneshot::channel();
    let subscribe = Command::Subscribe {
        name: name.clone(),
        reply,
    };
    if commands.send(subscribe).await.is_err() {
        return write_message(&mut lines, &stopping()).await;
    }
    let Ok((id, mut pushes)) = registered.await else {
        return write_message(&mut lines, &stopping()).await;
    };

    let span = spans::subscription_span(&name, &id.to_string());
    let result = forward_pushes(&mut lines, &mut pushes).instrument(span).await;

    // The dispatcher is gone if the server is stopping.
    let _ = commands.send(Command::Unsubscribe { id }).await;
    result
}

/// Relay snapshots until either side closes, starting with the current one.
async fn forward_pushes(lines: &mut Lines, pushes: &mut SubscriptionReceiver) -> Result<()> {
    let mut snapshot = Some(Snapshot::clone(&pushes.borrow_and_update()));
    loop {
        if let Some(errors) = snapshot.take() {
            let message = ServerMessage::TypeErrors {
                errors: errors.to_vec(),
            };
            write_message(lines, &message).await?;
        }

        tokio::select! {
            changed = pushes.changed() => match changed {
                Ok(()) => snapshot = Some(Snapshot::clone(&pushes.borrow_and_update())),
                Err(_) => return Ok(()),
            },
            incoming = read_message::<serde_json::Value>(lines) => match incoming {
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    tracing::debug!("Subscriber disconnected");
                    return Ok(());
                }
            },
        }
    }
}

fn stopping() -> ServerMessage {
    ServerMessage::Error {
        message: "server is stopping".to_string(),
    }
}

/// Wait for shutdown signal (SIGTERM or Ctrl+C).
///
/// If a handler cannot be installed, that signal is ignored rather than
/// stopping the server.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
