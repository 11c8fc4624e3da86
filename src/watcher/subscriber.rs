//! Watcher subscription protocol.
//!
//! A subscriber opens a fresh connection, sends one `subscribe` command,
//! records the clock from the acknowledgment and then turns every change
//! notification into a batch of absolute paths for the consumer.
//!
//! A fresh-instance notification carrying the subscribe-time clock is the
//! watcher echoing its initial state and is ignored. Any other fresh instance
//! means the watcher lost track of the filesystem; the subscription fails so
//! the consumer never trusts incremental state built on the old clock.

use std::future::Future;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, Response};
use super::discovery::Opener;
use crate::error::SubscriptionError;
use crate::{Config, Error, Result};

/// Name under which the subscription is registered with the watcher.
pub const SUBSCRIPTION_NAME: &str = "recheckd_file_change_subscription";

/// What to watch: an absolute root plus file-name filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberSetting {
    root: PathBuf,
    suffixes: Vec<String>,
    base_names: Vec<String>,
}

impl SubscriberSetting {
    /// Create a setting.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` is not absolute.
    pub fn new(
        root: impl Into<PathBuf>,
        suffixes: Vec<String>,
        base_names: Vec<String>,
    ) -> Result<Self> {
        let root = root.into();
        if !root.is_absolute() {
            return Err(Error::config(format!(
                "watch root '{}' must be an absolute path",
                root.display()
            )));
        }
        Ok(Self {
            root,
            suffixes,
            base_names,
        })
    }

    /// Build the setting from server configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured root is not absolute.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.root.clone(),
            config.suffixes.clone(),
            config.base_names.clone(),
        )
    }

    /// Watched root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build the watcher's `subscribe` command.
    ///
    /// The expression selects regular files whose suffix is one of the
    /// requested suffixes or whose base name is one of the requested names.
    #[must_use]
    pub fn subscribe_command(&self) -> Value {
        let mut anyof = vec![json!("anyof")];
        anyof.extend(self.suffixes.iter().map(|suffix| json!(["suffix", suffix])));
        anyof.extend(
            self.base_names
                .iter()
                .map(|name| json!(["match", name, "basename"])),
        );

        json!([
            "subscribe",
            self.root.to_string_lossy(),
            SUBSCRIPTION_NAME,
            {
                "empty_on_fresh_instance": true,
                "expression": ["allof", ["type", "f"], anyof],
                "fields": ["name"],
            }
        ])
    }
}

/// Owns a watcher connection and shuts it down exactly once.
///
/// A guard dropped while still open, because its task was aborted or the
/// consumer panicked, hands the shutdown to the runtime.
struct ConnectionGuard {
    connection: Option<Box<dyn Connection>>,
}

impl ConnectionGuard {
    fn new(connection: Box<dyn Connection>) -> Self {
        Self {
            connection: Some(connection),
        }
    }

    fn get(&mut self) -> Result<&mut (dyn Connection + 'static)> {
        match self.connection.as_deref_mut() {
            Some(connection) => Ok(connection),
            None => Err(SubscriptionError::Transport("connection is closed".to_string()).into()),
        }
    }

    async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown().await;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!("Shutting down abandoned watcher connection");
                runtime.spawn(async move { connection.shutdown().await });
            }
            Err(_) => tracing::warn!("Watcher connection dropped outside a runtime"),
        }
    }
}

/// A live subscription: its connection and the clock seen at subscribe time.
pub struct SubscriberHandle {
    connection: ConnectionGuard,
    initial_clock: String,
}

impl SubscriberHandle {
    /// Clock the watcher reported when the subscription was acknowledged.
    #[must_use]
    pub fn initial_clock(&self) -> &str {
        &self.initial_clock
    }
}

impl std::fmt::Debug for SubscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberHandle")
            .field("initial_clock", &self.initial_clock)
            .finish_non_exhaustive()
    }
}

/// Interpretation of one message received while listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// The watcher echoed the subscribe-time state.
    FreshInstanceEcho,
    /// Files changed.
    Changes(Vec<PathBuf>),
}

/// Extract the initial clock from the subscribe acknowledgment.
///
/// # Errors
///
/// Returns a [`SubscriptionError`] for malformed, missing, rejected or
/// clock-less acknowledgments.
pub fn initial_clock(response: Response) -> std::result::Result<String, SubscriptionError> {
    let message = match response {
        Response::Ok(message) => message,
        Response::EndOfStream => return Err(SubscriptionError::NoInitialResponse),
        Response::Error(msg) => return Err(SubscriptionError::Protocol(msg)),
    };

    if let Some(error) = watcher_error(&message) {
        return Err(SubscriptionError::Rejected(error.to_string()));
    }

    message
        .get("clock")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(SubscriptionError::MissingClock)
}

/// Interpret one notification against the subscribe-time clock.
///
/// # Errors
///
/// Returns a [`SubscriptionError`] on an unexpected fresh instance, a
/// watcher error, or a message without `root` and `files`.
pub fn interpret(
    message: &Value,
    initial_clock: &str,
) -> std::result::Result<Notification, SubscriptionError> {
    if let Some(error) = watcher_error(message) {
        return Err(SubscriptionError::Rejected(error.to_string()));
    }

    let fresh_instance = message
        .get("is_fresh_instance")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if fresh_instance {
        let clock = message.get("clock").and_then(Value::as_str);
        return if clock == Some(initial_clock) {
            Ok(Notification::FreshInstanceEcho)
        } else {
            Err(SubscriptionError::FreshInstance)
        };
    }

    let root = message
        .get("root")
        .and_then(Value::as_str)
        .ok_or_else(|| SubscriptionError::protocol("notification has no `root`"))?;
    let files = message
        .get("files")
        .and_then(Value::as_array)
        .ok_or_else(|| SubscriptionError::protocol("notification has no `files`"))?;

    let root = Path::new(root);
    files
        .iter()
        .map(|file| {
            file.as_str()
                .map(|relative| root.join(relative))
                .ok_or_else(|| SubscriptionError::protocol(format!("invalid file entry {file}")))
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(Notification::Changes)
}

fn watcher_error(message: &Value) -> Option<&Value> {
    message.get("error").filter(|error| !error.is_null())
}

/// Open a connection and subscribe.
///
/// On failure the connection is shut down before the error is returned.
///
/// # Errors
///
/// Returns a connection error if the watcher cannot be reached, or a
/// [`SubscriptionError`] if the subscription is not acknowledged.
pub async fn subscribe(opener: &Opener, setting: &SubscriberSetting) -> Result<SubscriberHandle> {
    let mut connection = ConnectionGuard::new(opener.open().await?);

    let acknowledged = acknowledge(connection.get()?, setting).await;
    match acknowledged {
        Ok(initial_clock) => {
            tracing::info!(
                root = %setting.root.display(),
                clock = %initial_clock,
                "Subscribed to file changes"
            );
            Ok(SubscriberHandle {
                connection,
                initial_clock,
            })
        }
        Err(e) => {
            connection.close().await;
            Err(e)
        }
    }
}

async fn acknowledge(
    connection: &mut dyn Connection,
    setting: &SubscriberSetting,
) -> Result<String> {
    connection.send(setting.subscribe_command()).await?;
    let response = connection.receive().await;
    Ok(initial_clock(response)?)
}

/// Deliver change batches to `on_batch` until the stream ends or fails.
///
/// Each batch is awaited before the next message is read. The connection is
/// shut down exactly once, however the loop ends.
///
/// # Errors
///
/// Returns a [`SubscriptionError`] on protocol failures, or the consumer's
/// own error.
pub async fn listen<F, Fut>(handle: SubscriberHandle, on_batch: F) -> Result<()>
where
    F: FnMut(Vec<PathBuf>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    listen_until(handle, &CancellationToken::new(), on_batch).await
}

/// Like [`listen`], but stop cleanly once `cancel` fires.
///
/// A batch in flight when `cancel` fires is abandoned.
///
/// # Errors
///
/// Same as [`listen`].
pub async fn listen_until<F, Fut>(
    handle: SubscriberHandle,
    cancel: &CancellationToken,
    on_batch: F,
) -> Result<()>
where
    F: FnMut(Vec<PathBuf>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let SubscriberHandle {
        mut connection,
        initial_clock,
    } = handle;

    let result = tokio::select! {
        result = listen_loop(&mut connection, &initial_clock, on_batch) => result,
        () = cancel.cancelled() => {
            tracing::info!("Subscription cancelled");
            Ok(())
        }
    };
    connection.close().await;

    match &result {
        Ok(()) => tracing::info!("Watcher closed the subscription stream"),
        Err(e) => tracing::error!(error = %e, "Subscription failed"),
    }
    result
}

async fn listen_loop<F, Fut>(
    connection: &mut ConnectionGuard,
    initial_clock: &str,
    mut on_batch: F,
) -> Result<()>
where
    F: FnMut(Vec<PathBuf>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        let message = match connection.get()?.receive().await {
            Response::Ok(message) => message,
            Response::EndOfStream => return Ok(()),
            Response::Error(msg) => return Err(SubscriptionError::Protocol(msg).into()),
        };

        match interpret(&message, initial_clock)? {
            Notification::FreshInstanceEcho => {
                tracing::debug!("Ignoring initial fresh-instance notification");
            }
            Notification::Changes(paths) => {
                tracing::debug!(count = paths.len(), "Received file changes");
                on_batch(paths).await?;
            }
        }
    }
}

/// Subscribe, then listen until the stream ends or fails.
///
/// # Errors
///
/// Returns whatever [`subscribe`] or [`listen`] returns.
pub async fn with_subscription<F, Fut>(
    opener: &Opener,
    setting: &SubscriberSetting,
    on_batch: F,
) -> Result<()>
where
    F: FnMut(Vec<PathBuf>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    with_subscription_until(opener, setting, &CancellationToken::new(), on_batch).await
}

/// Like [`with_subscription`], but stop cleanly once `cancel` fires.
///
/// # Errors
///
/// Same as [`with_subscription`].
pub async fn with_subscription_until<F, Fut>(
    opener: &Opener,
    setting: &SubscriberSetting,
    cancel: &CancellationToken,
    on_batch: F,
) -> Result<()>
where
    F: FnMut(Vec<PathBuf>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let handle = tokio::select! {
        handle = subscribe(opener, setting) => handle?,
        () = cancel.cancelled() => return Ok(()),
    };
    listen_until(handle, cancel, on_batch).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::MockConnection;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const CLOCK: &str = "c:1700000000:42:1:7";

    fn setting(suffixes: &[&str], base_names: &[&str]) -> SubscriberSetting {
        SubscriberSetting::new(
            "/repo",
            suffixes.iter().map(ToString::to_string).collect(),
            base_names.iter().map(ToString::to_string).collect(),
        )
        .unwrap()
    }

    fn ack() -> Response {
        Response::Ok(json!({
            "version": "2024.01.22.00",
            "subscribe": SUBSCRIPTION_NAME,
            "clock": CLOCK,
        }))
    }

    fn opener_with(counter: &Arc<AtomicUsize>, responses: Vec<Response>) -> Opener {
        let responses = Arc::new(Mutex::new(Some(responses)));
        Opener::mock(counter, move || {
            let script = responses.lock().unwrap().take().unwrap_or_default();
            MockConnection::scripted(script)
        })
    }

    async fn collect(
        opener: &Opener,
        setting: &SubscriberSetting,
    ) -> (Result<()>, Vec<Vec<PathBuf>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let result = with_subscription(opener, setting, move |paths| {
            sink.lock().unwrap().push(paths);
            async { Ok(()) }
        })
        .await;
        let batches = batches.lock().unwrap().clone();
        (result, batches)
    }

    /// Evaluates the subset of the watcher expression language we emit.
    fn evaluate(expression: &Value, path: &Path) -> bool {
        let terms = expression.as_array().unwrap();
        match terms[0].as_str().unwrap() {
            "allof" => terms[1..].iter().all(|t| evaluate(t, path)),
            "anyof" => terms[1..].iter().any(|t| evaluate(t, path)),
            "type" => terms[1] == "f",
            "suffix" => path.extension().and_then(|e| e.to_str()) == terms[1].as_str(),
            "match" => {
                assert_eq!(terms[2], "basename");
                path.file_name().and_then(|n| n.to_str()) == terms[1].as_str()
            }
            other => panic!("unexpected term {other}"),
        }
    }

    #[test]
    fn test_setting_requires_absolute_root() {
        assert!(SubscriberSetting::new("repo", vec!["py".to_string()], Vec::new()).is_err());
    }

    #[test]
    fn test_subscribe_command_shape() {
        let command = setting(&["py"], &["TARGETS"]).subscribe_command();
        assert_eq!(
            command,
            json!([
                "subscribe",
                "/repo",
                SUBSCRIPTION_NAME,
                {
                    "empty_on_fresh_instance": true,
                    "expression": [
                        "allof",
                        ["type", "f"],
                        ["anyof", ["suffix", "py"], ["match", "TARGETS", "basename"]]
                    ],
                    "fields": ["name"]
                }
            ])
        );
    }

    #[test]
    fn test_expression_matches_suffix_or_base_name() {
        let command = setting(&["py", "pyi"], &["TARGETS", ".recheckd.toml"]).subscribe_command();
        let expression = &command[3]["expression"];

        let table = [
            ("/repo/a.py", true),
            ("/repo/pkg/b.pyi", true),
            ("/repo/pkg/TARGETS", true),
            ("/repo/.recheckd.toml", true),
            ("/repo/a.pyc", false),
            ("/repo/README.md", false),
            ("/repo/TARGETS.bak", false),
            ("/repo/py", false),
        ];
        for (path, expected) in table {
            assert_eq!(evaluate(expression, Path::new(path)), expected, "{path}");
        }
    }

    #[test]
    fn test_expression_with_no_base_names() {
        let command = setting(&["py"], &[]).subscribe_command();
        let expression = &command[3]["expression"];
        assert!(evaluate(expression, Path::new("/repo/x.py")));
        assert!(!evaluate(expression, Path::new("/repo/TARGETS")));
    }

    #[test]
    fn test_initial_clock_cases() {
        assert_eq!(initial_clock(ack()).unwrap(), CLOCK);
        assert_eq!(
            initial_clock(Response::EndOfStream),
            Err(SubscriptionError::NoInitialResponse)
        );
        assert_eq!(
            initial_clock(Response::Error("trailing characters".to_string())),
            Err(SubscriptionError::Protocol("trailing characters".to_string()))
        );
        assert_eq!(
            initial_clock(Response::Ok(json!({"clock": 12}))),
            Err(SubscriptionError::MissingClock)
        );
        assert_eq!(
            initial_clock(Response::Ok(json!({"error": null, "clock": CLOCK}))).unwrap(),
            CLOCK
        );
        assert!(matches!(
            initial_clock(Response::Ok(json!({"error": "unable to resolve root /repo"}))),
            Err(SubscriptionError::Rejected(payload)) if payload.contains("unable to resolve root")
        ));
    }

    #[test]
    fn test_interpret_changes_resolves_against_root() {
        let notification = interpret(&json!({"root": "/a", "files": ["b/c.py"]}), CLOCK).unwrap();
        assert_eq!(
            notification,
            Notification::Changes(vec![PathBuf::from("/a/b/c.py")])
        );
    }

    #[test]
    fn test_interpret_fresh_instance() {
        assert_eq!(
            interpret(&json!({"is_fresh_instance": true, "clock": CLOCK}), CLOCK).unwrap(),
            Notification::FreshInstanceEcho
        );
        assert_eq!(
            interpret(&json!({"is_fresh_instance": true, "clock": "c:2"}), CLOCK),
            Err(SubscriptionError::FreshInstance)
        );
        assert_eq!(
            interpret(&json!({"is_fresh_instance": true}), CLOCK),
            Err(SubscriptionError::FreshInstance)
        );
    }

    #[test]
    fn test_interpret_rejects_incomplete_messages() {
        assert!(interpret(&json!({"files": ["a.py"]}), CLOCK).is_err());
        assert!(interpret(&json!({"root": "/repo"}), CLOCK).is_err());
        assert!(interpret(&json!({"root": "/repo", "files": [1]}), CLOCK).is_err());
    }

    #[tokio::test]
    async fn test_echo_then_changes_then_end_of_stream() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opener = opener_with(
            &counter,
            vec![
                ack(),
                Response::Ok(json!({"is_fresh_instance": true, "clock": CLOCK})),
                Response::Ok(json!({"root": "/repo", "files": ["a.py"]})),
            ],
        );

        let (result, batches) = collect(&opener, &setting(&["py"], &[])).await;

        assert!(result.is_ok());
        assert_eq!(batches, vec![vec![PathBuf::from("/repo/a.py")]]);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batches_delivered_in_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opener = opener_with(
            &counter,
            vec![
                ack(),
                Response::Ok(json!({"root": "/repo", "files": ["a.py", "b.py"]})),
                Response::Ok(json!({"root": "/repo", "files": ["c.py"]})),
            ],
        );

        let (result, batches) = collect(&opener, &setting(&["py"], &[])).await;

        assert!(result.is_ok());
        assert_eq!(
            batches,
            vec![
                vec![PathBuf::from("/repo/a.py"), PathBuf::from("/repo/b.py")],
                vec![PathBuf::from("/repo/c.py")],
            ]
        );
    }

    #[tokio::test]
    async fn test_unexpected_fresh_instance_fails_without_callback() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opener = opener_with(
            &counter,
            vec![
                ack(),
                Response::Ok(json!({"is_fresh_instance": true, "clock": "c:1700000001:1:1:1"})),
                Response::Ok(json!({"root": "/repo", "files": ["a.py"]})),
            ],
        );

        let (result, batches) = collect(&opener, &setting(&["py"], &[])).await;

        assert!(matches!(
            result,
            Err(Error::Subscription(SubscriptionError::FreshInstance))
        ));
        assert!(batches.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_message_while_listening() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opener = opener_with(
            &counter,
            vec![ack(), Response::Error("EOF while parsing".to_string())],
        );

        let (result, _) = collect(&opener, &setting(&["py"], &[])).await;

        assert!(matches!(
            result,
            Err(Error::Subscription(SubscriptionError::Protocol(_)))
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_failures_shut_down_once() {
        let cases = vec![
            (Response::EndOfStream, SubscriptionError::NoInitialResponse),
            (
                Response::Error("bad json".to_string()),
                SubscriptionError::Protocol("bad json".to_string()),
            ),
            (
                Response::Ok(json!({"version": "2024"})),
                SubscriptionError::MissingClock,
            ),
        ];

        for (response, expected) in cases {
            let counter = Arc::new(AtomicUsize::new(0));
            let opener = opener_with(&counter, vec![response]);
            let (result, batches) = collect(&opener, &setting(&["py"], &[])).await;

            match result {
                Err(Error::Subscription(actual)) => assert_eq!(actual, expected),
                other => panic!("expected {expected:?}, got {other:?}"),
            }
            assert!(batches.is_empty());
            assert_eq!(counter.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_consumer_failure_propagates_after_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opener = opener_with(
            &counter,
            vec![
                ack(),
                Response::Ok(json!({"root": "/repo", "files": ["a.py"]})),
                Response::Ok(json!({"root": "/repo", "files": ["b.py"]})),
            ],
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let result = with_subscription(&opener, &setting(&["py"], &[]), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::from(SubscriptionError::Consumer("dispatcher gone".to_string()))) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_failure_shuts_down() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opener = Opener::mock(&counter, || {
            MockConnection::new(
                |_| Err(SubscriptionError::Transport("broken pipe".to_string()).into()),
                || Response::EndOfStream,
            )
        });

        let (result, _) = collect(&opener, &setting(&["py"], &[])).await;

        assert!(matches!(
            result,
            Err(Error::Subscription(SubscriptionError::Transport(_)))
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_subscribe_sends_command_and_records_clock() {
        let counter = Arc::new(AtomicUsize::new(0));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let opener = Opener::mock(&counter, move || {
            let sink = Arc::clone(&sink);
            let mut responses = vec![ack()].into_iter();
            MockConnection::new(
                move |value| {
                    sink.lock().unwrap().push(value);
                    Ok(())
                },
                move || responses.next().unwrap_or(Response::EndOfStream),
            )
        });
        let setting = setting(&["py"], &[]);

        let handle = subscribe(&opener, &setting).await.unwrap();
        assert_eq!(handle.initial_clock(), CLOCK);
        assert_eq!(sent.lock().unwrap().as_slice(), &[setting.subscribe_command()]);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        listen(handle, |_| async { Ok(()) }).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    fn idle_opener(counter: &Arc<AtomicUsize>, responses: Vec<Response>) -> Opener {
        let responses = Arc::new(Mutex::new(Some(responses)));
        Opener::mock(counter, move || {
            let script = responses.lock().unwrap().take().unwrap_or_default();
            MockConnection::held_open(script)
        })
    }

    /// Let tasks spawned by dropped guards run.
    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_cancelled_listen_shuts_down_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opener = idle_opener(&counter, vec![ack()]);
        let handle = subscribe(&opener, &setting(&["py"], &[])).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = listen_until(handle, &cancel, |_| async { Ok(()) }).await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_batch_shuts_down_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opener = idle_opener(
            &counter,
            vec![ack(), Response::Ok(json!({"root": "/repo", "files": ["a.py"]}))],
        );
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result = with_subscription_until(&opener, &setting(&["py"], &[]), &cancel, move |_| {
            trigger.cancel();
            std::future::pending::<Result<()>>()
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_aborted_subscription_shuts_down_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opener = idle_opener(
            &counter,
            vec![ack(), Response::Ok(json!({"root": "/repo", "files": ["a.py"]}))],
        );
        let (entered, batch_started) = tokio::sync::oneshot::channel();
        let mut entered = Some(entered);

        let task = tokio::spawn(async move {
            with_subscription(&opener, &setting(&["py"], &[]), move |_| {
                if let Some(entered) = entered.take() {
                    let _ = entered.send(());
                }
                std::future::pending::<Result<()>>()
            })
            .await
        });

        batch_started.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_consumer_shuts_down_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let opener = idle_opener(
            &counter,
            vec![ack(), Response::Ok(json!({"root": "/repo", "files": ["a.py"]}))],
        );

        let task = tokio::spawn(async move {
            with_subscription(
                &opener,
                &setting(&["py"], &[]),
                |_paths: Vec<PathBuf>| -> std::future::Ready<Result<()>> {
                    panic!("consumer failed")
                },
            )
            .await
        });

        assert!(task.await.unwrap_err().is_panic());
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
