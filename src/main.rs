//! recheckd - incremental recheck server
//!
//! Entry point for the server and its command-line client.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use recheckd::analysis::CommandChecker;
use recheckd::config::CriticalFile;
use recheckd::server::{init_metrics, init_tracing, App, Client, Request, Response};
use recheckd::{Config, Error, Result};

/// Time a freshly started server gets to answer.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// recheckd - incremental recheck server
#[derive(Parser, Debug)]
#[command(name = "recheckd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project root to watch and analyze
    #[arg(short, long, env = "RECHECKD_ROOT", default_value = ".", global = true)]
    root: PathBuf,

    /// Client socket path (default: <root>/.recheckd/server.sock)
    #[arg(long, env = "RECHECKD_SOCKET", global = true)]
    socket: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RECHECKD_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, env = "RECHECKD_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server in the foreground
    Serve(ServeArgs),
    /// Start a server if none is running, then print all type errors
    Incremental(ServeArgs),
    /// Print the type errors of the given files, or of every module
    Check {
        /// Files to report on
        paths: Vec<PathBuf>,
    },
    /// Print details of the running server
    Info,
    /// Stop the running server
    Stop,
    /// Print the full type error list after every update
    Subscribe {
        /// Name shown in server logs
        #[arg(default_value = "cli")]
        name: String,
    },
}

/// Options of a server process.
#[derive(Args, Debug, Clone)]
struct ServeArgs {
    /// Watcher executable used for socket discovery
    #[arg(long, env = "RECHECKD_WATCHMAN", default_value = "watchman")]
    watchman: PathBuf,

    /// Serve without a file watcher
    #[arg(long, env = "RECHECKD_NO_WATCHMAN")]
    no_watchman: bool,

    /// Tracked file suffixes, without the dot
    #[arg(
        long = "suffix",
        env = "RECHECKD_SUFFIXES",
        value_delimiter = ',',
        default_values = ["py", "pyi"]
    )]
    suffixes: Vec<String>,

    /// Extra file names the watcher reports
    #[arg(long = "base-name", env = "RECHECKD_BASE_NAMES", value_delimiter = ',')]
    base_names: Vec<String>,

    /// Files whose change stops the server (basename:NAME, ext:EXT, path:PATH)
    #[arg(long = "critical-file", env = "RECHECKD_CRITICAL_FILES", value_delimiter = ',')]
    critical_files: Vec<CriticalFile>,

    /// External checker program
    #[arg(long, env = "RECHECKD_CHECKER")]
    checker: Option<PathBuf>,

    /// Arguments passed to the checker before the file list
    #[arg(
        long = "checker-arg",
        env = "RECHECKD_CHECKER_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true
    )]
    checker_args: Vec<String>,

    /// Maximum number of concurrent checker processes
    #[arg(short, long, env = "RECHECKD_JOBS")]
    jobs: Option<usize>,
}

impl ServeArgs {
    fn into_config(self, cli: &Cli) -> Result<Config> {
        let defaults = Config::default();
        Ok(Config {
            root: project_root(&cli.root)?,
            socket_path: cli.socket.as_deref().map(absolute).transpose()?,
            log_level: cli.log_level.clone(),
            watchman_binary: self.watchman,
            no_watchman: self.no_watchman,
            suffixes: self.suffixes,
            base_names: self.base_names,
            critical_files: self.critical_files,
            checker_command: self.checker,
            checker_args: self.checker_args,
            jobs: self.jobs.unwrap_or(defaults.jobs),
        })
    }

    /// Arguments reproducing these options on a `serve` command line.
    fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--watchman".into(), self.watchman.clone().into()];
        if self.no_watchman {
            args.push("--no-watchman".into());
        }
        for suffix in &self.suffixes {
            args.extend(["--suffix".into(), suffix.into()]);
        }
        for name in &self.base_names {
            args.extend(["--base-name".into(), name.into()]);
        }
        for pattern in &self.critical_files {
            args.extend(["--critical-file".into(), pattern.to_string().into()]);
        }
        if let Some(checker) = &self.checker {
            args.extend(["--checker".into(), checker.clone().into()]);
        }
        for arg in &self.checker_args {
            args.push(format!("--checker-arg={arg}").into());
        }
        if let Some(jobs) = self.jobs {
            args.extend(["--jobs".into(), jobs.to_string().into()]);
        }
        args
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with configuration
    init_tracing(&cli.log_level, cli.log_json);

    match &cli.command {
        Command::Serve(args) => serve(args.clone().into_config(&cli)?).await,
        Command::Incremental(args) => incremental(&cli, args).await,
        Command::Check { paths } => {
            let paths = paths
                .iter()
                .map(|path| absolute(path))
                .collect::<Result<Vec<_>>>()?;
            let response = client(&cli)?
                .request(Request::DisplayTypeError { paths })
                .await?;
            print_response(&response)
        }
        Command::Info => print_response(&client(&cli)?.request(Request::GetInfo).await?),
        Command::Stop => {
            client(&cli)?.request(Request::Stop).await?;
            tracing::info!("Server stopped");
            Ok(())
        }
        Command::Subscribe { name } => {
            let mut stream = client(&cli)?.subscribe(name).await?;
            while let Some(errors) = stream.next().await? {
                println!("{}", serde_json::to_string(&errors)?);
            }
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("recheckd v{} starting...", env!("CARGO_PKG_VERSION"));
    tracing::debug!(?config, "Configuration loaded");

    // Validate config
    config.validate()?;

    // Initialize metrics
    init_metrics();

    let checker = CommandChecker::from_config(&config)?;
    App::new(config, checker).run().await
}

async fn incremental(cli: &Cli, args: &ServeArgs) -> Result<()> {
    let config = args.clone().into_config(cli)?;
    config.validate()?;
    let client = Client::new(config.socket_path());

    let result = async {
        if !client.is_running().await {
            tracing::info!("No server running, starting one");
            spawn_server(cli, args, &config)?;
            client.wait_until_running(STARTUP_TIMEOUT).await?;
        }
        client
            .request(Request::DisplayTypeError { paths: Vec::new() })
            .await
    }
    .await;

    match result {
        Ok(response) => print_response(&response),
        Err(e) => {
            tracing::error!(
                error = %e,
                "Incremental check failed; run `recheckd stop` and try again"
            );
            Err(e)
        }
    }
}

/// Start `recheckd serve` in the background, logging to the runtime directory.
fn spawn_server(cli: &Cli, args: &ServeArgs, config: &Config) -> Result<()> {
    std::fs::create_dir_all(config.runtime_dir())?;
    let log_path = config.runtime_dir().join("server.log");
    let log = std::fs::File::create(&log_path)?;

    let mut command = std::process::Command::new(std::env::current_exe()?);
    command
        .arg("--root")
        .arg(&config.root)
        .arg("--log-level")
        .arg(&cli.log_level);
    if let Some(socket) = &config.socket_path {
        command.arg("--socket").arg(socket);
    }
    command
        .arg("serve")
        .args(args.to_args())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(log);

    let child = command.spawn()?;
    tracing::info!(pid = child.id(), log = %log_path.display(), "Server started");
    Ok(())
}

fn client(cli: &Cli) -> Result<Client> {
    let config = Config {
        root: project_root(&cli.root)?,
        socket_path: cli.socket.as_deref().map(absolute).transpose()?,
        ..Config::default()
    };
    Ok(Client::new(config.socket_path()))
}

fn print_response(response: &Response) -> Result<()> {
    match response {
        Response::TypeErrors { errors } => {
            for error in errors {
                println!("{error}");
            }
            tracing::info!(count = errors.len(), "Type errors");
        }
        Response::Info(info) => println!("{}", serde_json::to_string_pretty(info)?),
        Response::Ok => {}
        Response::Stop { reason } => {
            return Err(Error::internal(format!("server stopped: {reason:?}")));
        }
    }
    Ok(())
}

/// Resolve the root the way the watcher reports it.
fn project_root(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).map_err(|e| {
        Error::config(format!("cannot resolve root '{}': {e}", path.display()))
    })
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
