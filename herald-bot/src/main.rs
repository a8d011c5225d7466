//! herald-bot: connects to an IRC server, joins the configured channels and
//! stays there until told to stop.
//!
//! Configuration comes from `config/<environment>.toml` (or `--config`),
//! with `HERALD__SECTION__KEY` environment overrides. Ctrl+C or SIGTERM
//! triggers a polite quit; a second signal gives up waiting for the server.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 connect failure,
//! 3 connection lost or connect timeout.

mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use herald_sdk::config::ConnectionConfig;
use herald_sdk::dispatcher::TracingSink;
use herald_sdk::orchestrator::{Orchestrator, OrchestratorHandle};
use herald_sdk::session::{SessionOutcome, SessionState};
use herald_sdk::transport::irc::IrcTransport;
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_LOST: u8 = 3;

#[derive(Parser)]
#[command(name = "herald-bot", about = "Config-driven IRC bot")]
struct Args {
    /// Explicit config file (overrides --environment)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Environment name; selects <config-dir>/<environment>.toml
    #[arg(long, env = "HERALD_ENVIRONMENT", default_value = "dev")]
    environment: String,

    /// Directory holding per-environment config files
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Log raw protocol lines (same as `debug = true` in the config)
    #[arg(long)]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, env = "HERALD_LOG_JSON")]
    json_logs: bool,

    /// Give up if registration has not completed after this many seconds
    #[arg(long)]
    connect_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.debug, args.json_logs);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn init_tracing(debug: bool, json: bool) {
    let default = if debug {
        "herald_bot=debug,herald_sdk=debug"
    } else {
        "herald_bot=info,herald_sdk=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let path = settings::resolve_path(args.config.as_deref(), &args.config_dir, &args.environment);
    tracing::info!(environment = %args.environment, path = %path.display(), "Loading configuration");
    let source = settings::load(&path, std::env::vars())?;

    let mut config = match ConnectionConfig::from_source(&source) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration, not connecting");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    config.debug_logging |= args.debug;

    tracing::info!(
        server = %config.target.host_port(),
        nick = %config.identity.nick_name,
        channels = ?config.channels,
        "Starting herald-bot"
    );

    let (orchestrator, handle) = Orchestrator::new(config, IrcTransport::new(), TracingSink);
    let mut session = tokio::spawn(orchestrator.run());

    let deadline = args.connect_timeout.map(Duration::from_secs);
    let timed_out = tokio::spawn(watch_connect_deadline(handle.clone(), deadline));

    let outcome = tokio::select! {
        outcome = &mut session => outcome?,
        _ = shutdown_signal() => {
            tracing::info!("Shutdown requested, sending quit");
            handle.shutdown();
            tokio::select! {
                outcome = &mut session => outcome?,
                _ = shutdown_signal() => {
                    tracing::warn!("Second signal, not waiting for the server to close the link");
                    session.abort();
                    return Ok(ExitCode::from(EXIT_LOST));
                }
            }
        }
    };

    if timed_out.await.unwrap_or(false) {
        tracing::error!("Registration did not complete in time");
        return Ok(ExitCode::from(EXIT_LOST));
    }
    Ok(exit_code(&outcome))
}

/// Request shutdown if the session is still connecting after `deadline`.
/// Returns whether that happened.
async fn watch_connect_deadline(handle: OrchestratorHandle, deadline: Option<Duration>) -> bool {
    let Some(deadline) = deadline else {
        return false;
    };
    let left_connecting = handle.wait_for(|s| !matches!(s, SessionState::Idle | SessionState::Connecting));
    if tokio::time::timeout(deadline, left_connecting).await.is_ok() {
        return false;
    }
    tracing::warn!(secs = deadline.as_secs(), "Connect timeout reached");
    handle.shutdown();
    true
}

fn exit_code(outcome: &SessionOutcome) -> ExitCode {
    match outcome {
        SessionOutcome::Shutdown => tracing::info!("Disconnected cleanly"),
        SessionOutcome::ConnectFailed { reason } => tracing::error!(%reason, "Could not connect"),
        SessionOutcome::ConnectionLost { reason } => tracing::error!(%reason, "Connection lost"),
    }
    ExitCode::from(outcome.exit_code())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_sdk::dispatcher::MemorySink;
    use herald_sdk::error::Result as SdkResult;
    use herald_sdk::event::TransportEvent;
    use herald_sdk::transport::Transport;
    use tokio::sync::mpsc;

    /// Accepts the connect call and never reports anything.
    struct SilentTransport;

    impl Transport for SilentTransport {
        fn connect(
            &mut self,
            _target: &herald_sdk::config::ConnectTarget,
            _identity: &herald_sdk::config::Identity,
            _events: mpsc::Sender<TransportEvent>,
        ) -> SdkResult<()> {
            Ok(())
        }

        fn send_raw(&mut self, _line: &str) -> SdkResult<()> {
            Ok(())
        }

        fn disconnect(&mut self) {}
    }

    fn config() -> ConnectionConfig {
        let source: toml::Value = toml::from_str(
            "[server]\naddress = \"irc.example.org\"\nport = 6667\nsecure = false\n\
             [user]\nusername = \"bot\"\nnickname = \"bot1\"\nrealname = \"Bot One\"\n",
        )
        .unwrap();
        ConnectionConfig::from_source(&source).unwrap()
    }

    #[test]
    fn args_parse_defaults() {
        let args = Args::parse_from(["herald-bot"]);
        assert_eq!(args.environment, "dev");
        assert_eq!(args.config_dir, PathBuf::from("config"));
        assert!(args.config.is_none());
        assert!(args.connect_timeout.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_deadline_shuts_down_a_silent_session() {
        let (orchestrator, handle) = Orchestrator::new(config(), SilentTransport, MemorySink::default());
        let session = tokio::spawn(orchestrator.run());

        let timed_out = watch_connect_deadline(handle.clone(), Some(Duration::from_secs(30))).await;
        assert!(timed_out);
        assert_eq!(session.await.unwrap(), SessionOutcome::Shutdown);
        assert_eq!(handle.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn no_deadline_never_times_out() {
        let (_orchestrator, handle) = Orchestrator::new(config(), SilentTransport, MemorySink::default());
        assert!(!watch_connect_deadline(handle, None).await);
    }
}
