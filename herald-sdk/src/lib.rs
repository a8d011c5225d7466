//! herald-sdk: connection lifecycle for a configuration-driven IRC bot.
//!
//! The crate validates a connection configuration, connects through a
//! [`transport::Transport`], waits for registration, joins the configured
//! channels in order and quits politely on shutdown. Every outbound line
//! goes through the [`flood`] limiter, and every lifecycle event is reported
//! by the [`dispatcher`] on its own task.
//!
//! The typical host looks like this:
//!
//! ```rust,no_run
//! use herald_sdk::config::ConnectionConfig;
//! use herald_sdk::dispatcher::TracingSink;
//! use herald_sdk::orchestrator::Orchestrator;
//! use herald_sdk::transport::irc::IrcTransport;
//!
//! # async fn example(source: toml::Value) -> anyhow::Result<()> {
//! let config = ConnectionConfig::from_source(&source)?;
//! let (orchestrator, handle) = Orchestrator::new(config, IrcTransport::new(), TracingSink);
//! let session = tokio::spawn(orchestrator.run());
//!
//! tokio::signal::ctrl_c().await?;
//! handle.shutdown();
//! let outcome = session.await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod flood;
pub mod orchestrator;
pub mod session;
pub mod transport;

pub use error::ClientError;
