//! Error types surfaced by the SDK.

use thiserror::Error;

/// Errors returned synchronously by SDK operations.
///
/// Connection failures and disconnects are *not* errors here: they arrive as
/// lifecycle events and move the session state instead.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Required configuration is missing or malformed. Raised before any
    /// network call is made.
    #[error("configuration format error: {}", .problems.join("; "))]
    ConfigurationFormat { problems: Vec<String> },

    /// The outbound queue is at capacity; the line was not accepted.
    #[error("outbound queue full ({capacity} pending lines)")]
    Backpressure { capacity: usize },

    /// A transport primitive could not be carried out.
    #[error("transport error: {0}")]
    Transport(String),

    /// The component owning a channel has stopped.
    #[error("{0} is no longer running")]
    Closed(&'static str),
}

impl ClientError {
    pub(crate) fn format(problems: Vec<String>) -> Self {
        Self::ConfigurationFormat { problems }
    }

    /// True when this is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigurationFormat { .. })
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
