//! Lifecycle events emitted by a transport.

use std::fmt;

/// How the server advertised a channel in its NAMES reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Public,
    Private,
    Secret,
    Unknown,
}

impl ChannelType {
    /// Map the RPL_NAMREPLY visibility symbol (`=`, `*`, `@`).
    pub fn from_symbol(symbol: &str) -> Self {
        match symbol {
            "=" => Self::Public,
            "*" => Self::Private,
            "@" => Self::Secret,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Public => "Public",
            Self::Private => "Private",
            Self::Secret => "Secret",
            Self::Unknown => "Unspecified",
        };
        f.write_str(s)
    }
}

/// Events a transport reports to the orchestrator.
///
/// The transport guarantees that `Registered` is only sent once the server
/// has accepted our identity; `Connected` only means the socket is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Socket (and TLS, if any) established.
    Connected,

    /// Registration complete. `nick` is the nick the server confirmed.
    Registered { nick: String },

    /// Connection closed, by either side.
    Disconnected { reason: String },

    /// The connection could not be established.
    ConnectFailed { reason: String },

    /// LUSERS statistics received after registration.
    NetworkInformationReceived,

    /// End of the message of the day (or ERR_NOMOTD).
    MotdReceived,

    /// ISUPPORT (005) line received.
    ServerSupportedFeaturesReceived,

    /// We joined a channel and the server finished sending its state.
    ChannelJoined {
        channel: String,
        topic: Option<String>,
        channel_type: ChannelType,
    },

    /// A line written to the socket, without the trailing CRLF.
    RawMessageSent(String),

    /// A line read from the socket, without the trailing CRLF.
    RawMessageReceived(String),
}

impl TransportEvent {
    /// Short stable name used as the `event` field of log records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Registered { .. } => "registered",
            Self::Disconnected { .. } => "disconnected",
            Self::ConnectFailed { .. } => "connect_failed",
            Self::NetworkInformationReceived => "network_information_received",
            Self::MotdReceived => "motd_received",
            Self::ServerSupportedFeaturesReceived => "server_supported_features_received",
            Self::ChannelJoined { .. } => "channel_joined",
            Self::RawMessageSent(_) => "raw_message_sent",
            Self::RawMessageReceived(_) => "raw_message_received",
        }
    }

    /// Raw protocol traffic, as opposed to lifecycle milestones.
    pub fn is_raw(&self) -> bool {
        matches!(self, Self::RawMessageSent(_) | Self::RawMessageReceived(_))
    }
}
