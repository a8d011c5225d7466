//! The transport boundary.
//!
//! A [`Transport`] owns the socket and the protocol session. Its primitives
//! never block: `connect` starts the attempt in the background and every
//! later milestone (including failure) is reported as a [`TransportEvent`]
//! on the channel handed to `connect`.

pub mod irc;
mod line;

use tokio::sync::mpsc;

use crate::config::{ConnectTarget, Identity};
use crate::error::Result;
use crate::event::TransportEvent;

pub use line::Line;

pub trait Transport: Send + 'static {
    /// Begin connecting and registering `identity`. Returns once the attempt
    /// has been started; outcome arrives on `events`.
    fn connect(
        &mut self,
        target: &ConnectTarget,
        identity: &Identity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<()>;

    /// Queue one protocol line (without CRLF) for writing.
    fn send_raw(&mut self, line: &str) -> Result<()>;

    fn join_channel(&mut self, channel: &str) -> Result<()> {
        self.send_raw(&format!("JOIN {channel}"))
    }

    /// Ask the server to end the session with `message` as the reason. The
    /// server answers by closing the connection.
    fn quit(&mut self, message: &str) -> Result<()> {
        self.send_raw(&format!("QUIT :{message}"))
    }

    /// Release the connection immediately. Safe to call when not connected.
    fn disconnect(&mut self);
}
