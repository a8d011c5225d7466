//! The connection lifecycle as a pure state machine.
//!
//! [`Session::handle`] maps one [`Input`] to the [`Action`]s the
//! orchestrator must carry out. No I/O happens here, which keeps the
//! ordering rules (joins only after registration, exactly one quit, exactly
//! one release) checkable in isolation.

use std::fmt;

use crate::event::TransportEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Registered,
    JoiningChannels,
    Active,
    Disconnecting,
    Disconnected,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// States in which the server knows who we are and a quit is owed.
    pub fn is_registered(self) -> bool {
        matches!(self, Self::Registered | Self::JoiningChannels | Self::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything that can move the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// Configuration is valid; start the single connection attempt.
    Start,
    Transport(TransportEvent),
    Shutdown,
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Connect,
    Join(String),
    Quit(String),
    /// Release the transport. Emitted at most once per session.
    Release,
}

/// How a finished session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Ended because shutdown was requested.
    Shutdown,
    ConnectFailed { reason: String },
    /// The server or network closed a session we did not ask to end.
    ConnectionLost { reason: String },
}

impl SessionOutcome {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Shutdown)
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Shutdown => 0,
            Self::ConnectFailed { .. } => 2,
            Self::ConnectionLost { .. } => 3,
        }
    }
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
    channels: Vec<String>,
    quit_message: String,
    released: bool,
    outcome: Option<SessionOutcome>,
}

impl Session {
    pub fn new(channels: Vec<String>, quit_message: String) -> Self {
        Self {
            state: SessionState::Idle,
            channels,
            quit_message,
            released: false,
            outcome: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Terminal and released: nothing further will happen.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal() && self.released
    }

    pub fn outcome(&self) -> Option<&SessionOutcome> {
        self.outcome.as_ref()
    }

    pub fn handle(&mut self, input: &Input) -> Vec<Action> {
        match input {
            Input::Start => self.on_start(),
            Input::Shutdown => self.on_shutdown(),
            Input::Transport(event) => self.on_event(event),
        }
    }

    fn on_start(&mut self) -> Vec<Action> {
        if self.state != SessionState::Idle {
            return Vec::new();
        }
        self.transition(SessionState::Connecting);
        vec![Action::Connect]
    }

    fn on_event(&mut self, event: &TransportEvent) -> Vec<Action> {
        use SessionState::*;

        match (self.state, event) {
            (Connecting, TransportEvent::Registered { .. }) => {
                self.transition(Registered);
                self.transition(JoiningChannels);
                let actions = self.channels.iter().cloned().map(Action::Join).collect();
                self.transition(Active);
                actions
            }
            (Connecting, TransportEvent::ConnectFailed { reason }) => {
                self.finish(Failed, SessionOutcome::ConnectFailed { reason: reason.clone() })
            }
            (Disconnecting, TransportEvent::Disconnected { .. }) => {
                self.finish(Disconnected, SessionOutcome::Shutdown)
            }
            (Connecting | Registered | JoiningChannels | Active, TransportEvent::Disconnected { reason }) => {
                tracing::warn!(state = %self.state, reason = %reason, "Unexpected disconnect");
                self.finish(Disconnected, SessionOutcome::ConnectionLost { reason: reason.clone() })
            }
            (state, TransportEvent::Registered { .. } | TransportEvent::ConnectFailed { .. }) => {
                tracing::debug!(%state, event = event.kind(), "Ignoring lifecycle event in this state");
                Vec::new()
            }
            // Everything else is informational.
            _ => Vec::new(),
        }
    }

    fn on_shutdown(&mut self) -> Vec<Action> {
        use SessionState::*;

        match self.state {
            Idle | Connecting => self.finish(Disconnected, SessionOutcome::Shutdown),
            Registered | JoiningChannels | Active => {
                self.transition(Disconnecting);
                vec![Action::Quit(self.quit_message.clone())]
            }
            Disconnecting | Disconnected | Failed => {
                tracing::debug!(state = %self.state, "Shutdown already in progress or complete");
                Vec::new()
            }
        }
    }

    fn finish(&mut self, to: SessionState, outcome: SessionOutcome) -> Vec<Action> {
        self.transition(to);
        self.outcome.get_or_insert(outcome);
        if self.released {
            return Vec::new();
        }
        self.released = true;
        vec![Action::Release]
    }

    fn transition(&mut self, to: SessionState) {
        tracing::debug!(from = %self.state, %to, "Session state change");
        self.state = to;
    }
}
