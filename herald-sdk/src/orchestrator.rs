//! Runs one connection from validated config to a terminal state.
//!
//! The orchestrator owns a single task that consumes transport events and
//! shutdown requests in arrival order, feeds them to the [`Session`] state
//! machine and executes the resulting actions. Outbound lines go through the
//! [`FloodQueue`]; event reporting goes to the [`Dispatcher`]. The transport
//! and log sink are supplied by the caller.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::config::ConnectionConfig;
use crate::dispatcher::{self, Dispatcher, LogSink};
use crate::event::TransportEvent;
use crate::flood::{FloodQueue, Outbound};
use crate::session::{Action, Input, Session, SessionOutcome, SessionState};
use crate::transport::Transport;

/// Transport events buffered ahead of the orchestrator.
const EVENT_BUFFER: usize = 1024;

#[derive(Debug)]
enum Control {
    Shutdown,
}

/// Cheap handle for requesting shutdown and watching the session state.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    control_tx: mpsc::Sender<Control>,
    state_rx: watch::Receiver<SessionState>,
}

impl OrchestratorHandle {
    /// Ask the session to end. Idempotent: repeated calls, including calls
    /// after the session finished, have no further effect.
    pub fn shutdown(&self) {
        // A full channel already holds a shutdown request.
        let _ = self.control_tx.try_send(Control::Shutdown);
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// A receiver that is notified when the state changes. Only the state at
    /// the end of each input is published: registration passes through
    /// `Registered` and `JoiningChannels` to `Active` in one step, so
    /// observers see `Connecting` followed directly by `Active`.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait until the state satisfies `pred`. Returns the matching state,
    /// or `None` if the orchestrator finished without reaching it.
    pub async fn wait_for(&self, pred: impl Fn(SessionState) -> bool) -> Option<SessionState> {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|s| pred(*s)).await.ok().map(|s| *s)
    }
}

pub struct Orchestrator<T: Transport, S: LogSink> {
    config: ConnectionConfig,
    transport: Arc<Mutex<T>>,
    sink: S,
    control_rx: mpsc::Receiver<Control>,
    state_tx: watch::Sender<SessionState>,
}

impl<T: Transport, S: LogSink> Orchestrator<T, S> {
    pub fn new(config: ConnectionConfig, transport: T, sink: S) -> (Self, OrchestratorHandle) {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let orchestrator = Self {
            config,
            transport: Arc::new(Mutex::new(transport)),
            sink,
            control_rx,
            state_tx,
        };
        (orchestrator, OrchestratorHandle { control_tx, state_rx })
    }

    /// Drive the session until it is finished. A shutdown requested before
    /// this is called ends the session without connecting.
    pub async fn run(self) -> SessionOutcome {
        let Self { config, transport, sink, mut control_rx, state_tx } = self;

        let (dispatcher, dispatch_task) = Dispatcher::spawn(
            sink,
            config.target.address.clone(),
            config.debug_logging,
            dispatcher::DEFAULT_MAILBOX,
        );

        let delivery = transport.clone();
        let (outbound, outbound_task) = FloodQueue::spawn(&config.flood, move |item| {
            let mut transport = delivery.lock();
            let result = match &item {
                Outbound::Raw(line) => transport.send_raw(line),
                Outbound::Join(channel) => transport.join_channel(channel),
                Outbound::Quit(message) => transport.quit(message),
            };
            if let Err(e) = result {
                tracing::error!(error = %e, ?item, "Outbound line not delivered");
            }
        });

        let (events_tx, mut events_rx) = mpsc::channel::<TransportEvent>(EVENT_BUFFER);
        let mut session = Session::new(config.channels.clone(), config.quit_message.clone());
        let exec = Executor {
            config: &config,
            transport: &transport,
            outbound: &outbound,
            dispatcher: &dispatcher,
            events_tx: &events_tx,
        };

        if let Ok(Control::Shutdown) = control_rx.try_recv() {
            exec.apply(session.handle(&Input::Shutdown));
        }
        exec.apply(session.handle(&Input::Start));
        state_tx.send_replace(session.state());

        tracing::info!(
            server = %config.target.host_port(),
            secure = config.target.secure,
            nick = %config.identity.nick_name,
            channels = config.channels.len(),
            "Session started"
        );

        let mut control_open = true;
        while !session.is_finished() {
            let input = tokio::select! {
                Some(event) = events_rx.recv() => {
                    exec.dispatcher.observe(&event);
                    Input::Transport(event)
                }
                control = control_rx.recv(), if control_open => match control {
                    Some(Control::Shutdown) => Input::Shutdown,
                    None => {
                        // Every handle is gone; nobody can ask politely any more.
                        control_open = false;
                        continue;
                    }
                },
            };
            exec.apply(session.handle(&input));
            state_tx.send_replace(session.state());
        }

        // Lines still waiting for a token have nowhere to go.
        outbound_task.abort();
        drop(exec);
        drop(dispatcher);
        let _ = dispatch_task.await;

        let outcome = session.outcome().cloned().unwrap_or(SessionOutcome::Shutdown);
        tracing::info!(state = %session.state(), ?outcome, "Session finished");
        outcome
    }
}

struct Executor<'a, T: Transport> {
    config: &'a ConnectionConfig,
    transport: &'a Arc<Mutex<T>>,
    outbound: &'a FloodQueue,
    dispatcher: &'a Dispatcher,
    events_tx: &'a mpsc::Sender<TransportEvent>,
}

impl<T: Transport> Executor<'_, T> {
    fn apply(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect => {
                    let result = self.transport.lock().connect(
                        &self.config.target,
                        &self.config.identity,
                        self.events_tx.clone(),
                    );
                    if let Err(e) = result {
                        // Report through the normal event path so the
                        // failure is logged and transitions like any other.
                        let _ = self
                            .events_tx
                            .try_send(TransportEvent::ConnectFailed { reason: e.to_string() });
                    }
                }
                Action::Join(channel) => {
                    self.dispatcher.joining(&channel);
                    if let Err(e) = self.outbound.push(Outbound::Join(channel.clone())) {
                        tracing::error!(error = %e, %channel, "Could not queue channel join");
                    }
                }
                Action::Quit(message) => {
                    if let Err(e) = self.outbound.push(Outbound::Quit(message.clone())) {
                        // Without the quit we would wait in Disconnecting forever.
                        tracing::error!(error = %e, "Could not queue quit, writing it directly");
                        if let Err(e) = self.transport.lock().quit(&message) {
                            tracing::error!(error = %e, "Quit failed");
                        }
                    }
                }
                Action::Release => {
                    self.transport.lock().disconnect();
                    tracing::debug!("Transport released");
                }
            }
        }
    }
}
