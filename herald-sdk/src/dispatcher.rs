//! Lifecycle event reporting.
//!
//! The dispatcher turns transport events into structured info-level
//! records and hands them to a [`LogSink`]. It runs on its own task behind a
//! bounded mailbox so that slow logging never holds up event processing. It
//! only observes: nothing here feeds back into the session state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::{ChannelType, TransportEvent};

/// Default mailbox size between the orchestrator and the dispatcher task.
pub const DEFAULT_MAILBOX: usize = 1024;

/// One info-level log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleRecord {
    /// Stable event name, e.g. `connected` or `channel_joined`.
    pub event: &'static str,
    pub server: String,
    pub message: String,
    pub channel: Option<String>,
    pub topic: Option<String>,
    pub channel_type: Option<ChannelType>,
    /// Failure or disconnect reason.
    pub reason: Option<String>,
}

impl LifecycleRecord {
    fn new(event: &'static str, server: &str, message: String) -> Self {
        Self {
            event,
            server: server.to_string(),
            message,
            channel: None,
            topic: None,
            channel_type: None,
            reason: None,
        }
    }

    /// Build the record for `event`. Raw traffic only produces a record when
    /// `debug` is set.
    pub fn describe(event: &TransportEvent, server: &str, debug: bool) -> Option<Self> {
        let record = match event {
            TransportEvent::Connected => Self::new(event.kind(), server, format!("Connected to {server}")),
            TransportEvent::Registered { nick } => {
                Self::new(event.kind(), server, format!("Registered to {server} as {nick}"))
            }
            TransportEvent::Disconnected { reason } => Self {
                reason: Some(reason.clone()),
                ..Self::new(event.kind(), server, format!("Disconnected from {server}"))
            },
            TransportEvent::ConnectFailed { reason } => Self {
                reason: Some(reason.clone()),
                ..Self::new(event.kind(), server, format!("Connection to {server} failed"))
            },
            TransportEvent::NetworkInformationReceived => {
                Self::new(event.kind(), server, format!("Received network information from {server}"))
            }
            TransportEvent::MotdReceived => Self::new(event.kind(), server, format!("MOTD received from {server}")),
            TransportEvent::ServerSupportedFeaturesReceived => {
                Self::new(event.kind(), server, format!("Supported features received from {server}"))
            }
            TransportEvent::ChannelJoined { channel, topic, channel_type } => Self {
                channel: Some(channel.clone()),
                topic: topic.clone(),
                channel_type: Some(*channel_type),
                ..Self::new(
                    event.kind(),
                    server,
                    format!(
                        "Joined {channel} : Topic [{}] : Type [{channel_type}]",
                        topic.as_deref().unwrap_or("")
                    ),
                )
            },
            TransportEvent::RawMessageSent(line) | TransportEvent::RawMessageReceived(line) => {
                if !debug {
                    return None;
                }
                Self::new(event.kind(), server, line.clone())
            }
        };
        Some(record)
    }

    /// Record for a JOIN the orchestrator is about to issue.
    pub fn joining(server: &str, channel: &str) -> Self {
        Self {
            channel: Some(channel.to_string()),
            ..Self::new("joining_channel", server, format!("Joining {channel}"))
        }
    }
}

/// Destination for lifecycle records.
pub trait LogSink: Send + 'static {
    fn record(&self, record: &LifecycleRecord);
}

/// Writes records through `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, r: &LifecycleRecord) {
        tracing::info!(
            event = r.event,
            server = %r.server,
            channel = r.channel.as_deref(),
            topic = r.topic.as_deref(),
            channel_type = r.channel_type.map(tracing::field::display),
            reason = r.reason.as_deref(),
            "{}",
            r.message
        );
    }
}

/// Keeps records in memory. Cloning shares the buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<LifecycleRecord>>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<LifecycleRecord> {
        self.records.lock().clone()
    }

    /// Just the event names, in arrival order.
    pub fn events(&self) -> Vec<&'static str> {
        self.records.lock().iter().map(|r| r.event).collect()
    }
}

impl LogSink for MemorySink {
    fn record(&self, record: &LifecycleRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Sending half of the dispatcher mailbox.
///
/// Dropping every `Dispatcher` lets the task drain its mailbox and exit.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<LifecycleRecord>,
    server: String,
    debug: bool,
    dropped: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn spawn<S: LogSink>(sink: S, server: String, debug: bool, mailbox: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<LifecycleRecord>(mailbox.max(1));
        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                sink.record(&record);
            }
        });
        let dispatcher = Self { tx, server, debug, dropped: Arc::default() };
        (dispatcher, task)
    }

    /// Report a transport event. Never waits.
    pub fn observe(&self, event: &TransportEvent) {
        if let Some(record) = LifecycleRecord::describe(event, &self.server, self.debug) {
            self.deliver(record);
        }
    }

    pub fn joining(&self, channel: &str) {
        self.deliver(LifecycleRecord::joining(&self.server, channel));
    }

    /// Records that could not be queued because the mailbox was full.
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn deliver(&self, record: LifecycleRecord) {
        if let Err(e) = self.tx.try_send(record) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let record = e.into_inner();
            tracing::warn!(
                event = record.event,
                dropped_total = total,
                "Lifecycle dispatcher mailbox full, record not logged: {}",
                record.message
            );
        }
    }
}
