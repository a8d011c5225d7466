//! Shared fixtures for the lifecycle tests: a transport that records every
//! call and lets the test play the server's part by emitting events.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use herald_sdk::config::{ConnectTarget, ConnectionConfig, Identity};
use herald_sdk::error::Result;
use herald_sdk::event::TransportEvent;
use herald_sdk::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect { target: ConnectTarget, identity: Identity },
    SendRaw(String),
    Join(String),
    Quit(String),
    Disconnect,
}

#[derive(Default)]
struct Inner {
    calls: Vec<Call>,
    events: Option<mpsc::Sender<TransportEvent>>,
}

/// Cloning shares the call log, so a test can keep one copy while the
/// orchestrator owns the other.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Inner>>,
}

impl RecordingTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.inner.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn joins(&self) -> Vec<String> {
        self.inner
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Join(channel) => Some(channel.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn quits(&self) -> usize {
        self.count(|c| matches!(c, Call::Quit(_)))
    }

    pub fn releases(&self) -> usize {
        self.count(|c| matches!(c, Call::Disconnect))
    }

    /// Play the server: deliver `event` as if it came off the socket.
    pub async fn emit(&self, event: TransportEvent) {
        let tx = self.inner.lock().events.clone().expect("transport was never connected");
        tx.send(event).await.expect("orchestrator stopped listening");
    }

    /// Wait until `connect` has been called.
    pub async fn wait_connected(&self) {
        eventually(|| self.inner.lock().events.is_some()).await;
    }
}

impl Transport for RecordingTransport {
    fn connect(
        &mut self,
        target: &ConnectTarget,
        identity: &Identity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(Call::Connect { target: target.clone(), identity: identity.clone() });
        inner.events = Some(events);
        Ok(())
    }

    fn send_raw(&mut self, line: &str) -> Result<()> {
        self.inner.lock().calls.push(Call::SendRaw(line.to_string()));
        Ok(())
    }

    fn join_channel(&mut self, channel: &str) -> Result<()> {
        self.inner.lock().calls.push(Call::Join(channel.to_string()));
        Ok(())
    }

    fn quit(&mut self, message: &str) -> Result<()> {
        self.inner.lock().calls.push(Call::Quit(message.to_string()));
        Ok(())
    }

    fn disconnect(&mut self) {
        self.inner.lock().calls.push(Call::Disconnect);
    }
}

/// Poll `cond` until it holds, failing the test after a generous deadline.
pub async fn eventually(cond: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}

pub fn config_toml(channels: &[&str]) -> toml::Value {
    let channels: Vec<toml::Value> = channels.iter().map(|c| toml::Value::String(c.to_string())).collect();
    let mut value: toml::Value = toml::from_str(
        r#"
        [server]
        address = "irc.example.org"
        port = 6697
        secure = true

        [user]
        username = "bot"
        nickname = "bot1"
        realname = "Bot One"
        "#,
    )
    .unwrap();
    value.as_table_mut().unwrap().insert("channels".into(), toml::Value::Array(channels));
    value
}

pub fn config(channels: &[&str]) -> ConnectionConfig {
    ConnectionConfig::from_source(&config_toml(channels)).unwrap()
}

pub fn registered() -> TransportEvent {
    TransportEvent::Registered { nick: "bot1".into() }
}

pub fn disconnected() -> TransportEvent {
    TransportEvent::Disconnected { reason: "Closing Link".into() }
}
