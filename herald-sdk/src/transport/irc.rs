//! IRC transport over TCP, optionally wrapped in TLS.
//!
//! `connect` spawns a session task that resolves and connects the socket,
//! performs registration (PASS/NICK/USER) and then multiplexes reads from
//! the server with lines queued through [`Transport::send_raw`]. Server
//! replies relevant to the lifecycle are turned into [`TransportEvent`]s;
//! every line read or written is also reported as a raw event.
//!
//! Reconnection is not handled here. A closed socket produces
//! [`TransportEvent::Disconnected`] and the session task ends.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;

use super::{Line, Transport};
use crate::config::{ConnectTarget, Identity};
use crate::error::{ClientError, Result};
use crate::event::{ChannelType, TransportEvent};

/// Lines buffered between `send_raw` and the socket writer.
const WRITE_BUFFER: usize = 256;

/// How many alternative nicks to try when ours is taken.
const MAX_NICK_RETRIES: u32 = 5;

struct ActiveSession {
    lines: mpsc::Sender<String>,
    task: JoinHandle<()>,
}

/// Production [`Transport`] speaking IRC over a socket.
#[derive(Default)]
pub struct IrcTransport {
    session: Option<ActiveSession>,
}

impl IrcTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for IrcTransport {
    fn connect(
        &mut self,
        target: &ConnectTarget,
        identity: &Identity,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<()> {
        if self.session.is_some() {
            return Err(ClientError::Transport("already connected".to_string()));
        }

        let (lines_tx, lines_rx) = mpsc::channel(WRITE_BUFFER);
        let target = target.clone();
        let identity = identity.clone();

        let task = tokio::spawn(async move {
            let conn = match establish_connection(&target).await {
                Ok(conn) => conn,
                Err(e) => {
                    let _ = events.send(TransportEvent::ConnectFailed { reason: e.to_string() }).await;
                    return;
                }
            };
            let _ = events.send(TransportEvent::Connected).await;

            let result = match conn {
                EstablishedConnection::Plain(tcp) => {
                    let (reader, writer) = tokio::io::split(tcp);
                    run_session(BufReader::new(reader), writer, &identity, &events, lines_rx).await
                }
                EstablishedConnection::Tls(tls) => {
                    let (reader, writer) = tokio::io::split(tls);
                    run_session(BufReader::new(reader), writer, &identity, &events, lines_rx).await
                }
            };
            if let Err(e) = result {
                let _ = events.send(TransportEvent::Disconnected { reason: e.to_string() }).await;
            }
        });

        self.session = Some(ActiveSession { lines: lines_tx, task });
        Ok(())
    }

    fn send_raw(&mut self, line: &str) -> Result<()> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| ClientError::Transport("not connected".to_string()))?;
        session.lines.try_send(line.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::Backpressure { capacity: WRITE_BUFFER },
            mpsc::error::TrySendError::Closed(_) => ClientError::Transport("connection closed".to_string()),
        })
    }

    fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            // Aborting the task drops both socket halves.
            session.task.abort();
            tracing::debug!("Transport released");
        }
    }
}

impl Drop for IrcTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// A connected socket that has not started registration yet.
pub enum EstablishedConnection {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

/// Connect TCP, then run the TLS handshake when `target.secure` is set.
pub async fn establish_connection(target: &ConnectTarget) -> std::io::Result<EstablishedConnection> {
    let addr = target.host_port();
    tracing::debug!("Resolving {addr}...");
    let tcp = TcpStream::connect(&addr).await?;

    if !target.secure {
        tracing::debug!("TCP connected to {addr} (plain)");
        return Ok(EstablishedConnection::Plain(tcp));
    }

    let tls_config = if target.tls_insecure {
        tracing::warn!("TLS: certificate verification disabled");
        rustls_insecure_config()
    } else {
        rustls_default_config()
    };
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls::pki_types::ServerName::try_from(target.address.clone())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let tls = connector.connect(server_name, tcp).await?;
    tracing::debug!("TLS handshake with {addr} complete");
    Ok(EstablishedConnection::Tls(tls))
}

fn install_crypto_provider() {
    #[cfg(feature = "ring")]
    {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    #[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
    {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }
}

fn rustls_default_config() -> rustls::ClientConfig {
    install_crypto_provider();
    let roots = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

fn rustls_insecure_config() -> rustls::ClientConfig {
    install_crypto_provider();
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|p| p.signature_verification_algorithms.supported_schemes())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct PendingJoin {
    topic: Option<String>,
    channel_type: Option<ChannelType>,
}

/// What to do in response to one server line.
#[derive(Debug, Default, PartialEq, Eq)]
struct Reaction {
    events: Vec<TransportEvent>,
    replies: Vec<String>,
    /// Registration cannot proceed; end the session with this reason.
    give_up: Option<String>,
}

/// Tracks the handful of replies the lifecycle cares about.
#[derive(Debug)]
struct ReplyTracker {
    base_nick: String,
    nick: String,
    registered: bool,
    nick_tries: u32,
    joining: HashMap<String, PendingJoin>,
}

impl ReplyTracker {
    fn new(identity: &Identity) -> Self {
        Self {
            base_nick: identity.nick_name.clone(),
            nick: identity.nick_name.clone(),
            registered: false,
            nick_tries: 0,
            joining: HashMap::new(),
        }
    }

    /// Nicks compare case-insensitively.
    fn is_own(&self, line: &Line) -> bool {
        line.source_nick().is_some_and(|nick| nick.eq_ignore_ascii_case(&self.nick))
    }

    fn handle(&mut self, line: &Line) -> Reaction {
        let mut out = Reaction::default();
        match line.command.as_str() {
            "PING" => {
                let token = line.param(0).unwrap_or("");
                out.replies.push(format!("PONG :{token}"));
            }
            // RPL_WELCOME
            "001" => {
                if let Some(nick) = line.param(0) {
                    self.nick = nick.to_string();
                }
                if !self.registered {
                    self.registered = true;
                    out.events.push(TransportEvent::Registered { nick: self.nick.clone() });
                }
            }
            // RPL_ISUPPORT
            "005" => out.events.push(TransportEvent::ServerSupportedFeaturesReceived),
            // RPL_LUSERME closes the LUSERS block
            "255" => out.events.push(TransportEvent::NetworkInformationReceived),
            // RPL_ENDOFMOTD / ERR_NOMOTD
            "376" | "422" => out.events.push(TransportEvent::MotdReceived),
            // ERR_NICKNAMEINUSE
            "433" if !self.registered => {
                self.nick_tries += 1;
                if self.nick_tries <= MAX_NICK_RETRIES {
                    self.nick = format!("{}{}", self.base_nick, self.nick_tries);
                    out.replies.push(format!("NICK {}", self.nick));
                } else {
                    out.give_up = Some("nickname in use".to_string());
                }
            }
            "NICK" => {
                if self.is_own(line)
                    && let Some(new_nick) = line.param(0)
                {
                    self.nick = new_nick.to_string();
                }
            }
            "JOIN" => {
                if self.is_own(line)
                    && let Some(channel) = line.param(0)
                {
                    self.joining.insert(channel.to_ascii_lowercase(), PendingJoin::default());
                }
            }
            // RPL_TOPIC
            "332" => {
                if let (Some(channel), Some(topic)) = (line.param(1), line.param(2))
                    && let Some(pending) = self.joining.get_mut(&channel.to_ascii_lowercase())
                {
                    pending.topic = Some(topic.to_string());
                }
            }
            // RPL_NAMREPLY
            "353" => {
                if let (Some(symbol), Some(channel)) = (line.param(1), line.param(2))
                    && let Some(pending) = self.joining.get_mut(&channel.to_ascii_lowercase())
                {
                    pending.channel_type.get_or_insert(ChannelType::from_symbol(symbol));
                }
            }
            // RPL_ENDOFNAMES
            "366" => {
                if let Some(channel) = line.param(1)
                    && let Some(pending) = self.joining.remove(&channel.to_ascii_lowercase())
                {
                    out.events.push(TransportEvent::ChannelJoined {
                        channel: channel.to_string(),
                        topic: pending.topic,
                        channel_type: pending.channel_type.unwrap_or(ChannelType::Unknown),
                    });
                }
            }
            "ERROR" => {
                tracing::debug!(reason = line.param(0).unwrap_or(""), "Server closing link");
            }
            _ => {}
        }
        out
    }
}

async fn write_line<W>(writer: &mut W, line: &str, events: &mpsc::Sender<TransportEvent>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    writer.flush().await?;
    let logged = if line.starts_with("PASS ") { "PASS ****".to_string() } else { line.to_string() };
    let _ = events.send(TransportEvent::RawMessageSent(logged)).await;
    Ok(())
}

fn registration_lines(identity: &Identity) -> Vec<String> {
    let mut lines = Vec::with_capacity(3);
    if let Some(password) = &identity.password {
        lines.push(format!("PASS {password}"));
    }
    lines.push(format!("NICK {}", identity.nick_name));
    lines.push(format!("USER {} 0 * :{}", identity.user_name, identity.real_name));
    lines
}

async fn run_session<R, W>(
    mut reader: R,
    mut writer: W,
    identity: &Identity,
    events: &mpsc::Sender<TransportEvent>,
    mut lines: mpsc::Receiver<String>,
) -> std::io::Result<()>
where
    R: tokio::io::AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for line in registration_lines(identity) {
        write_line(&mut writer, &line, events).await?;
    }

    let mut tracker = ReplyTracker::new(identity);
    // Bytes survive a cancelled read_until, so a partial line is kept when
    // the write branch wins the select.
    let mut line_buf = Vec::new();

    loop {
        tokio::select! {
            result = reader.read_until(b'\n', &mut line_buf) => {
                if result? == 0 {
                    let _ = events
                        .send(TransportEvent::Disconnected { reason: "connection closed by server".to_string() })
                        .await;
                    return Ok(());
                }

                if line_buf.last() != Some(&b'\n') {
                    // EOF in the middle of a line; the next read reports it.
                    continue;
                }
                let raw = String::from_utf8_lossy(&line_buf).trim_end().to_string();
                line_buf.clear();
                let _ = events.send(TransportEvent::RawMessageReceived(raw.clone())).await;

                let Some(line) = Line::parse(&raw) else {
                    continue;
                };
                let reaction = tracker.handle(&line);
                for reply in &reaction.replies {
                    write_line(&mut writer, reply, events).await?;
                }
                for event in reaction.events {
                    let _ = events.send(event).await;
                }
                if let Some(reason) = reaction.give_up {
                    let _ = events.send(TransportEvent::Disconnected { reason }).await;
                    return Ok(());
                }
            }
            queued = lines.recv() => {
                match queued {
                    Some(line) => write_line(&mut writer, &line, events).await?,
                    // The transport handle is gone; nobody is listening.
                    None => return Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    fn identity(password: Option<&str>) -> Identity {
        Identity {
            user_name: "bot".into(),
            nick_name: "bot1".into(),
            real_name: "Bot One".into(),
            password: password.map(str::to_string),
        }
    }

    fn feed(tracker: &mut ReplyTracker, raw: &str) -> Reaction {
        tracker.handle(&Line::parse(raw).unwrap())
    }

    #[test]
    fn password_is_sent_before_nick_and_user() {
        assert_eq!(
            registration_lines(&identity(Some("hunter2"))),
            vec!["PASS hunter2", "NICK bot1", "USER bot 0 * :Bot One"]
        );
        assert_eq!(registration_lines(&identity(None)), vec!["NICK bot1", "USER bot 0 * :Bot One"]);
    }

    #[test]
    fn welcome_registers_once() {
        let mut tracker = ReplyTracker::new(&identity(None));
        let first = feed(&mut tracker, ":srv 001 bot1 :Welcome");
        assert_eq!(first.events, vec![TransportEvent::Registered { nick: "bot1".into() }]);
        assert!(feed(&mut tracker, ":srv 001 bot1 :Welcome").events.is_empty());
    }

    #[test]
    fn informational_numerics_map_to_events() {
        let mut tracker = ReplyTracker::new(&identity(None));
        let cases = [
            (":srv 005 bot1 CHANTYPES=# :are supported", TransportEvent::ServerSupportedFeaturesReceived),
            (":srv 255 bot1 :I have 3 clients", TransportEvent::NetworkInformationReceived),
            (":srv 376 bot1 :End of MOTD", TransportEvent::MotdReceived),
            (":srv 422 bot1 :MOTD File is missing", TransportEvent::MotdReceived),
        ];
        for (raw, expected) in cases {
            assert_eq!(feed(&mut tracker, raw).events, vec![expected], "{raw}");
        }
    }

    #[test]
    fn join_is_reported_after_end_of_names() {
        let mut tracker = ReplyTracker::new(&identity(None));
        feed(&mut tracker, ":srv 001 bot1 :Welcome");
        assert!(feed(&mut tracker, ":bot1!bot@host JOIN #General").events.is_empty());
        feed(&mut tracker, ":srv 332 bot1 #general :Be nice");
        feed(&mut tracker, ":srv 353 bot1 @ #general :bot1 alice");
        let done = feed(&mut tracker, ":srv 366 bot1 #general :End of /NAMES list");
        assert_eq!(
            done.events,
            vec![TransportEvent::ChannelJoined {
                channel: "#general".into(),
                topic: Some("Be nice".into()),
                channel_type: ChannelType::Secret,
            }]
        );
    }

    #[test]
    fn other_users_joining_are_ignored() {
        let mut tracker = ReplyTracker::new(&identity(None));
        feed(&mut tracker, ":alice!a@host JOIN #general");
        assert!(feed(&mut tracker, ":srv 366 bot1 #general :End").events.is_empty());
    }

    #[test]
    fn nick_collision_retries_then_gives_up() {
        let mut tracker = ReplyTracker::new(&identity(None));
        for n in 1..=MAX_NICK_RETRIES {
            let r = feed(&mut tracker, ":srv 433 * bot1 :Nickname is already in use");
            assert_eq!(r.replies, vec![format!("NICK bot1{n}")]);
        }
        let r = feed(&mut tracker, ":srv 433 * bot15 :Nickname is already in use");
        assert_eq!(r.give_up.as_deref(), Some("nickname in use"));
    }

    #[test]
    fn ping_is_answered() {
        let mut tracker = ReplyTracker::new(&identity(None));
        assert_eq!(feed(&mut tracker, "PING :abc").replies, vec!["PONG :abc"]);
    }

    #[test]
    fn own_join_matches_nick_case_insensitively() {
        let mut tracker = ReplyTracker::new(&identity(None));
        feed(&mut tracker, ":srv 001 bot1 :Welcome");
        feed(&mut tracker, ":BOT1!bot@host JOIN #general");
        let done = feed(&mut tracker, ":srv 366 bot1 #general :End of /NAMES list");
        assert_eq!(done.events.len(), 1);
    }

    /// Collect events until one matches `pred`, or give up after a second.
    async fn events_until(
        rx: &mut mpsc::Receiver<TransportEvent>,
        pred: impl Fn(&TransportEvent) -> bool,
    ) -> (Vec<TransportEvent>, bool) {
        let mut seen = Vec::new();
        let found = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while let Some(event) = rx.recv().await {
                let hit = pred(&event);
                seen.push(event);
                if hit {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        (seen, found)
    }

    #[tokio::test]
    async fn partial_line_survives_a_queued_write() {
        let (client, mut server) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (lines_tx, lines_rx) = mpsc::channel(8);
        let _session = tokio::spawn(async move {
            let id = identity(None);
            run_session(BufReader::new(reader), writer, &id, &events_tx, lines_rx).await
        });

        let (_, ready) = events_until(&mut events_rx, |e| {
            *e == TransportEvent::RawMessageSent("USER bot 0 * :Bot One".into())
        })
        .await;
        assert!(ready);

        server.write_all(b":srv 001 bo").await.unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        lines_tx.send("PRIVMSG x :hi".to_string()).await.unwrap();
        let (_, written) =
            events_until(&mut events_rx, |e| *e == TransportEvent::RawMessageSent("PRIVMSG x :hi".into())).await;
        assert!(written);

        server.write_all(b"t1 :Welcome\r\n").await.unwrap();
        let (seen, registered) =
            events_until(&mut events_rx, |e| matches!(e, TransportEvent::Registered { .. })).await;
        assert!(registered, "welcome lost: {seen:?}");
        assert!(seen.contains(&TransportEvent::RawMessageReceived(":srv 001 bot1 :Welcome".into())));
    }

    #[tokio::test]
    async fn invalid_utf8_is_decoded_lossily_and_reading_continues() {
        let (client, mut server) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (_lines_tx, lines_rx) = mpsc::channel::<String>(8);
        let session = tokio::spawn(async move {
            let id = identity(None);
            run_session(BufReader::new(reader), writer, &id, &events_tx, lines_rx).await
        });

        server
            .write_all(b":srv 001 bot1 :Welcome\r\n:alice!a@h PRIVMSG #x :caf\xe9\r\n:srv 376 bot1 :End\r\n")
            .await
            .unwrap();
        let (seen, motd) = events_until(&mut events_rx, |e| *e == TransportEvent::MotdReceived).await;
        assert!(motd, "reading stopped: {seen:?}");
        assert!(seen.contains(&TransportEvent::RawMessageReceived(":alice!a@h PRIVMSG #x :caf\u{fffd}".into())));
        assert!(!session.is_finished());
    }

    #[tokio::test]
    async fn refused_connection_reports_connect_failed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = ConnectTarget {
            address: "127.0.0.1".into(),
            port,
            secure: false,
            tls_insecure: false,
        };
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let mut transport = IrcTransport::new();
        transport.connect(&target, &identity(None), events_tx).unwrap();

        let (seen, failed) =
            events_until(&mut events_rx, |e| matches!(e, TransportEvent::ConnectFailed { .. })).await;
        assert!(failed, "{seen:?}");
        assert!(!seen.contains(&TransportEvent::Connected));
        transport.disconnect();
    }

    #[tokio::test]
    async fn session_registers_writes_queued_lines_and_reports_close() {
        let (client, mut server) = duplex(4096);
        let (reader, writer) = tokio::io::split(client);
        let (events_tx, mut events_rx) = mpsc::channel(64);
        let (lines_tx, lines_rx) = mpsc::channel(8);

        let session = tokio::spawn(async move {
            let id = identity(None);
            run_session(BufReader::new(reader), writer, &id, &events_tx, lines_rx).await
        });

        server.write_all(b":srv 001 bot1 :Welcome\r\n").await.unwrap();
        lines_tx.send("JOIN #general".to_string()).await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 5 {
            seen.push(events_rx.recv().await.unwrap());
        }
        assert!(seen.contains(&TransportEvent::Registered { nick: "bot1".into() }));
        assert!(seen.contains(&TransportEvent::RawMessageSent("JOIN #general".into())));
        assert!(seen.contains(&TransportEvent::RawMessageReceived(":srv 001 bot1 :Welcome".into())));

        server.shutdown().await.unwrap();
        let mut written = String::new();
        server.read_to_string(&mut written).await.unwrap();
        assert!(written.starts_with("NICK bot1\r\nUSER bot 0 * :Bot One\r\n"));
        assert!(written.contains("JOIN #general\r\n"));
        drop(server);

        session.await.unwrap().unwrap();
        let mut last = None;
        while let Ok(event) = events_rx.try_recv() {
            last = Some(event);
        }
        assert!(matches!(last, Some(TransportEvent::Disconnected { .. })));
    }
}
