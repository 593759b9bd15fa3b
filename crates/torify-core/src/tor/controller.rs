//! Tor ControlPort client implementation.
//!
//! Speaks the control protocol (control-spec.txt) over any byte stream.
//! A reader task splits incoming replies into asynchronous events (status
//! 650) and answers to commands; commands are written one at a time and each
//! waits for its own answer.

use super::events::EventDispatcher;
use super::service::{validate_service_id, HiddenServiceRecord, PrivateKey};
use super::{BOOTSTRAP_POLL_INTERVAL, COOKIE_MIN_LEN, COOKIE_POLL_INTERVAL, EVENTS, EVENT_QUEUE_LEN, LOCALHOST};
use crate::error::{Error, Result};
use crate::logging::{redact_command, RedactedBytes};
use crate::shutdown::ShutdownSignal;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

/// Status code of asynchronous event replies.
const EVENT_CODE: u16 = 650;

/// Bound on each command sent while shutting down.
const SHUTDOWN_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// One complete control protocol reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Status code shared by all lines of the reply.
    pub code: u16,
    /// Line contents without the status prefix. A data block is appended to
    /// the line that introduced it, its lines joined with `\n`.
    pub lines: Vec<String>,
}

impl Reply {
    /// Whether this reply is an asynchronous event.
    pub fn is_event(&self) -> bool {
        self.code == EVENT_CODE
    }

    /// Text of the final line.
    pub fn message(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or_default()
    }

    /// Value of the first `key=value` line.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }
}

/// Read one reply. `Ok(None)` on a clean end of stream.
async fn read_reply<R>(reader: &mut R) -> Result<Option<Reply>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut lines = Vec::new();
    loop {
        let Some(line) = read_line(reader).await? else {
            return Ok(None);
        };
        if line.is_empty() {
            continue;
        }

        let (code, separator, text) = split_status_line(&line)?;
        match separator {
            ' ' => {
                lines.push(text.to_string());
                return Ok(Some(Reply { code, lines }));
            }
            '-' => lines.push(text.to_string()),
            '+' => {
                let mut data = Vec::new();
                loop {
                    let Some(data_line) = read_line(reader).await? else {
                        return Ok(None);
                    };
                    if data_line == "." {
                        break;
                    }
                    // Dot-unstuffing
                    let data_line = data_line.strip_prefix('.').unwrap_or(&data_line).to_string();
                    data.push(data_line);
                }
                lines.push(format!("{}{}", text, data.join("\n")));
            }
            other => {
                return Err(Error::Protocol(format!("unexpected separator {:?}", other)));
            }
        }
    }
}

async fn read_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(&['\r', '\n'][..]).to_string()))
}

fn split_status_line(line: &str) -> Result<(u16, char, &str)> {
    let code = line
        .get(..3)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| Error::Protocol(format!("malformed reply line: {:?}", line)))?;
    let mut rest = line[3..].chars();
    // A bare "250" is a final line with no text.
    let separator = rest.next().unwrap_or(' ');
    Ok((code, separator, rest.as_str()))
}

/// Lifecycle of a control session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No transport yet.
    Disconnected,
    /// Transport open, not authenticated.
    Connecting,
    /// Cookie accepted.
    Authenticated,
    /// Event subscription active.
    EventsSubscribed,
    /// `DisableNetwork=0` applied.
    NetworkEnabled,
    /// Polling bootstrap progress.
    BootstrapInProgress,
    /// Bootstrap reached 100%.
    Ready,
    /// A step failed; the session is unusable.
    Failed(String),
    /// Shut down.
    Closed,
}

impl SessionState {
    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed(_) | SessionState::Closed)
    }
}

/// Write half plus the queue of command answers.
struct CommandChannel {
    writer: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    replies: mpsc::UnboundedReceiver<Reply>,
    /// A command was written but its answer never consumed.
    awaiting_reply: bool,
}

/// Authenticated control connection owning a tor daemon.
pub struct TorController {
    channel: Mutex<CommandChannel>,
    events: std::sync::Mutex<Option<mpsc::Receiver<Reply>>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    state: watch::Sender<SessionState>,
    authenticated: AtomicBool,
    shutting_down: AtomicBool,
    shutdown: ShutdownSignal,
}

impl std::fmt::Debug for TorController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TorController")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl TorController {
    /// Connect to the control port on localhost and run the session
    /// handshake.
    pub async fn connect(port: u16, cookie: &[u8], shutdown: ShutdownSignal) -> Result<Self> {
        shutdown.check()?;
        let stream = TcpStream::connect((LOCALHOST, port)).await?;
        tracing::debug!(port, "Connected to tor control port");
        Self::open(stream, cookie, shutdown).await
    }

    /// Run the session handshake over an already connected transport:
    /// authenticate, subscribe to events, take ownership of the daemon and
    /// enable networking.
    pub async fn open<S>(stream: S, cookie: &[u8], shutdown: ShutdownSignal) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_LEN);
        let reader = tokio::spawn(read_loop(BufReader::new(read_half), replies_tx, events_tx));

        let (state, _) = watch::channel(SessionState::Connecting);
        let controller = Self {
            channel: Mutex::new(CommandChannel {
                writer: Some(Box::new(write_half)),
                replies: replies_rx,
                awaiting_reply: false,
            }),
            events: std::sync::Mutex::new(Some(events_rx)),
            reader: std::sync::Mutex::new(Some(reader)),
            state,
            authenticated: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            shutdown,
        };

        if let Err(e) = controller.handshake(cookie).await {
            controller.set_state(SessionState::Failed(e.to_string()));
            controller.release().await;
            return Err(e);
        }
        Ok(controller)
    }

    async fn handshake(&self, cookie: &[u8]) -> Result<()> {
        self.shutdown.check()?;
        self.authenticate(cookie).await?;

        self.shutdown.check()?;
        self.command(&format!("SETEVENTS {}", EVENTS.join(" "))).await?;
        self.set_state(SessionState::EventsSubscribed);

        // Tie the daemon's lifetime to this connection instead of our pid.
        self.shutdown.check()?;
        self.command("TAKEOWNERSHIP").await?;
        self.shutdown.check()?;
        self.command("RESETCONF __OwningControllerProcess").await?;

        self.shutdown.check()?;
        self.command("SETCONF DisableNetwork=0").await?;
        self.set_state(SessionState::NetworkEnabled);
        tracing::info!("Tor control session established");
        Ok(())
    }

    async fn authenticate(&self, cookie: &[u8]) -> Result<()> {
        tracing::debug!(cookie = %RedactedBytes(cookie), "Authenticating with tor control port");
        let cmd = Zeroizing::new(format!("AUTHENTICATE {}", hex::encode(cookie)));
        match self.send(&cmd).await {
            Ok(_) => {}
            Err(Error::Command { code, message }) => {
                return Err(Error::Authentication(format!("{} {}", code, message)));
            }
            Err(e) => return Err(Error::Authentication(e.to_string())),
        }
        self.authenticated.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Authenticated);
        tracing::info!("Authenticated with tor control port");
        Ok(())
    }

    /// Send a command and wait for its reply. Error replies (4xx/5xx) become
    /// [`Error::Command`].
    pub async fn command(&self, cmd: &str) -> Result<Reply> {
        if !self.authenticated.load(Ordering::SeqCst) {
            return Err(Error::NotAuthenticated);
        }
        self.send(cmd).await
    }

    async fn send(&self, cmd: &str) -> Result<Reply> {
        let mut channel = self.channel.lock().await;

        if channel.awaiting_reply {
            // A previous caller gave up on its answer; discard it.
            channel.replies.recv().await.ok_or(Error::ControlClosed)?;
            channel.awaiting_reply = false;
        }

        let writer = channel.writer.as_mut().ok_or(Error::ControlClosed)?;
        tracing::debug!(command = %redact_command(cmd), "Sending control command");
        let line = Zeroizing::new(format!("{}\r\n", cmd));
        writer.write_all(line.as_bytes()).await.map_err(|_| Error::ControlClosed)?;
        writer.flush().await.map_err(|_| Error::ControlClosed)?;

        channel.awaiting_reply = true;
        let reply = channel.replies.recv().await.ok_or(Error::ControlClosed)?;
        channel.awaiting_reply = false;

        if reply.code >= 400 {
            return Err(Error::Command {
                code: reply.code,
                message: reply.message().to_string(),
            });
        }
        Ok(reply)
    }

    /// `GETINFO <key>` value.
    pub async fn get_info(&self, key: &str) -> Result<String> {
        let reply = self.command(&format!("GETINFO {}", key)).await?;
        reply
            .value(key)
            .map(str::to_string)
            .ok_or_else(|| Error::Protocol(format!("GETINFO reply without {}", key)))
    }

    /// Current bootstrap phase line, e.g.
    /// `NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY="Done"`.
    pub async fn bootstrap_status(&self) -> Result<String> {
        self.get_info("status/bootstrap-phase").await
    }

    /// Poll bootstrap progress until it reaches 100%.
    ///
    /// `timeout` of `None` waits until shutdown is requested.
    pub async fn wait_bootstrapped(&self, timeout: Option<Duration>) -> Result<()> {
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.poll_bootstrap())
                .await
                .unwrap_or(Err(Error::BootstrapTimeout)),
            None => self.poll_bootstrap().await,
        };
        if let Err(e) = &result {
            if !e.is_cancellation() {
                self.set_state(SessionState::Failed(e.to_string()));
            }
        }
        result
    }

    async fn poll_bootstrap(&self) -> Result<()> {
        loop {
            self.shutdown.check()?;
            let status = self.bootstrap_status().await?;
            if status.contains("PROGRESS=100") {
                self.set_state(SessionState::Ready);
                tracing::info!("Tor bootstrap complete");
                return Ok(());
            }

            self.set_state(SessionState::BootstrapInProgress);
            tracing::debug!(status = %status, "Tor bootstrapping");
            tokio::select! {
                _ = tokio::time::sleep(BOOTSTRAP_POLL_INTERVAL) => {}
                _ = self.shutdown.requested() => return Err(Error::Cancelled),
            }
        }
    }

    /// Port of the daemon's first SOCKS listener.
    pub async fn socks_port(&self) -> Result<u16> {
        let listeners = self.get_info("net/listeners/socks").await?;
        parse_socks_port(&listeners)
    }

    /// Create an onion service with a freshly generated key.
    pub async fn create_hidden_service(
        &self,
        virtual_port: u16,
        local_port: u16,
    ) -> Result<HiddenServiceRecord> {
        let reply = self
            .command(&add_onion_command("NEW:ED25519-V3", virtual_port, local_port))
            .await?;
        let service_id = parse_service_id(&reply)?;
        let private_key = reply
            .value("PrivateKey")
            .ok_or_else(|| Error::Protocol("ADD_ONION reply without PrivateKey".into()))
            .and_then(PrivateKey::parse)?;
        Ok(HiddenServiceRecord::new(service_id, virtual_port, local_port, private_key))
    }

    /// Create an onion service from an existing key.
    pub async fn create_hidden_service_with_key(
        &self,
        virtual_port: u16,
        local_port: u16,
        private_key: &PrivateKey,
    ) -> Result<HiddenServiceRecord> {
        let reply = self
            .command(&add_onion_command(private_key.expose(), virtual_port, local_port))
            .await?;
        let service_id = parse_service_id(&reply)?;
        Ok(HiddenServiceRecord::new(service_id, virtual_port, local_port, private_key.clone()))
    }

    /// Remove an onion service created on this connection.
    pub async fn destroy_hidden_service(&self, service_id: &str) -> Result<()> {
        self.command(&format!("DEL_ONION {}", service_id)).await?;
        Ok(())
    }

    /// Start delivering events to `dispatcher`. Only one handler can be set.
    pub fn set_event_handler(&self, dispatcher: EventDispatcher) -> Result<JoinHandle<()>> {
        let events = self
            .events
            .lock()
            .map_err(|_| Error::Protocol("event queue lock poisoned".into()))?
            .take()
            .ok_or_else(|| Error::Protocol("event handler already set".into()))?;
        Ok(tokio::spawn(dispatcher.run(events)))
    }

    /// Disable networking, ask the daemon to exit, and close the connection.
    ///
    /// Idempotent. Command failures are logged; the transport is released
    /// regardless.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.authenticated.load(Ordering::SeqCst) && !self.is_closed() {
            for cmd in ["SETCONF DisableNetwork=1", "SIGNAL TERM"] {
                match tokio::time::timeout(SHUTDOWN_COMMAND_TIMEOUT, self.command(cmd)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!(command = cmd, error = %e, "Shutdown command failed"),
                    Err(_) => tracing::warn!(command = cmd, "Shutdown command timed out"),
                }
            }
        }

        self.release().await;
        self.set_state(SessionState::Closed);
        tracing::info!("Tor control session closed");
    }

    /// Close the transport and stop the reader task.
    async fn release(&self) {
        let mut channel = self.channel.lock().await;
        if let Some(mut writer) = channel.writer.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "Control transport shutdown failed");
            }
        }
        drop(channel);

        if let Ok(mut reader) = self.reader.lock() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }

    /// Whether the connection can no longer carry commands.
    pub fn is_closed(&self) -> bool {
        self.reader
            .lock()
            .map(|reader| reader.as_ref().map_or(true, JoinHandle::is_finished))
            .unwrap_or(true)
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch session state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Shutdown signal this session observes.
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            let blocked = match state {
                SessionState::Closed => true,
                SessionState::Failed(_) => next != SessionState::Closed,
                _ => false,
            };
            if blocked || *state == next {
                return false;
            }
            tracing::trace!(from = ?state, to = ?next, "Session state change");
            *state = next;
            true
        });
    }
}

impl Drop for TorController {
    fn drop(&mut self) {
        if let Ok(reader) = self.reader.get_mut() {
            if let Some(handle) = reader.take() {
                handle.abort();
            }
        }
    }
}

async fn read_loop<R>(
    mut reader: BufReader<R>,
    replies: mpsc::UnboundedSender<Reply>,
    events: mpsc::Sender<Reply>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match read_reply(&mut reader).await {
            Ok(Some(reply)) if reply.is_event() => match events.try_send(reply) {
                Ok(()) => {}
                // No handler draining the queue yet.
                Err(TrySendError::Full(reply)) => {
                    tracing::trace!(event = %reply.message(), "Event queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {}
            },
            Ok(Some(reply)) => {
                if replies.send(reply).is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!("Control connection closed by tor");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Control connection failed");
                break;
            }
        }
    }
}

fn add_onion_command(key: &str, virtual_port: u16, local_port: u16) -> String {
    format!("ADD_ONION {} Port={},{}:{}", key, virtual_port, LOCALHOST, local_port)
}

fn parse_service_id(reply: &Reply) -> Result<String> {
    let service_id = reply
        .value("ServiceID")
        .ok_or_else(|| Error::Protocol("ADD_ONION reply without ServiceID".into()))?;
    validate_service_id(service_id)?;
    Ok(service_id.to_string())
}

/// First listener port from a `net/listeners/socks` value such as
/// `"127.0.0.1:9050" "[::1]:9050"`.
pub(crate) fn parse_socks_port(listeners: &str) -> Result<u16> {
    let first = listeners
        .split_whitespace()
        .map(|listener| listener.trim_matches('"'))
        .find(|listener| !listener.is_empty())
        .ok_or(Error::NoSocksListener)?;
    first
        .rsplit(':')
        .next()
        .and_then(|port| port.parse().ok())
        .ok_or_else(|| Error::Protocol(format!("unparseable socks listener {:?}", first)))
}

/// Wait until the daemon has written a complete auth cookie, then read it.
pub async fn wait_for_cookie(
    path: &Path,
    timeout: Duration,
    shutdown: &ShutdownSignal,
) -> Result<Zeroizing<Vec<u8>>> {
    let poll = async {
        loop {
            shutdown.check()?;
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.len() >= COOKIE_MIN_LEN => break,
                _ => {}
            }
            tokio::select! {
                _ = tokio::time::sleep(COOKIE_POLL_INTERVAL) => {}
                _ = shutdown.requested() => return Err(Error::Cancelled),
            }
        }
        Ok::<(), Error>(())
    };
    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| Error::CookieTimeout)??;

    let cookie = tokio::fs::read(path)
        .await
        .map_err(|e| Error::persistence(path, e))?;
    tracing::debug!(cookie = %RedactedBytes(&cookie), "Auth cookie ready");
    Ok(Zeroizing::new(cookie))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    const COOKIE: [u8; 32] = [0xab; 32];

    async fn parse(input: &str) -> Result<Option<Reply>> {
        let mut reader = BufReader::new(input.as_bytes());
        read_reply(&mut reader).await
    }

    #[tokio::test]
    async fn test_parse_single_line() {
        let reply = parse("250 OK\r\n").await.unwrap().unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines, vec!["OK"]);
        assert_eq!(reply.message(), "OK");
    }

    #[tokio::test]
    async fn test_parse_mid_lines() {
        let reply = parse("250-ServiceID=abc\r\n250-PrivateKey=ED25519-V3:a2V5\r\n250 OK\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.value("ServiceID"), Some("abc"));
        assert_eq!(reply.value("PrivateKey"), Some("ED25519-V3:a2V5"));
        assert_eq!(reply.value("Missing"), None);
    }

    #[tokio::test]
    async fn test_parse_data_block() {
        let reply = parse("250+config-text=\r\nSocksPort auto\r\n..hidden\r\n.\r\n250 OK\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.value("config-text"), Some("SocksPort auto\n.hidden"));
    }

    #[tokio::test]
    async fn test_parse_eof_and_garbage() {
        assert!(parse("").await.unwrap().is_none());
        assert!(parse("250-partial\r\n").await.unwrap().is_none());
        assert!(matches!(parse("hello\r\n").await, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_parse_socks_port() {
        assert_eq!(parse_socks_port("\"127.0.0.1:9050\"").unwrap(), 9050);
        assert_eq!(parse_socks_port("\"127.0.0.1:41000\" \"[::1]:41001\"").unwrap(), 41000);
        assert!(matches!(parse_socks_port(""), Err(Error::NoSocksListener)));
        assert!(matches!(parse_socks_port("\"\""), Err(Error::NoSocksListener)));
        assert!(matches!(parse_socks_port("\"127.0.0.1:x\""), Err(Error::Protocol(_))));
    }

    /// Answer each received command with the next scripted reply.
    fn scripted(
        server: DuplexStream,
        script: Vec<(&'static str, &'static str)>,
    ) -> JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let mut received = Vec::new();
            for (expected, reply) in script {
                let Ok(Some(line)) = lines.next_line().await else {
                    break;
                };
                assert!(line.starts_with(expected), "expected {:?}, got {:?}", expected, line);
                received.push(line);
                write.write_all(reply.as_bytes()).await.unwrap();
            }
            // Hold the connection open until the client hangs up.
            let mut rest = Vec::new();
            let _ = lines.get_mut().read_to_end(&mut rest).await;
            received
        })
    }

    fn shutdown_script() -> [(&'static str, &'static str); 2] {
        [
            ("SETCONF DisableNetwork=1", "250 OK\r\n"),
            ("SIGNAL TERM", "250 OK\r\n"),
        ]
    }

    fn handshake_script() -> Vec<(&'static str, &'static str)> {
        vec![
            ("AUTHENTICATE abab", "250 OK\r\n"),
            ("SETEVENTS CIRC WARN ERR HS_DESC STATUS_CLIENT", "250 OK\r\n"),
            ("TAKEOWNERSHIP", "250 OK\r\n"),
            ("RESETCONF __OwningControllerProcess", "250 OK\r\n"),
            ("SETCONF DisableNetwork=0", "250 OK\r\n"),
        ]
    }

    #[tokio::test]
    async fn test_handshake_sequence() {
        let (client, server) = tokio::io::duplex(4096);
        let mut script = handshake_script();
        script.extend(shutdown_script());
        let server = scripted(server, script);

        let controller = TorController::open(client, &COOKIE, ShutdownSignal::new())
            .await
            .unwrap();
        assert_eq!(controller.state(), SessionState::NetworkEnabled);

        controller.shutdown().await;
        assert_eq!(controller.state(), SessionState::Closed);
        let received = server.await.unwrap();
        assert_eq!(received.len(), 7);
        assert_eq!(received[6], "SIGNAL TERM");
    }

    #[tokio::test]
    async fn test_rejected_cookie() {
        let (client, server) = tokio::io::duplex(4096);
        let _server = scripted(
            server,
            vec![("AUTHENTICATE", "515 Authentication failed: Wrong length on authentication cookie.\r\n")],
        );

        let result = TorController::open(client, &COOKIE, ShutdownSignal::new()).await;
        assert!(matches!(result, Err(Error::Authentication(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_handshake() {
        let (client, _server) = tokio::io::duplex(4096);
        let shutdown = ShutdownSignal::new();
        shutdown.request();

        let result = TorController::open(client, &COOKIE, shutdown).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_bootstrapped_polls_until_done() {
        let (client, server) = tokio::io::duplex(4096);
        let mut script = handshake_script();
        script.extend([
            (
                "GETINFO status/bootstrap-phase",
                "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=50 TAG=loading_descriptors\r\n250 OK\r\n",
            ),
            (
                "GETINFO status/bootstrap-phase",
                "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=100 TAG=done SUMMARY=\"Done\"\r\n250 OK\r\n",
            ),
        ]);
        let server = scripted(server, script);

        let controller = TorController::open(client, &COOKIE, ShutdownSignal::new())
            .await
            .unwrap();
        let mut states = controller.subscribe_state();

        controller.wait_bootstrapped(Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(controller.state(), SessionState::Ready);
        assert!(states.has_changed().unwrap());

        drop(controller);
        assert_eq!(server.await.unwrap().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_bootstrapped_times_out() {
        let (client, server) = tokio::io::duplex(4096);
        let mut script = handshake_script();
        for _ in 0..10 {
            script.push((
                "GETINFO status/bootstrap-phase",
                "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=10 TAG=conn\r\n250 OK\r\n",
            ));
        }
        let _server = scripted(server, script);

        let controller = TorController::open(client, &COOKIE, ShutdownSignal::new())
            .await
            .unwrap();
        let result = controller.wait_bootstrapped(Some(Duration::from_secs(2))).await;
        assert!(matches!(result, Err(Error::BootstrapTimeout)));
        assert!(matches!(controller.state(), SessionState::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_bootstrapped_cancelled() {
        let (client, server) = tokio::io::duplex(4096);
        let mut script = handshake_script();
        for _ in 0..10 {
            script.push((
                "GETINFO status/bootstrap-phase",
                "250-status/bootstrap-phase=NOTICE BOOTSTRAP PROGRESS=10 TAG=conn\r\n250 OK\r\n",
            ));
        }
        let _server = scripted(server, script);
        let shutdown = ShutdownSignal::new();

        let controller = TorController::open(client, &COOKIE, shutdown.clone())
            .await
            .unwrap();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(700)).await;
            trigger.request();
        });

        let result = controller.wait_bootstrapped(None).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(controller.state(), SessionState::BootstrapInProgress);
    }

    #[tokio::test]
    async fn test_events_interleaved_with_replies() {
        let (client, server) = tokio::io::duplex(4096);
        let mut script = handshake_script();
        script.push((
            "GETINFO net/listeners/socks",
            "650 STATUS_CLIENT NOTICE CIRCUIT_ESTABLISHED\r\n\
             250-net/listeners/socks=\"127.0.0.1:9150\"\r\n250 OK\r\n",
        ));
        let _server = scripted(server, script);

        let controller = TorController::open(client, &COOKIE, ShutdownSignal::new())
            .await
            .unwrap();
        assert_eq!(controller.socks_port().await.unwrap(), 9150);

        let queued = controller.events.lock().unwrap().as_mut().unwrap().try_recv().unwrap();
        assert_eq!(queued.code, 650);
        assert!(queued.message().starts_with("STATUS_CLIENT"));
    }

    #[tokio::test]
    async fn test_unhandled_events_are_bounded() {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let mut burst: String = (0..EVENT_QUEUE_LEN + 50)
            .map(|i| format!("650 CIRC {} BUILT\r\n", i))
            .collect();
        burst.push_str("250-net/listeners/socks=\"127.0.0.1:9150\"\r\n250 OK\r\n");
        let burst: &'static str = Box::leak(burst.into_boxed_str());
        let mut script = handshake_script();
        script.push(("GETINFO net/listeners/socks", burst));
        let _server = scripted(server, script);

        let controller = TorController::open(client, &COOKIE, ShutdownSignal::new())
            .await
            .unwrap();
        assert_eq!(controller.socks_port().await.unwrap(), 9150);

        let mut guard = controller.events.lock().unwrap();
        let queue = guard.as_mut().unwrap();
        let mut queued = 0;
        while queue.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, EVENT_QUEUE_LEN);
    }

    #[tokio::test]
    async fn test_add_and_remove_onion() {
        const ID: &str = "pg6mmjiyjmcrsslvykfwnntlaru7p5svn6y2ymmju6nubxndf4pscryd";
        let (client, server) = tokio::io::duplex(4096);
        let mut script = handshake_script();
        script.extend([
            (
                "ADD_ONION NEW:ED25519-V3 Port=80,127.0.0.1:8080",
                "250-ServiceID=pg6mmjiyjmcrsslvykfwnntlaru7p5svn6y2ymmju6nubxndf4pscryd\r\n\
                 250-PrivateKey=ED25519-V3:c2VjcmV0\r\n250 OK\r\n",
            ),
            (
                "ADD_ONION ED25519-V3:c2VjcmV0 Port=80,127.0.0.1:8080",
                "250-ServiceID=pg6mmjiyjmcrsslvykfwnntlaru7p5svn6y2ymmju6nubxndf4pscryd\r\n250 OK\r\n",
            ),
            ("DEL_ONION pg6mm", "250 OK\r\n"),
            ("DEL_ONION pg6mm", "552 Unknown Onion Service id\r\n"),
        ]);
        let _server = scripted(server, script);

        let controller = TorController::open(client, &COOKIE, ShutdownSignal::new())
            .await
            .unwrap();

        let record = controller.create_hidden_service(80, 8080).await.unwrap();
        assert_eq!(record.service_id, ID);
        assert_eq!(record.private_key.expose(), "ED25519-V3:c2VjcmV0");

        let again = controller
            .create_hidden_service_with_key(80, 8080, &record.private_key)
            .await
            .unwrap();
        assert_eq!(again.service_id, ID);

        controller.destroy_hidden_service(ID).await.unwrap();
        let err = controller.destroy_hidden_service(ID).await.unwrap_err();
        assert!(matches!(err, Error::Command { code: 552, .. }));
    }

    #[tokio::test]
    async fn test_commands_after_close() {
        let (client, server) = tokio::io::duplex(4096);
        let mut script = handshake_script();
        script.extend(shutdown_script());
        let _server = scripted(server, script);
        let controller = TorController::open(client, &COOKIE, ShutdownSignal::new())
            .await
            .unwrap();

        controller.shutdown().await;
        controller.shutdown().await;
        assert!(matches!(controller.socks_port().await, Err(Error::ControlClosed)));
    }

    #[tokio::test]
    async fn test_connection_dropped_by_daemon() {
        let (client, server) = tokio::io::duplex(4096);
        let server = scripted(server, handshake_script());
        let controller = TorController::open(client, &COOKIE, ShutdownSignal::new())
            .await
            .unwrap();

        server.abort();
        assert!(matches!(controller.socks_port().await, Err(Error::ControlClosed)));
    }

    #[tokio::test]
    async fn test_second_event_handler_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let _server = scripted(server, handshake_script());
        let controller = TorController::open(client, &COOKIE, ShutdownSignal::new())
            .await
            .unwrap();

        assert!(controller.set_event_handler(EventDispatcher::new()).is_ok());
        assert!(controller.set_event_handler(EventDispatcher::new()).is_err());
    }

    #[tokio::test]
    async fn test_wait_for_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control_auth_cookie");
        let shutdown = ShutdownSignal::new();

        let writer_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            // A partially written cookie is not ready yet.
            tokio::fs::write(&writer_path, [1u8; 16]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            tokio::fs::write(&writer_path, [1u8; 32]).await.unwrap();
        });

        let cookie = wait_for_cookie(&path, Duration::from_secs(5), &shutdown).await.unwrap();
        assert_eq!(cookie.len(), 32);
    }

    #[tokio::test]
    async fn test_wait_for_cookie_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control_auth_cookie");
        let result = wait_for_cookie(&path, Duration::from_millis(200), &ShutdownSignal::new()).await;
        assert!(matches!(result, Err(Error::CookieTimeout)));
    }
}
