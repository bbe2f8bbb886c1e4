//! The proxy session: one client, one server, and the state that lets the
//! client leave.
//!
//! Each session runs in its own Tokio task.  The task owns every piece of
//! session state, so all events - client lines, server lines, timer
//! expiries, control messages, DCC notifications and shutdown - are
//! serialized through one `select!` loop and there is never concurrent
//! mutation.  Control messages arrive from the listener (attaching a
//! freshly authenticated client) and from the registry (reload rebinding,
//! KILL, NOTIFY).

pub mod admin;
pub mod client;
pub mod nick;
pub mod sendq;
pub mod server;
pub mod timers;

use std::collections::{BTreeSet, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::config::{ConnectionClass, ServerSpec};
use crate::listener::ClientStream;
use crate::logs::{EventFilter, LogEntry, LogEvent, LogFile};
use crate::registry::{Registry, SessionHandle};
use crate::{PACKAGE, VERSION};
use slbnc_proto::{irc_eq, sanitize_username, LineCodec, Message, Prefix, ProtocolError};

use self::sendq::SendQueue;
use self::timers::TimerSet;

/// Seconds between a rejected set-nickname and the next attempt to take
/// it back.
pub const NICK_GUARD_TIME: u64 = 60;

/// Control messages into a session's event loop.
pub enum Control {
    /// A freshly authenticated client to adopt.
    Attach(Box<ClientHandoff>),
    /// Configuration reloaded; here is the class with the same password.
    Rebind(Arc<ConnectionClass>),
    /// End the session (KILL, or the class vanished on reload).
    Terminate(String),
    /// Deliver a notice to the attached client.
    Notify(String),
}

/// Everything the pre-auth handshake learned about a client, handed to
/// the session that will own it.
pub struct ClientHandoff {
    /// The framed client stream (any buffered input included).
    pub framed: Framed<ClientStream, LineCodec>,
    /// Reverse-resolved client hostname (address form as fallback).
    pub host: String,
    /// Nickname from registration.
    pub nickname: String,
    /// Username from registration.
    pub username: String,
    /// Real name from registration.
    pub realname: String,
    /// User modes requested via the RFC 2812 USER mode bitmask.
    pub request_modes: Vec<char>,
}

/// Notifications from DCC proxy tasks back to their owning session.
#[derive(Debug)]
pub enum DccEvent {
    /// The proxy failed or timed out; relay a DCC REJECT if configured.
    Reject {
        /// Pre-formatted `:<who> NOTICE <whom> :\x01DCC REJECT cmd arg`
        /// line, without the closing delimiter.
        notice: String,
        /// Optional human-readable reason appended to the notice.
        reason: Option<String>,
        /// Whether the notice goes upstream (incoming offer) or to the
        /// client (outgoing offer).
        to_server: bool,
    },
}

/// Registration pieces and readiness of the client side.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientStatus {
    pub connected: bool,
    pub got_nick: bool,
    pub got_user: bool,
    pub authed: bool,
    pub sent_welcome: bool,
}

impl ClientStatus {
    /// Can we send traffic to the client?
    pub fn is_ready(&self) -> bool {
        self.connected && self.got_nick && self.got_user && self.authed
    }

    /// Fully registered, welcomed client.
    pub fn is_active(&self) -> bool {
        self.is_ready() && self.sent_welcome
    }
}

/// Connection stage of the server side.  Stages advance monotonically
/// within one connection attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerStatus {
    pub created: bool,
    pub connected: bool,
    pub introduced: bool,
    pub got_welcome: bool,
    /// Ever reached the welcome on this class (resets attempt counting).
    pub seen: bool,
}

impl ServerStatus {
    /// Can we send traffic to the server?
    pub fn is_ready(&self) -> bool {
        self.connected && self.introduced
    }

    /// All four stage bits set.
    pub fn is_active(&self) -> bool {
        self.created && self.connected && self.introduced && self.got_welcome
    }
}

/// A channel the session is (or believes it should be) on.
pub struct Channel {
    pub name: String,
    pub key: Option<String>,
    /// We think we belong here but the server disagrees; a rejoin timer
    /// is working on it.
    pub inactive: bool,
    /// We left as part of detaching and should rejoin on attach.
    pub unjoined: bool,
    pub log: LogFile,
}

/// A pending DCC SEND resume negotiation, keyed by `sourcenick:port`.
pub struct ResumeRequest {
    pub id: String,
    pub capfile: PathBuf,
    pub reject_notice: String,
    pub source_fullname: String,
    pub remote: SocketAddrV4,
    pub offset: u64,
}

pub(crate) struct ClientLink {
    pub framed: Framed<ClientStream, LineCodec>,
    pub out: VecDeque<String>,
}

pub(crate) struct ServerLink {
    pub framed: Framed<TcpStream, LineCodec>,
    pub q: SendQueue,
}

/// Result of a background connection attempt.
pub(crate) struct ConnectResult {
    stream: std::io::Result<TcpStream>,
    server_host: String,
    local_hostname: Option<String>,
}

type ConnectFuture = Pin<Box<dyn Future<Output = ConnectResult> + Send>>;

static TEMP_DIR_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Where a log entry is addressed.
#[derive(Clone, Copy)]
pub enum LogTarget<'a> {
    /// The server log.
    Server,
    /// Server log plus every channel log.
    All,
    /// A channel (or, failing that, the private log).
    Name(&'a str),
}

/// The per-client proxy session.
pub struct Session {
    pub(crate) registry: Arc<Registry>,
    pub(crate) class: Arc<ConnectionClass>,
    handle: SessionHandle,
    control_rx: mpsc::Receiver<Control>,

    pub(crate) client: Option<ClientLink>,
    pub(crate) server: Option<ServerLink>,
    connecting: Option<ConnectFuture>,

    pub(crate) timers: TimerSet,
    pub(crate) dcc_tx: mpsc::Sender<DccEvent>,
    dcc_rx: mpsc::Receiver<DccEvent>,

    pub(crate) servers: Vec<ServerSpec>,
    pub(crate) cursor: usize,
    attempts: u32,
    server_password: Option<String>,
    pub(crate) local_address: Option<String>,

    pub(crate) nickname: String,
    pub(crate) set_nickname: String,
    pub(crate) old_nickname: Option<String>,
    pub(crate) username: String,
    pub(crate) realname: String,
    pub(crate) hostname: Option<String>,
    pub(crate) client_host: Option<String>,
    pub(crate) modes: BTreeSet<char>,
    pub(crate) away: Option<String>,

    pub(crate) server_name: Option<String>,
    pub(crate) server_version: Option<String>,
    pub(crate) server_umodes: Option<String>,
    pub(crate) server_cmodes: Option<String>,
    pub(crate) server_supported: Vec<String>,

    pub(crate) cstat: ClientStatus,
    pub(crate) sstat: ServerStatus,

    pub(crate) allow_motd: bool,
    pub(crate) allow_pong: bool,
    pub(crate) squelch_411: bool,
    pub(crate) expecting_nick: bool,
    pub(crate) squelch_modes: Vec<String>,

    pub(crate) channels: Vec<Channel>,
    temp_dir: Option<PathBuf>,
    pub(crate) private_log: LogFile,
    pub(crate) server_log: LogFile,
    pub(crate) events: EventFilter,

    // Copies of the class strings the admin surface may change at runtime
    pub(crate) away_message_cfg: Option<String>,
    pub(crate) quit_message: Option<String>,
    pub(crate) attach_message: Option<String>,
    pub(crate) detach_message: Option<String>,
    pub(crate) detach_nickname: Option<String>,

    pub(crate) start_time: DateTime<Local>,
    pub(crate) die_on_close: bool,
    pub(crate) dead: bool,

    pub(crate) resume: Vec<ResumeRequest>,
}

enum Tick {
    Client(Option<Result<String, ProtocolError>>),
    Server(Option<Result<String, ProtocolError>>),
    Connected(ConnectResult),
    Control(Option<Control>),
    Timer(String),
    Dcc(Option<DccEvent>),
    Shutdown,
}

async fn next_line<S>(link: &mut Option<S>) -> Option<Result<String, ProtocolError>>
where
    S: StreamExt<Item = Result<String, ProtocolError>> + Unpin,
{
    match link {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn poll_connect(fut: &mut Option<ConnectFuture>) -> ConnectResult {
    match fut {
        Some(f) => f.as_mut().await,
        None => std::future::pending().await,
    }
}

impl Session {
    /// Build a session for a class that had none, adopt the client, and
    /// run it.  Returns the session task's join handle.
    pub fn launch(
        registry: Arc<Registry>,
        class: Arc<ConnectionClass>,
        handle: SessionHandle,
        control_rx: mpsc::Receiver<Control>,
        handoff: ClientHandoff,
        die_on_close: bool,
    ) -> tokio::task::JoinHandle<()> {
        let (dcc_tx, dcc_rx) = mpsc::channel(16);
        let servers = class.server_specs();
        let events = class.event_filter();

        let mut session = Session {
            handle,
            control_rx,
            client: Some(ClientLink {
                framed: handoff.framed,
                out: VecDeque::new(),
            }),
            server: None,
            connecting: None,
            timers: TimerSet::default(),
            dcc_tx,
            dcc_rx,
            servers,
            cursor: 0,
            attempts: 0,
            server_password: None,
            local_address: class.local_address.clone(),
            nickname: handoff.nickname.clone(),
            set_nickname: handoff.nickname,
            old_nickname: None,
            username: handoff.username,
            realname: handoff.realname,
            hostname: None,
            client_host: Some(handoff.host),
            modes: BTreeSet::new(),
            away: None,
            server_name: None,
            server_version: None,
            server_umodes: None,
            server_cmodes: None,
            server_supported: Vec::new(),
            cstat: ClientStatus {
                connected: true,
                got_nick: true,
                got_user: true,
                authed: true,
                sent_welcome: false,
            },
            sstat: ServerStatus::default(),
            allow_motd: false,
            allow_pong: false,
            squelch_411: false,
            expecting_nick: false,
            squelch_modes: Vec::new(),
            channels: Vec::new(),
            temp_dir: None,
            private_log: LogFile::default(),
            server_log: LogFile::default(),
            events,
            away_message_cfg: class.away_message.clone(),
            quit_message: class.quit_message.clone(),
            attach_message: class.attach_message.clone(),
            detach_message: class.detach_message.clone(),
            detach_nickname: class.detach_nickname.clone(),
            start_time: Local::now(),
            die_on_close: die_on_close || class.disconnect_on_detach,
            dead: false,
            resume: Vec::new(),
            registry,
            class,
        };

        session.first_auth(handoff.request_modes);
        tokio::spawn(session.run())
    }

    /// One-time setup when a class is bound for the first time: the log
    /// directory, the fixed logs, the initial channel list and modes.
    fn first_auth(&mut self, request_modes: Vec<char>) {
        let class = Arc::clone(&self.class);

        if class.chan_log_enabled || class.private_log_enabled || class.server_log_enabled {
            let dir = std::env::temp_dir().join(format!(
                "{}-{}-{}",
                PACKAGE,
                std::process::id(),
                TEMP_DIR_COUNTER.fetch_add(1, Ordering::Relaxed)
            ));
            match create_private_dir(&dir) {
                Ok(()) => self.temp_dir = Some(dir),
                Err(e) => {
                    warn!(error = %e, "Unable to create log directory, logging disabled");
                    self.send_notice(
                        "(warning) Unable to create log directory, logging disabled",
                    );
                }
            }
        }

        if let Some(dir) = self.temp_dir.clone() {
            self.private_log.init(
                &dir,
                "private",
                class.private_log_maxsize,
                class.private_log_always,
            );
            if class.private_log_enabled && class.private_log_always {
                if self.private_log.open().is_err() {
                    self.send_notice("(warning) Unable to log private messages");
                }
            }

            self.server_log.init(
                &dir,
                "server",
                class.server_log_maxsize,
                class.server_log_always,
            );
            if class.server_log_enabled && class.server_log_always {
                if self.server_log.open().is_err() {
                    self.send_notice("(warning) Unable to log server messages");
                }
            }
        }

        for entry in &class.join_channels {
            let (name, key) = match entry.split_once(' ') {
                Some((n, k)) => (n.to_owned(), Some(k.to_owned())),
                None => (entry.clone(), None),
            };
            self.add_channel(&name);
            if let Some(index) = self.channel_index(&name) {
                self.channels[index].inactive = true;
                self.channels[index].key = key;
            }
        }

        if let Some(initial) = class.initial_modes.clone() {
            self.apply_umode_change(&format!("+{}", initial));
        }
        for mode in request_modes {
            self.apply_umode_change(&format!("+{}", mode));
        }
    }

    /// The session event loop.
    pub(crate) async fn run(mut self) {
        info!(host = ?self.client_host, "Session started");
        self.update_info();
        self.ensure_server_connection();

        let mut shutdown = self.registry.subscribe_shutdown();
        loop {
            let (client_err, server_err) = self.flush().await;
            if server_err {
                self.server_error(true).await;
            }
            if client_err {
                self.client_gone(true).await;
            }
            if self.dead {
                break;
            }

            let tick = {
                let Session {
                    client,
                    server,
                    connecting,
                    control_rx,
                    timers,
                    dcc_rx,
                    ..
                } = &mut self;
                let mut client_framed = client.as_mut().map(|l| &mut l.framed);
                let mut server_framed = server.as_mut().map(|l| &mut l.framed);

                tokio::select! {
                    line = next_line(&mut client_framed) => Tick::Client(line),
                    line = next_line(&mut server_framed) => Tick::Server(line),
                    outcome = poll_connect(connecting) => Tick::Connected(outcome),
                    ctrl = control_rx.recv() => Tick::Control(ctrl),
                    name = timers.expired() => Tick::Timer(name),
                    event = dcc_rx.recv() => Tick::Dcc(event),
                    _ = shutdown.recv() => Tick::Shutdown,
                }
            };

            match tick {
                Tick::Client(Some(Ok(line))) => {
                    debug!(">> {}", line);
                    self.on_client_line(line).await;
                }
                Tick::Client(Some(Err(e))) => {
                    debug!(error = %e, "Client read error");
                    self.client_gone(true).await;
                }
                Tick::Client(None) => self.client_gone(false).await,
                Tick::Server(Some(Ok(line))) => {
                    debug!("<< {}", line);
                    self.on_server_line(line).await;
                }
                Tick::Server(Some(Err(e))) => {
                    debug!(error = %e, "Server read error");
                    self.server_error(true).await;
                }
                Tick::Server(None) => self.server_error(false).await,
                Tick::Connected(result) => self.on_connect_result(result).await,
                Tick::Control(Some(ctrl)) => self.on_control(ctrl).await,
                Tick::Control(None) => self.dead = true,
                Tick::Timer(name) => self.on_timer(&name).await,
                Tick::Dcc(Some(event)) => self.on_dcc_event(event),
                Tick::Dcc(None) => {}
                Tick::Shutdown => self.on_shutdown(),
            }
        }

        self.teardown().await;
        info!("Session ended");
    }

    async fn teardown(&mut self) {
        let _ = self.flush().await;
        self.timers.clear();

        for channel in &mut self.channels {
            channel.log.delete();
        }
        self.private_log.delete();
        self.server_log.delete();
        if let Some(ref dir) = self.temp_dir {
            let _ = std::fs::remove_dir(dir);
        }

        self.registry
            .remove_session(&self.class.password, &self.handle);
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Drain the client and server output queues as far as the sockets
    /// and the throttle allow.  Returns `(client_error, server_error)`.
    async fn flush(&mut self) -> (bool, bool) {
        let mut client_err = false;
        let mut server_err = false;

        if let Some(link) = self.client.as_mut() {
            let mut fed = false;
            while let Some(line) = link.out.pop_front() {
                if link.framed.feed(line).await.is_err() {
                    client_err = true;
                    break;
                }
                fed = true;
            }
            if !client_err && fed && link.framed.flush().await.is_err() {
                client_err = true;
            }
        }

        let mut next_window = None;
        if let Some(link) = self.server.as_mut() {
            let now = tokio::time::Instant::now();
            let mut fed = false;
            while let Some(line) = link.q.pop_ready(now) {
                debug!("-> {}", line);
                if link.framed.feed(line).await.is_err() {
                    server_err = true;
                    break;
                }
                fed = true;
            }
            if !server_err && fed && link.framed.flush().await.is_err() {
                server_err = true;
            }
            if !server_err {
                next_window = link.q.next_window();
            }
        }
        if let Some(at) = next_window {
            self.timers.schedule_at("server_throttle", at);
        }

        (client_err, server_err)
    }

    /// Queue a raw line for the client.
    pub(crate) fn send_client_raw(&mut self, line: String) {
        if let Some(link) = self.client.as_mut() {
            link.out.push_back(line);
        }
    }

    pub(crate) fn client_ready(&self) -> bool {
        self.client.is_some() && self.cstat.is_ready()
    }

    pub(crate) fn client_active(&self) -> bool {
        self.client.is_some() && self.cstat.is_active()
    }

    pub(crate) fn server_ready(&self) -> bool {
        self.server.is_some() && self.sstat.is_ready()
    }

    pub(crate) fn server_active(&self) -> bool {
        self.server.is_some() && self.sstat.is_active()
    }

    /// Name used as the source of numerics and server-ish notices.
    pub(crate) fn server_display_name(&self) -> String {
        self.server_name.clone().unwrap_or_else(|| PACKAGE.to_owned())
    }

    /// `nick!user@host` for synthetic self-commands and log sources.
    pub(crate) fn self_prefix(&self) -> String {
        match self.hostname {
            Some(ref host) => format!("{}!{}@{}", self.nickname, self.username, host),
            None => self.nickname.clone(),
        }
    }

    /// Notice from the bouncer itself.
    pub(crate) fn send_notice(&mut self, text: impl AsRef<str>) {
        let nick = if self.cstat.got_nick {
            self.nickname.clone()
        } else {
            "AUTH".to_owned()
        };
        self.send_client_raw(format!(":{} NOTICE {} :{}", PACKAGE, nick, text.as_ref()));
    }

    /// Numeric reply; `rest` carries everything after the nick, including
    /// any `:` marker.
    pub(crate) fn send_numeric(&mut self, numeric: u16, rest: &str) {
        let source = self.server_display_name();
        let nick = if self.cstat.got_nick {
            self.nickname.clone()
        } else {
            "*".to_owned()
        };
        self.send_client_raw(format!(":{} {:03} {} {}", source, numeric, nick, rest));
    }

    /// Notice that appears to come from the server, addressed to a
    /// channel.
    pub(crate) fn send_chan_notice(&mut self, channel: &str, text: &str) {
        let source = self.server_display_name();
        self.send_client_raw(format!(":{} NOTICE {} :{}", source, channel, text));
    }

    /// Command that appears to come from the client itself.
    pub(crate) fn send_selfcmd(&mut self, command: &str, rest: &str) {
        let prefix = self.self_prefix();
        self.send_client_raw(format!(":{} {} {}", prefix, command, rest));
    }

    /// ERROR line in the standard closing-link form.
    pub(crate) fn send_error(&mut self, text: &str) {
        let nick = if self.cstat.got_nick { self.nickname.as_str() } else { "" };
        let host = self.hostname.as_deref().unwrap_or("host");
        let line = format!(
            "ERROR :Closing Link: {}[{}@{}] ({})",
            nick, self.username, host, text
        );
        self.send_client_raw(line);
    }

    /// Queue a line for the server.
    pub(crate) fn send_server(&mut self, line: String) {
        if let Some(link) = self.server.as_mut() {
            link.q.push(line);
        }
    }

    /// Queue a line for the server ahead of everything else waiting.
    pub(crate) fn send_server_urgent(&mut self, line: String) {
        if let Some(link) = self.server.as_mut() {
            link.q.push_urgent(line);
        }
    }

    /// PRIVMSG (or ACTION, for a leading `/me `) to a channel, used for
    /// the attach and detach messages.
    pub(crate) fn send_channel_message(&mut self, channel: &str, message: &str) {
        let lower = message.to_ascii_lowercase();
        if message.len() >= 5 && lower.starts_with("/me ") {
            let action = &message[4..];
            self.send_server(format!("PRIVMSG {} :\x01ACTION {}\x01", channel, action));
        } else {
            self.send_server(format!("PRIVMSG {} :{}", channel, message));
        }
    }

    // ------------------------------------------------------------------
    // Logging
    // ------------------------------------------------------------------

    /// Write an event to the appropriate log file(s), the user copy and
    /// the log program.
    pub(crate) fn log_event(
        &mut self,
        event: LogEvent,
        target: LogTarget<'_>,
        source: &str,
        text: String,
    ) {
        if !self.events.contains(event) {
            return;
        }
        let ts = Local::now().timestamp() - self.class.log_timeoffset * 60;

        let destinations: Vec<(String, bool)> = match target {
            LogTarget::Server => vec![("SERVER".to_owned(), true)],
            LogTarget::All => {
                let mut all = vec![("SERVER".to_owned(), true)];
                all.extend(self.channels.iter().map(|c| (c.name.clone(), false)));
                all
            }
            LogTarget::Name(name) => vec![(name.to_owned(), false)],
        };

        for (dest, is_server) in destinations {
            let entry = LogEntry {
                ts,
                event,
                dest: dest.clone(),
                source: source.to_owned(),
                text: text.clone(),
            };

            let result = if is_server {
                self.server_log.append(&entry)
            } else if let Some(index) = self.channel_index(&dest) {
                self.channels[index].log.append(&entry)
            } else {
                self.private_log.append(&entry)
            };
            if let Err(e) = result {
                debug!(dest = %dest, error = %e, "Failed to append log entry");
            }

            if let Some(ref dir) = self.class.log_dir {
                crate::logs::append_user_copy(dir, &dest, &entry, self.class.log_timestamp);
            }
            if let Some(ref program) = self.class.log_program {
                crate::logs::pipe_to_program(program, &entry);
            }
        }
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    pub(crate) fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| irc_eq(&c.name, name))
    }

    /// Track a newly joined channel and set up its log.
    pub(crate) fn add_channel(&mut self, name: &str) {
        if self.channel_index(name).is_some() {
            return;
        }
        debug!(channel = name, "Joined channel");
        let mut log = LogFile::default();
        if let Some(ref dir) = self.temp_dir {
            log.init(dir, name, self.class.chan_log_maxsize, self.class.chan_log_always);
        }
        let mut warn_open = false;
        if self.class.chan_log_enabled && self.class.chan_log_always {
            warn_open = log.open().is_err();
        }
        self.channels.push(Channel {
            name: name.to_owned(),
            key: None,
            inactive: false,
            unjoined: false,
            log,
        });
        if warn_open {
            let text = format!("(warning) Unable to log channel: {}", name);
            self.send_chan_notice(name, &text);
        }
    }

    /// Forget a channel and remove its log.
    pub(crate) fn del_channel(&mut self, name: &str) {
        if let Some(index) = self.channel_index(name) {
            debug!(channel = name, "Parted channel");
            let mut channel = self.channels.remove(index);
            channel.log.delete();
        }
    }

    /// Arrange to rejoin a channel after the configured delay.
    pub(crate) fn schedule_rejoin(&mut self, name: &str) {
        match self.class.channel_rejoin {
            0 => self.rejoin_now(name),
            delay if delay > 0 => {
                let timer = format!("rejoin:{}", slbnc_proto::irc_to_lower(name));
                self.timers.schedule(timer, Duration::from_secs(delay as u64));
            }
            _ => {}
        }
    }

    fn rejoin_now(&mut self, name: &str) {
        debug!(channel = name, "Rejoining");
        let line = match self.channel_index(name).and_then(|i| self.channels[i].key.clone()) {
            Some(key) => format!("JOIN {} :{}", name, key),
            None => format!("JOIN :{}", name),
        };
        self.send_server(line);
    }

    // ------------------------------------------------------------------
    // Modes
    // ------------------------------------------------------------------

    /// Apply a `+abc-def` user mode change to the tracked mode set.
    pub(crate) fn apply_umode_change(&mut self, change: &str) {
        let mut add = true;
        for c in change.chars() {
            match c {
                '+' => add = true,
                '-' => add = false,
                mode => {
                    if add {
                        self.modes.insert(mode);
                    } else {
                        self.modes.remove(&mode);
                    }
                }
            }
        }
        debug!(modes = %self.modes_string().unwrap_or_default(), "User modes now");
    }

    /// The sorted active mode letters, when any are set.
    pub(crate) fn modes_string(&self) -> Option<String> {
        if self.modes.is_empty() {
            None
        } else {
            Some(self.modes.iter().collect())
        }
    }

    /// Track the `k` parameter of a channel MODE change; other
    /// parameter-consuming letters only advance the cursor.
    pub(crate) fn apply_channel_mode(&mut self, index: usize, msg: &Message, modes_at: usize) {
        let Some(modes) = msg.param(modes_at) else {
            return;
        };
        let modes = modes.to_owned();
        let mut add = true;
        let mut param = modes_at + 1;

        for c in modes.chars() {
            match c {
                '+' => add = true,
                '-' => add = false,
                'O' | 'o' | 'v' | 'b' | 'e' | 'I' | 'l' => param += 1,
                'k' => {
                    if add {
                        match msg.param(param) {
                            Some(key) => {
                                debug!(channel = %self.channels[index].name, "Channel key set");
                                self.channels[index].key = Some(key.to_owned());
                            }
                            None => debug!("Bad mode from server, +k without a key"),
                        }
                    } else {
                        self.channels[index].key = None;
                    }
                    param += 1;
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Server connection machinery
    // ------------------------------------------------------------------

    /// The tail run after client activity: connect to a server, prompt
    /// for one, or deliver the welcome once both sides are up.
    pub(crate) fn ensure_server_connection(&mut self) {
        if self.dead || !self.cstat.is_ready() {
            return;
        }
        if self.sstat.is_active() {
            if !self.cstat.sent_welcome && self.client.is_some() {
                self.welcome();
            }
        } else if !self.sstat.created {
            if self.class.server_autoconnect {
                self.start_connect();
            } else {
                self.send_notice(
                    "Please send /DIRCPROXY JUMP <hostname>[:[port][:[password]]] \
                     to choose a server",
                );
                let timeout = self.registry.globals().connect_timeout;
                self.timers
                    .schedule("client_connect", Duration::from_secs(timeout));
            }
        } else if !self.sstat.is_ready() {
            self.send_notice("Connection to server is in progress...");
        }
    }

    /// Begin a connection attempt to the server under the cursor.
    pub(crate) fn start_connect(&mut self) {
        if self.timers.exists("server_recon") || self.connecting.is_some() {
            debug!("Connection already in progress");
            if self.client_ready() {
                self.send_notice("Connection already in progress...");
            }
            return;
        }
        let Some(spec) = self.servers.get(self.cursor).cloned() else {
            warn!("No servers to connect to");
            self.dead = true;
            return;
        };

        self.server_password = spec.password.clone();
        if self.client_ready() {
            self.send_notice(format!("Looking up {}...", spec.host));
        }
        self.sstat.created = true;

        let registry = Arc::clone(&self.registry);
        let local_address = self.local_address.clone();
        let keepalive = self.class.server_keepalive;
        let need_hostname = self.hostname.is_none();
        self.connecting = Some(Box::pin(connect_to_server(
            registry,
            spec,
            local_address,
            keepalive,
            need_hostname,
        )));
    }

    async fn on_connect_result(&mut self, result: ConnectResult) {
        self.connecting = None;

        let stream = match result.stream {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "Connection failed");
                if self.client_ready() {
                    self.send_notice(format!("Connection failed: {}", e));
                }
                self.sstat.created = false;
                self.server_password = None;
                let retry = self.class.server_retry;
                self.timers.schedule("server_recon", Duration::from_secs(retry));
                return;
            }
        };

        debug!("Connection succeeded");
        self.sstat.connected = true;
        self.server = Some(ServerLink {
            framed: Framed::new(stream, LineCodec::new()),
            q: SendQueue::new(self.class.throttle()),
        });
        if self.hostname.is_none() {
            self.hostname = result.local_hostname;
        }
        self.server_name = Some(result.server_host.clone());

        if self.client_ready() {
            self.send_notice("Connected to server");
        }
        self.log_event(
            LogEvent::Server,
            LogTarget::Server,
            PACKAGE,
            format!("Connected to server: {}", result.server_host),
        );

        // Introduce ourselves; start fresh on the set nickname
        let username = sanitize_username(&self.username);
        if let Some(password) = self.server_password.take() {
            self.send_server(format!("PASS :{}", password));
        }
        if self.nickname != self.set_nickname {
            self.nickname = self.set_nickname.clone();
        }
        self.send_server(format!("NICK :{}", self.nickname));
        self.send_server(format!("USER {} 0 * :{}", username, self.realname));
        self.sstat.introduced = true;

        if self.class.server_pingtimeout > 0 {
            let timeout = self.class.server_pingtimeout;
            self.timers
                .schedule("server_ping", Duration::from_secs(timeout / 2));
            self.timers
                .schedule("server_stoned", Duration::from_secs(timeout));
        }
        if self.class.idle_maxtime > 0 {
            let idle = self.class.idle_maxtime;
            self.timers
                .schedule("server_antiidle", Duration::from_secs(idle));
        }
        self.update_info();
    }

    /// Close the server socket and cancel every timer that would touch it.
    pub(crate) fn close_server_sock(&mut self) {
        self.server = None;
        self.connecting = None;
        self.sstat.created = false;
        self.sstat.connected = false;
        self.sstat.introduced = false;
        self.sstat.got_welcome = false;

        for timer in ["server_ping", "server_stoned", "server_antiidle", "server_recon"] {
            self.timers.cancel(timer);
        }
    }

    pub(crate) async fn server_error(&mut self, bad: bool) {
        if bad {
            debug!("Server socket error");
        } else {
            debug!("Server disconnected");
        }
        self.server_lost().await;
    }

    /// The server connection is gone: tell the client, synthesize PARTs
    /// so it isn't confused by rejoin JOINs later, and arm the retry.
    pub(crate) async fn server_lost(&mut self) {
        let name = self.server_display_name();
        self.close_server_sock();

        if self.client_ready() {
            self.send_notice("Lost connection to server");
            self.synthesize_parts();
        }
        self.log_event(
            LogEvent::Server,
            LogTarget::Server,
            PACKAGE,
            format!("Lost connection to server: {}", name),
        );

        let retry = self.class.server_retry;
        self.timers.schedule("server_recon", Duration::from_secs(retry));
        self.update_info();
    }

    /// Send the client a PART for every channel we are on.
    pub(crate) fn synthesize_parts(&mut self) {
        let names: Vec<String> = self.channels.iter().map(|c| c.name.clone()).collect();
        for name in names {
            self.send_selfcmd("PART", &format!(":{}", name));
        }
    }

    /// Drop the current server connection (if any) and connect to the
    /// server under the cursor, restarting initial-attempt counting.
    pub(crate) async fn connect_again(&mut self) {
        if self.server_ready() {
            if self.client_ready() {
                self.send_notice("Dropped connection to server");
                let name = self.server_display_name();
                self.log_event(
                    LogEvent::Server,
                    LogTarget::Server,
                    PACKAGE,
                    format!("Dropped connection to server: {}", name),
                );
                self.synthesize_parts();
            }
            self.send_server(format!("QUIT :Reconnecting to server - {} {}", PACKAGE, VERSION));
            let _ = self.flush().await;
        }
        if self.sstat.created {
            self.close_server_sock();
        }

        self.sstat.seen = false;
        self.attempts = 0;
        debug!("Connecting again");
        self.start_connect();
    }

    /// The `server_recon` timer: move to the next server and try again,
    /// unless the attempt budget is spent.
    async fn reconnect_tick(&mut self) {
        if self.servers.is_empty() {
            self.dead = true;
            return;
        }
        self.cursor = (self.cursor + 1) % self.servers.len();
        self.attempts += 1;

        let initial = !self.sstat.seen;
        debug!(attempt = self.attempts + 1, initial, "Reconnecting to server");

        if self.class.server_maxattempts > 0 && self.attempts >= self.class.server_maxattempts {
            debug!("Giving up on servers, reattempted too much");
            self.give_up("Maximum connection attempts exceeded");
        } else if initial
            && self.class.server_maxinitattempts > 0
            && self.attempts >= self.class.server_maxinitattempts
        {
            debug!("Giving up on servers, can't get initial connection");
            self.give_up("Maximum initial connection attempts exceeded");
        } else {
            self.start_connect();
        }
    }

    fn give_up(&mut self, what: &str) {
        if self.client_ready() {
            self.send_notice("Giving up on servers.  Time to quit");
        }
        if self.cstat.connected {
            self.send_error(what);
        }
        self.dead = true;
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    async fn on_timer(&mut self, name: &str) {
        match name {
            "server_recon" => self.reconnect_tick().await,
            "server_ping" => {
                if self.server_ready() {
                    debug!("Pinging the server");
                    let target = self.server_display_name();
                    self.send_server_urgent(format!("PING :{}", target));
                }
                let timeout = self.class.server_pingtimeout;
                self.timers
                    .schedule("server_ping", Duration::from_secs(timeout / 2));
            }
            "server_stoned" => {
                if self.server_ready() {
                    debug!("Server is stoned, reconnecting");
                    self.send_server(format!(
                        "QUIT :Getting off stoned server - {} {}",
                        PACKAGE, VERSION
                    ));
                    let _ = self.flush().await;
                    self.server_lost().await;
                }
            }
            "server_antiidle" => {
                if self.server_ready() {
                    debug!("Sending anti-idle");
                    self.squelch_411 = true;
                    self.send_server("PRIVMSG ".to_owned());
                }
                let idle = self.class.idle_maxtime;
                self.timers
                    .schedule("server_antiidle", Duration::from_secs(idle));
            }
            "client_resetnick" => {
                if self.server_ready() && self.nickname != self.set_nickname {
                    debug!(nick = %self.set_nickname, "Attempting to restore nickname");
                    let wanted = self.set_nickname.clone();
                    self.change_nick(wanted);
                }
            }
            "client_connect" => {
                if !self.sstat.created {
                    debug!("Timed out waiting for a server choice");
                    self.send_error("Connect Timeout");
                    self.close_client().await;
                }
            }
            "server_throttle" => {
                // Nothing to do: the queue drains at the top of the loop
            }
            other => {
                if let Some(channel) = other.strip_prefix("rejoin:") {
                    let channel = channel.to_owned();
                    self.rejoin_now(&channel);
                } else if let Some(id) = other.strip_prefix("resume:") {
                    let id = id.to_owned();
                    self.resume_timeout(&id).await;
                }
            }
        }
    }

    /// Reset the anti-idle clock after genuine client activity.
    pub(crate) fn reset_idle(&mut self) {
        if self.class.idle_maxtime > 0 {
            let idle = self.class.idle_maxtime;
            self.timers.cancel("server_antiidle");
            self.timers
                .schedule("server_antiidle", Duration::from_secs(idle));
        }
    }

    // ------------------------------------------------------------------
    // Control and lifecycle
    // ------------------------------------------------------------------

    async fn on_control(&mut self, ctrl: Control) {
        match ctrl {
            Control::Attach(handoff) => self.on_attach(*handoff).await,
            Control::Rebind(class) => {
                debug!("Rebound to reloaded connection class");
                self.servers = class.server_specs();
                if self.cursor >= self.servers.len() {
                    self.cursor = 0;
                }
                self.local_address = class.local_address.clone();
                self.events = class.event_filter();
                self.away_message_cfg = class.away_message.clone();
                self.quit_message = class.quit_message.clone();
                self.attach_message = class.attach_message.clone();
                self.detach_message = class.detach_message.clone();
                self.detach_nickname = class.detach_nickname.clone();
                self.class = class;
            }
            Control::Terminate(reason) => {
                if self.server_ready() {
                    self.send_server(format!("QUIT :{} - {} {}", reason, PACKAGE, VERSION));
                    let _ = self.flush().await;
                }
                if self.client_ready() {
                    self.send_error(&reason);
                }
                self.close_server_sock();
                self.dead = true;
            }
            Control::Notify(text) => {
                let nick = self.nickname.clone();
                self.send_client_raw(format!(
                    ":{pkg}!{pkg}@localhost NOTICE {nick} :{text}",
                    pkg = PACKAGE
                ));
            }
        }
    }

    fn on_shutdown(&mut self) {
        debug!("Daemon shutting down");
        if self.sstat.created {
            let quit = self
                .quit_message
                .clone()
                .unwrap_or_else(|| format!("Terminated with extreme prejudice - {} {}", PACKAGE, VERSION));
            self.send_server(format!("QUIT :{}", quit));
        }
        if self.cstat.connected {
            self.send_error(&format!("{} going bye-bye", PACKAGE));
        }
        self.dead = true;
    }

    fn on_dcc_event(&mut self, event: DccEvent) {
        match event {
            DccEvent::Reject {
                notice,
                reason,
                to_server,
            } => self.send_dcc_reject(&notice, reason.as_deref(), to_server),
        }
    }

    /// Relay a DCC REJECT, completing the pre-formatted notice with its
    /// closing delimiter (and optional reason).
    pub(crate) fn send_dcc_reject(&mut self, notice: &str, reason: Option<&str>, to_server: bool) {
        if !self.class.dcc_proxy_sendreject {
            return;
        }
        let line = match reason {
            Some(reason) => format!("{} ({}: {})\x01", notice, PACKAGE, reason),
            None => format!("{}\x01", notice),
        };
        if to_server {
            if self.server_active() {
                self.send_server(line);
            }
        } else if self.client_active() {
            self.send_client_raw(line);
        }
    }

    /// Keep the registry's snapshot of this session current.
    pub(crate) fn update_info(&self) {
        let mut info = self.handle.info.lock();
        info.nickname = Some(self.nickname.clone());
        info.client_host = self.client_host.clone();
        info.server_name = self.server_name.clone();
        info.client_connected = self.client.is_some() && self.cstat.connected;
    }

    /// Session handle identity, for "is that me" checks.
    pub(crate) fn handle_is(&self, other: &SessionHandle) -> bool {
        other.is(&self.handle)
    }

    // ------------------------------------------------------------------
    // Nickname handling
    // ------------------------------------------------------------------

    /// Request a nickname change.  With a registered client the server
    /// confirms it; otherwise the change is made (and echoed) locally.
    pub(crate) fn change_nick(&mut self, new_nick: String) {
        if self.server_ready() {
            debug!(from = %self.nickname, to = %new_nick, "Requesting nick change");
            self.send_server(format!("NICK :{}", new_nick));
        }

        if self.cstat.got_nick {
            debug!("Server will confirm the change");
            self.expecting_nick = true;
        } else {
            if self.cstat.connected && self.cstat.authed {
                self.send_selfcmd("NICK", &format!(":{}", new_nick));
            }
            self.nick_changed(new_nick);
            self.set_nickname = self.nickname.clone();
            self.check_nickname();
        }
    }

    /// The nickname has definitely changed.
    pub(crate) fn nick_changed(&mut self, new_nick: String) {
        debug!(from = %self.nickname, to = %new_nick, "Nickname changed");
        self.nickname = new_nick;
        self.cstat.got_nick = true;
        self.update_info();
    }

    /// Arm the keep-nick guard when the live nickname drifted from the
    /// one the client wanted.
    pub(crate) fn check_nickname(&mut self) {
        if self.class.nick_keep && self.nickname != self.set_nickname {
            self.timers
                .schedule("client_resetnick", Duration::from_secs(NICK_GUARD_TIME));
        }
    }

    /// Invent and request a replacement after `tried` was rejected with
    /// no client around to pick one.
    pub(crate) fn regenerate_nick(&mut self, tried: &str) {
        let candidate = nick::generate_next_nick(tried);
        if self.server_ready() {
            debug!(from = %self.nickname, to = %candidate, "Requesting generated nick");
            self.send_server(format!("NICK :{}", candidate));
        }
        if !self.cstat.got_nick {
            self.nick_changed(candidate);
            self.check_nickname();
        }
    }

    /// Whether a prefixed message is the server describing ourselves.
    /// Picks up username/hostname corrections on the way.
    pub(crate) fn msg_is_for_us(&mut self, prefix: &Option<Prefix>) -> bool {
        let Some(prefix) = prefix else { return false };
        if !prefix.is_user() || !irc_eq(&prefix.name, &self.nickname) {
            return false;
        }
        if let Some(ref user) = prefix.user {
            self.username = user.clone();
        }
        if let Some(ref host) = prefix.host {
            self.hostname = Some(host.clone());
        }
        true
    }
}

/// Resolve and dial a server, optionally binding the configured local
/// address first and discovering our visible hostname afterwards.
async fn connect_to_server(
    registry: Arc<Registry>,
    spec: ServerSpec,
    local_address: Option<String>,
    keepalive: bool,
    need_hostname: bool,
) -> ConnectResult {
    let fail = |message: String| ConnectResult {
        stream: Err(std::io::Error::other(message)),
        server_host: spec.host.clone(),
        local_hostname: None,
    };

    let Some(ip) = registry.resolver.resolve_host(&spec.host).await else {
        return fail(format!("cannot resolve {}", spec.host));
    };
    let addr = SocketAddr::new(ip, spec.port);

    let socket = match if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    } {
        Ok(socket) => socket,
        Err(e) => return fail(e.to_string()),
    };

    if keepalive {
        if let Err(e) = socket.set_keepalive(true) {
            debug!(error = %e, "Couldn't enable keepalive");
        }
    }

    if let Some(ref local) = local_address {
        match registry.resolver.resolve_host(local).await {
            Some(local_ip) => {
                if let Err(e) = socket.bind(SocketAddr::new(local_ip, 0)) {
                    debug!(local = %local, error = %e, "Couldn't bind local address");
                }
            }
            None => debug!(local = %local, "Couldn't find local address"),
        }
    }

    let stream = match socket.connect(addr).await {
        Ok(stream) => stream,
        Err(e) => return fail(e.to_string()),
    };

    let local_hostname = if need_hostname {
        match stream.local_addr() {
            Ok(local) => registry.resolver.resolve_addr(local.ip()).await,
            Err(_) => None,
        }
    } else {
        None
    };

    ConnectResult {
        stream: Ok(stream),
        server_host: spec.host,
        local_hostname,
    }
}

fn create_private_dir(dir: &std::path::Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}
