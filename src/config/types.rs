//! Configuration type definitions.

use serde::Deserialize;

use super::defaults::*;

/// Console log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output.
    Pretty,
    /// Structured JSON output.
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Port (or `host:port`) to listen on for client connections.
    #[serde(default = "default_listen_port", deserialize_with = "super::string_or_int")]
    pub listen_port: String,

    /// Path to write the daemon pid to.
    #[serde(default)]
    pub pid_file: Option<String>,

    /// Seconds a client may take to log in.
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,

    /// Seconds a client may take to choose a server when
    /// `server_autoconnect` is off.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Seconds to allow for a DNS request.
    #[serde(default = "default_dns_timeout")]
    pub dns_timeout: u64,

    /// Console log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Connection classes.
    #[serde(default, rename = "connection")]
    pub connections: Vec<ConnectionClass>,
}

/// An authorisation and policy record.  A client authenticates to exactly
/// one class; the class describes which servers to hold open and how the
/// session behaves while the client is away.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionClass {
    /// Password clients authenticate with: a bcrypt hash (`$2*$...`) or
    /// plain text.
    pub password: String,

    /// Servers to connect to, in order: `host[:port][:password]`.
    #[serde(default, rename = "server")]
    pub servers: Vec<String>,

    /// Host patterns the client must connect from (empty = anywhere).
    #[serde(default, rename = "from")]
    pub from_masks: Vec<String>,

    /// Channels to join on first connection: `name [key]`.
    #[serde(default, rename = "join")]
    pub join_channels: Vec<String>,

    /// Default server port when a server spec has none.
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Seconds between connection attempts.
    #[serde(default = "default_server_retry")]
    pub server_retry: u64,

    /// Reconnection attempts before giving up (0 = forever).
    #[serde(default = "default_server_maxattempts")]
    pub server_maxattempts: u32,

    /// Initial connection attempts before giving up (0 = forever).
    #[serde(default = "default_server_maxinitattempts")]
    pub server_maxinitattempts: u32,

    /// Set SO_KEEPALIVE on the server socket.
    #[serde(default)]
    pub server_keepalive: bool,

    /// Seconds without a PONG before the server is considered stoned
    /// (0 = no stoned checking).
    #[serde(default)]
    pub server_pingtimeout: u64,

    /// Write throttle for the server connection: `bytes[:period]`.
    #[serde(default)]
    pub server_throttle: Option<String>,

    /// Connect to a server as soon as the client authenticates.
    #[serde(default = "default_true")]
    pub server_autoconnect: bool,

    /// Seconds before rejoining after a kick (-1 = don't, 0 = at once).
    #[serde(default = "default_channel_rejoin")]
    pub channel_rejoin: i64,

    /// PART from all channels when the client detaches.
    #[serde(default)]
    pub channel_leave_on_detach: bool,

    /// Rejoin channels we PARTed on detach when the client reattaches.
    #[serde(default = "default_true")]
    pub channel_rejoin_on_attach: bool,

    /// Seconds of idleness before an anti-idle probe (0 = never).
    #[serde(default)]
    pub idle_maxtime: u64,

    /// A second login evicts the existing client rather than being refused.
    #[serde(default, rename = "disconnect_existing_user")]
    pub disconnect_existing: bool,

    /// Detaching ends the proxy session entirely.
    #[serde(default)]
    pub disconnect_on_detach: bool,

    /// User modes to set on first server connection.
    #[serde(default = "default_initial_modes")]
    pub initial_modes: Option<String>,

    /// User modes to drop when the client detaches.
    #[serde(default = "default_drop_modes")]
    pub drop_modes: Option<String>,

    /// User modes that cause the server connection to be dropped.
    #[serde(default)]
    pub refuse_modes: Option<String>,

    /// Local address to bind before connecting to a server.
    #[serde(default)]
    pub local_address: Option<String>,

    /// AWAY message set when the client detaches without one.
    #[serde(default = "default_away_message")]
    pub away_message: Option<String>,

    /// QUIT message for normal termination of the proxy session.
    #[serde(default)]
    pub quit_message: Option<String>,

    /// Sent to each channel on attach (leading `/me ` makes it an ACTION).
    #[serde(default)]
    pub attach_message: Option<String>,

    /// Sent to each channel on detach (leading `/me ` makes it an ACTION).
    #[serde(default)]
    pub detach_message: Option<String>,

    /// Nickname to switch to on detach; `*` is replaced with the current
    /// nickname.
    #[serde(default)]
    pub detach_nickname: Option<String>,

    /// Try to keep the nickname the client last set.
    #[serde(default = "default_true")]
    pub nick_keep: bool,

    /// Password to IDENTIFY to NickServ with on attach.
    #[serde(default)]
    pub nickserv_password: Option<String>,

    /// Answer CTCP requests while the client is detached.
    #[serde(default = "default_true")]
    pub ctcp_replies: bool,

    /// Timestamp recalled log lines.
    #[serde(default = "default_true")]
    pub log_timestamp: bool,

    /// Use relative timestamps when recalling.
    #[serde(default = "default_true")]
    pub log_relativetime: bool,

    /// Minutes of difference between the client and this machine.
    #[serde(default)]
    pub log_timeoffset: i64,

    /// Comma list of events to log: `all`, `none`, `+event`, `-event`.
    #[serde(default = "default_log_events")]
    pub log_events: String,

    /// Directory for permanent, human-readable log copies.
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Program to pipe each log line into.
    #[serde(default)]
    pub log_program: Option<String>,

    /// Log channel text.
    #[serde(default = "default_true")]
    pub chan_log_enabled: bool,
    /// Log channel text even while the client is attached.
    #[serde(default = "default_true")]
    pub chan_log_always: bool,
    /// Maximum lines per channel log (0 = no limit).
    #[serde(default)]
    pub chan_log_maxsize: u64,
    /// Lines recalled on attach (-1 = all).
    #[serde(default = "default_chan_log_recall")]
    pub chan_log_recall: i64,

    /// Log private messages.
    #[serde(default = "default_true")]
    pub private_log_enabled: bool,
    /// Log private messages even while the client is attached.
    #[serde(default)]
    pub private_log_always: bool,
    /// Maximum lines in the private log (0 = no limit).
    #[serde(default)]
    pub private_log_maxsize: u64,
    /// Lines recalled on attach (-1 = all).
    #[serde(default = "default_log_recall_all")]
    pub private_log_recall: i64,

    /// Log server messages.
    #[serde(default = "default_true")]
    pub server_log_enabled: bool,
    /// Log server messages even while the client is attached.
    #[serde(default)]
    pub server_log_always: bool,
    /// Maximum lines in the server log (0 = no limit).
    #[serde(default)]
    pub server_log_maxsize: u64,
    /// Lines recalled on attach (-1 = all).
    #[serde(default = "default_log_recall_all")]
    pub server_log_recall: i64,

    /// Proxy DCC offers arriving from the network.
    #[serde(default = "default_true")]
    pub dcc_proxy_incoming: bool,
    /// Proxy DCC offers sent by the client.
    #[serde(default = "default_true")]
    pub dcc_proxy_outgoing: bool,
    /// Local port ranges for DCC proxies: `low-high[,low-high...]`.
    #[serde(default)]
    pub dcc_proxy_ports: Option<String>,
    /// Seconds to wait for both sides of a DCC proxy to connect.
    #[serde(default = "default_dcc_proxy_timeout")]
    pub dcc_proxy_timeout: u64,
    /// Send a DCC REJECT back when the proxy could not be established.
    #[serde(default = "default_true")]
    pub dcc_proxy_sendreject: bool,

    /// Send DCC data without waiting for acknowledgements.
    #[serde(default)]
    pub dcc_send_fast: bool,

    /// Directory to capture DCC sends into (empty = proxy instead).
    #[serde(default)]
    pub dcc_capture_directory: Option<String>,
    /// Capture even while a client is attached.
    #[serde(default)]
    pub dcc_capture_always: bool,
    /// Prefix captured filenames with the sender's nickname.
    #[serde(default)]
    pub dcc_capture_withnick: bool,
    /// Maximum size of a captured file in KB (0 = no limit).
    #[serde(default)]
    pub dcc_capture_maxsize: u64,

    /// Local port all incoming DCC connections are tunnelled through
    /// (0 = off).
    #[serde(default)]
    pub dcc_tunnel_incoming: u16,
    /// Local port all outgoing DCC connections are tunnelled through
    /// (0 = off).
    #[serde(default)]
    pub dcc_tunnel_outgoing: u16,

    /// Show the logo in the message of the day.
    #[serde(default = "default_true")]
    pub motd_logo: bool,
    /// Custom message-of-the-day file.
    #[serde(default)]
    pub motd_file: Option<String>,
    /// Show channel and log statistics in the message of the day.
    #[serde(default = "default_true")]
    pub motd_stats: bool,

    /// Permission flags for /DIRCPROXY commands.
    #[serde(default = "default_true")]
    pub allow_persist: bool,
    /// Allow /DIRCPROXY JUMP.
    #[serde(default = "default_true")]
    pub allow_jump: bool,
    /// Allow /DIRCPROXY JUMP to a server not in the list.
    #[serde(default = "default_true")]
    pub allow_jump_new: bool,
    /// Allow /DIRCPROXY HOST.
    #[serde(default = "default_true")]
    pub allow_host: bool,
    /// Allow /DIRCPROXY DIE.
    #[serde(default)]
    pub allow_die: bool,
    /// Allow /DIRCPROXY USERS.
    #[serde(default)]
    pub allow_users: bool,
    /// Allow /DIRCPROXY KILL.
    #[serde(default)]
    pub allow_kill: bool,
    /// Allow /DIRCPROXY NOTIFY.
    #[serde(default)]
    pub allow_notify: bool,
    /// GET/SET permission: 0 = disabled, 1 = read only, 2 = read/write.
    #[serde(default = "default_allow_dynamic")]
    pub allow_dynamic: u8,
}
