//! The /DIRCPROXY admin command surface.
//!
//! A thin dispatcher over the session and registry: every command here is
//! usable whether or not a server connection exists, and anything it
//! sends upstream checks for one explicitly.

use tracing::debug;

use crate::logs::RecallStyle;
use crate::registry::SessionInfo;
use crate::session::Control;
use crate::{PACKAGE, VERSION};
use slbnc_proto::{irc_eq, Message};

use super::Session;

/// Keys the GET command reports.
const GET_KEYS: &[&str] = &[
    "server_retry",
    "server_pingtimeout",
    "channel_rejoin",
    "idle_maxtime",
    "nick_keep",
    "ctcp_replies",
    "away_message",
    "quit_message",
    "attach_message",
    "detach_message",
    "detach_nickname",
];

/// Keys the SET command may change at runtime.
const SET_KEYS: &[&str] = &[
    "away_message",
    "quit_message",
    "attach_message",
    "detach_message",
    "detach_nickname",
];

impl Session {
    /// Dispatch a /DIRCPROXY command.  Returns `true` when the session's
    /// connections changed under the caller (detach, quit, jump, host).
    pub(crate) async fn handle_dircproxy(&mut self, msg: &Message) -> bool {
        let Some(sub) = msg.param(0).map(str::to_ascii_uppercase) else {
            self.send_numeric(461, ":Not enough parameters");
            return false;
        };

        match sub.as_str() {
            "RECALL" => self.cmd_recall(msg),
            "PERSIST" if self.class.allow_persist => self.cmd_persist(),
            "GET" => self.cmd_get(msg),
            "SET" => self.cmd_set(msg),
            "RELOAD" => {
                self.send_notice("RELOAD in progress");
                self.registry.request_reload();
            }
            "DETACH" => {
                self.announce_status();
                self.send_error(&format!("Detached from {} {}", PACKAGE, VERSION));
                let away = msg.tail(1).filter(|t| !t.is_empty());
                self.detach(away.as_deref()).await;
                return true;
            }
            "QUIT" => {
                // Detach and end the proxy session entirely
                if self.server_ready() {
                    let quit = msg
                        .tail(1)
                        .filter(|t| !t.is_empty())
                        .or_else(|| self.quit_message.clone())
                        .unwrap_or_else(|| format!("Leaving IRC - {} {}", PACKAGE, VERSION));
                    self.send_server(format!("QUIT :{}", quit));
                }
                let _ = self.flush().await;
                self.close_server_sock();
                self.close_client().await;
                self.dead = true;
                return true;
            }
            "MOTD" => self.motd(),
            "DIE" if self.class.allow_die => {
                self.send_notice("I'm melting!");
                let _ = self.flush().await;
                self.registry.shutdown();
            }
            "USERS" if self.class.allow_users => self.cmd_users(),
            "KILL" if self.class.allow_kill => self.cmd_kill(msg).await,
            "NOTIFY" if self.class.allow_notify => self.cmd_notify(msg).await,
            "SERVERS" => self.cmd_servers(),
            "JUMP" | "CONNECT" if self.class.allow_jump => {
                if self.cmd_jump(msg).await {
                    return true;
                }
            }
            "HOST" if self.class.allow_host => {
                // Change the visible hostname by rebinding the local
                // address and reconnecting
                self.local_address = match msg.param(1) {
                    Some(address) if !irc_eq(address, "none") => Some(address.to_owned()),
                    Some(_) => None,
                    None => self.class.local_address.clone(),
                };
                self.connect_again().await;
                return true;
            }
            "STATUS" => self.cmd_status(),
            "HELP" => self.cmd_help(msg),
            _ => {
                self.send_numeric(421, &format!("{} :Unknown DIRCPROXY command", sub));
            }
        }
        false
    }

    fn cmd_persist(&mut self) {
        if self.die_on_close {
            if self.class.disconnect_on_detach {
                self.send_notice("Could not persist");
            } else {
                self.die_on_close = false;
                self.announce_persist();
            }
        } else {
            self.announce_persist();
        }
    }

    fn announce_persist(&mut self) {
        match self.registry.globals().listen_port {
            Some(port) => {
                let host = self
                    .hostname
                    .clone()
                    .unwrap_or_else(|| "localhost".to_owned());
                self.send_notice(format!("Reconnect to this session at {}:{}", host, port));
            }
            None => self.send_notice("You cannot reconnect to this session"),
        }
    }

    fn cmd_get(&mut self, msg: &Message) {
        if self.class.allow_dynamic < 1 {
            self.send_notice("You are not authorized to use GET command");
            return;
        }
        let Some(key) = msg.param(1).map(str::to_ascii_lowercase) else {
            let keys = GET_KEYS.join(" ");
            self.send_notice(format!("Readable settings: {}", keys));
            return;
        };

        let show = |value: Option<&str>| value.unwrap_or("(unset)").to_owned();
        let value = match key.as_str() {
            "server_retry" => self.class.server_retry.to_string(),
            "server_pingtimeout" => self.class.server_pingtimeout.to_string(),
            "channel_rejoin" => self.class.channel_rejoin.to_string(),
            "idle_maxtime" => self.class.idle_maxtime.to_string(),
            "nick_keep" => self.class.nick_keep.to_string(),
            "ctcp_replies" => self.class.ctcp_replies.to_string(),
            "away_message" => show(self.away_message_cfg.as_deref()),
            "quit_message" => show(self.quit_message.as_deref()),
            "attach_message" => show(self.attach_message.as_deref()),
            "detach_message" => show(self.detach_message.as_deref()),
            "detach_nickname" => show(self.detach_nickname.as_deref()),
            _ => {
                self.send_notice(format!("No such setting '{}'", key));
                return;
            }
        };
        self.send_notice(format!("{} = {}", key, value));
    }

    fn cmd_set(&mut self, msg: &Message) {
        if self.class.allow_dynamic < 2 {
            self.send_notice("You are not authorized to use SET command");
            return;
        }
        let Some(key) = msg.param(1).map(str::to_ascii_lowercase) else {
            let keys = SET_KEYS.join(" ");
            self.send_notice(format!("Settable settings: {}", keys));
            return;
        };
        let value = msg.tail(2).filter(|v| !v.is_empty());

        let slot = match key.as_str() {
            "away_message" => &mut self.away_message_cfg,
            "quit_message" => &mut self.quit_message,
            "attach_message" => &mut self.attach_message,
            "detach_message" => &mut self.detach_message,
            "detach_nickname" => &mut self.detach_nickname,
            _ => {
                self.send_notice(format!("Setting '{}' cannot be changed here", key));
                return;
            }
        };
        *slot = value.clone();
        self.send_notice(format!(
            "{} = {}",
            key,
            value.as_deref().unwrap_or("(unset)")
        ));
    }

    fn cmd_users(&mut self) {
        let sessions = self.registry.live_sessions();
        self.send_notice("Connection classes:");
        let mut lines = Vec::new();
        for (index, (_, handle)) in sessions.iter().enumerate() {
            let info: SessionInfo = handle.info.lock().clone();
            let marker = if self.handle_is(handle) { ">" } else { " " };
            lines.push(format!(
                "-{} {:2}. {} -> {} ({})",
                marker,
                index + 1,
                info.client_host.as_deref().unwrap_or("(none)"),
                info.server_name.as_deref().unwrap_or("(none)"),
                info.nickname.as_deref().unwrap_or("no nickname")
            ));
        }
        for line in lines {
            self.send_notice(line);
        }
    }

    async fn cmd_kill(&mut self, msg: &Message) {
        let Some(needle) = msg.param(1) else {
            self.send_numeric(461, ":Not enough parameters");
            return;
        };
        match self.registry.find_session(needle) {
            Some((_, handle)) if self.handle_is(&handle) => {
                self.send_notice("Use /DIRCPROXY QUIT to kill yourself");
            }
            Some((_, handle)) => {
                let _ = handle
                    .control
                    .send(Control::Terminate("Killed by administrator".to_owned()))
                    .await;
            }
            None => {
                self.send_numeric(401, ":No such user, use /DIRCPROXY USERS to see them");
            }
        }
    }

    async fn cmd_notify(&mut self, msg: &Message) {
        let (Some(needle), Some(text)) = (msg.param(1), msg.tail(2)) else {
            self.send_numeric(461, ":Not enough parameters");
            return;
        };
        match self.registry.find_session(needle) {
            Some((_, handle)) => {
                let _ = handle.control.send(Control::Notify(text)).await;
            }
            None => {
                self.send_numeric(401, ":No such user, use /DIRCPROXY USERS to see them");
            }
        }
    }

    fn cmd_servers(&mut self) {
        if self.servers.is_empty() {
            self.send_notice("No servers");
            return;
        }
        self.send_notice("You can connect to:");
        let lines: Vec<String> = self
            .servers
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let marker = if index == self.cursor { ">" } else { " " };
                format!("-{} {:2}. {}", marker, index + 1, spec)
            })
            .collect();
        for line in lines {
            self.send_notice(line);
        }
    }

    /// JUMP: connect to another server, by index, by name, or the next in
    /// the list.  Returns whether a jump happened.
    async fn cmd_jump(&mut self, msg: &Message) -> bool {
        let target = match msg.param(1) {
            Some(wanted) => {
                let by_index: Option<usize> = wanted.parse().ok();
                let found = self.servers.iter().position(|s| {
                    irc_eq(&s.raw, wanted)
                }).or_else(|| by_index.and_then(|n| n.checked_sub(1)).filter(|n| *n < self.servers.len()));

                match found {
                    Some(index) => Some(index),
                    None if self.class.allow_jump_new => {
                        debug!(server = wanted, "New server from JUMP");
                        self.servers.push(crate::config::ServerSpec::parse(
                            wanted,
                            self.class.server_port,
                        ));
                        Some(self.servers.len() - 1)
                    }
                    None => None,
                }
            }
            None => {
                // Next server in the list
                if self.servers.is_empty() {
                    None
                } else {
                    Some((self.cursor + 1) % self.servers.len())
                }
            }
        };

        match target {
            Some(index) => {
                debug!(server = %self.servers[index].raw, "Jumping");
                self.cursor = index;
                self.connect_again().await;
                true
            }
            None => {
                self.send_numeric(402, ":No such server, use /DIRCPROXY SERVERS to see them");
                false
            }
        }
    }

    fn cmd_status(&mut self) {
        let mut lines = vec![
            format!("{} {} status:", PACKAGE, VERSION),
            format!("- Nickname on server: {}", self.nickname),
            format!("- Nickname to guard: {}", self.set_nickname),
            format!("- Username for server: {}", self.username),
            format!(
                "- Hostname for server: {}",
                self.hostname.as_deref().unwrap_or("(unknown)")
            ),
            format!("- Real name for server: {}", self.realname),
            "-".to_owned(),
        ];

        lines.push(format!(
            "- Client status: {}",
            if self.cstat.is_ready() { "Ready" } else { "" }
        ));
        if !self.cstat.is_active() {
            if self.cstat.connected {
                lines.push("-   Connected".to_owned());
            }
            if self.cstat.got_nick {
                lines.push("-   Received nickname".to_owned());
            }
            if self.cstat.got_user {
                lines.push("-   Received user information".to_owned());
            }
            if self.cstat.authed {
                lines.push("-   Authorised".to_owned());
            }
            if self.cstat.sent_welcome {
                lines.push("-   Welcomed".to_owned());
            }
        }
        lines.push("-".to_owned());

        lines.push(format!(
            "- Server status: {}",
            if self.sstat.is_ready() { "Ready" } else { "" }
        ));
        if !self.sstat.is_active() {
            if self.sstat.created {
                lines.push("-   Created".to_owned());
            }
            if self.sstat.seen {
                lines.push("-   Seen".to_owned());
            }
            if self.sstat.connected {
                lines.push("-   Connected".to_owned());
            }
            if self.sstat.introduced {
                lines.push("-   Introduced ourselves".to_owned());
            }
            if self.sstat.got_welcome {
                lines.push("-   Have been welcomed".to_owned());
            }
        }
        lines.push("-".to_owned());

        lines.push("- Servers.  Current marked by '->'".to_owned());
        for (index, spec) in self.servers.iter().enumerate() {
            let marker = if index == self.cursor { ">" } else { " " };
            lines.push(format!("-{}  {}", marker, spec));
        }
        lines.push("-".to_owned());

        lines.push("- Channels".to_owned());
        for channel in &self.channels {
            let mut line = format!("-   {}", channel.name);
            if let Some(ref key) = channel.key {
                line.push_str(&format!(" (key: {})", key));
            }
            if channel.inactive {
                line.push_str(" (removed by force)");
            }
            if channel.unjoined {
                line.push_str(" (left on detach)");
            }
            lines.push(line);
        }
        lines.push("-".to_owned());

        lines.push("- Advanced:".to_owned());
        lines.push(format!("-   Allow MOTD: {}", self.allow_motd));
        lines.push(format!("-   Allow PONG: {}", self.allow_pong));
        lines.push(format!("-   411 squelch: {}", self.squelch_411));
        lines.push(format!("-   Expecting NICK: {}", self.expecting_nick));
        if !self.squelch_modes.is_empty() {
            lines.push("-   Squelching mode changes:".to_owned());
            for channel in &self.squelch_modes {
                lines.push(format!("-     {}", channel));
            }
        }

        for line in lines {
            self.send_notice(line);
        }
    }

    fn cmd_recall(&mut self, msg: &Message) {
        let mut source: Option<String> = None;
        let mut start: i64 = -1;
        let mut lines: i64 = 0;

        let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());

        match msg.params.len() {
            0 | 1 => {
                self.send_numeric(461, ":Not enough parameters");
                return;
            }
            2 => {
                if irc_eq(&msg.params[1], "ALL") {
                    lines = -1;
                } else {
                    lines = msg.params[1].parse().unwrap_or(0);
                }
            }
            3 => {
                if irc_eq(&msg.params[2], "ALL") {
                    source = Some(msg.params[1].clone());
                    lines = -1;
                } else if digits(&msg.params[1]) {
                    start = msg.params[1].parse().unwrap_or(0);
                    lines = msg.params[2].parse().unwrap_or(0);
                } else {
                    source = Some(msg.params[1].clone());
                    lines = msg.params[2].parse().unwrap_or(0);
                }
            }
            _ => {
                source = Some(msg.params[1].clone());
                start = msg.params[2].parse().unwrap_or(0);
                lines = msg.params[3].parse().unwrap_or(0);
            }
        }

        // Work out which log, the recall target, and any nickname filter
        let mut filter: Option<String> = None;
        enum Which {
            Server,
            Private,
            Channel(usize),
        }
        let which = match source {
            Some(ref s) if irc_eq(s, "SERVER") => Which::Server,
            Some(ref s) => match self.channel_index(s) {
                Some(index) => Which::Channel(index),
                None => {
                    filter = Some(s.clone());
                    Which::Private
                }
            },
            None => Which::Private,
        };

        let (entries, to) = match which {
            Which::Server => (self.server_log.entries(), self.nickname.clone()),
            Which::Private => (self.private_log.entries(), self.nickname.clone()),
            Which::Channel(index) => (
                self.channels[index].log.entries(),
                self.channels[index].name.clone(),
            ),
        };
        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => {
                self.send_notice(format!("Couldn't open log file: {}", e));
                return;
            }
        };

        let total = entries.len() as i64;
        let (start, lines) = if lines == -1 {
            (0, total)
        } else if start == -1 {
            ((total - lines).max(0), lines)
        } else {
            (start, lines)
        };

        let nick = self.nickname.clone();
        let style = RecallStyle {
            package: PACKAGE,
            to: &to,
            nickname: &nick,
            timestamp: self.class.log_timestamp,
            relativetime: self.class.log_relativetime,
        };
        let rendered = crate::logs::recall_lines(
            &entries,
            start.max(0) as u64,
            Some(lines.max(0) as u64),
            &style,
            filter.as_deref(),
        );
        for line in rendered {
            self.send_client_raw(line);
        }
    }

    fn cmd_help(&mut self, msg: &Message) {
        let topic = msg.param(1).map(str::to_ascii_uppercase);

        let page: &[&str] = match topic.as_deref() {
            Some("RECALL") => &[
                "RECALL [<from>] [<start>] <lines>|ALL",
                "Resend messages from the log files.  With a channel name",
                "or nickname, only that conversation is recalled.",
            ],
            Some("PERSIST") if self.class.allow_persist => &[
                "PERSIST",
                "Keep the session connected after this client detaches.",
            ],
            Some("RELOAD") => &["RELOAD", "Reload the configuration file."],
            Some("DETACH") => &[
                "DETACH [<away message>]",
                "Detach from the session, leaving it connected.",
            ],
            Some("QUIT") => &["QUIT [<message>]", "Detach and end the session."],
            Some("MOTD") => &["MOTD", "Show the message of the day."],
            Some("DIE") if self.class.allow_die => {
                &["DIE", "Terminate the whole bouncer."]
            }
            Some("SERVERS") => &["SERVERS", "List the servers for this session."],
            Some("JUMP") if self.class.allow_jump => &[
                "JUMP [<server>|<number>]",
                "Drop the server connection and connect to another.",
            ],
            Some("HOST") if self.class.allow_host => &[
                "HOST [<hostname>|none]",
                "Change the local address used for the server connection.",
            ],
            Some("STATUS") => &["STATUS", "Show session state in detail."],
            Some("USERS") if self.class.allow_users => {
                &["USERS", "List the sessions on this bouncer."]
            }
            Some("KILL") if self.class.allow_kill => {
                &["KILL <user>", "Terminate another session."]
            }
            Some("NOTIFY") if self.class.allow_notify => {
                &["NOTIFY <user> <text>", "Send a notice to another session."]
            }
            Some("GET") => &["GET [<setting>]", "Show a configuration value."],
            Some("SET") => &["SET <setting> [<value>]", "Change a configuration value."],
            Some("HELP") => &["HELP [<command>]", "This."],
            _ => &[],
        };

        let mut lines = vec![format!("{} {} help", PACKAGE, VERSION)];
        if page.is_empty() {
            lines.push("- Commands:".to_owned());
            lines.push("-     HELP      (help on /dircproxy commands)".to_owned());
            lines.push("-     MOTD      (show the message of the day)".to_owned());
            lines.push("-     STATUS    (show status information)".to_owned());
            lines.push("-     RECALL    (recall text from log files)".to_owned());
            lines.push("-     GET       (get a configuration value)".to_owned());
            lines.push("-     SET       (set a configuration value)".to_owned());
            lines.push("-     RELOAD    (reload configuration file)".to_owned());
            lines.push("-     DETACH    (detach from the session)".to_owned());
            if self.class.allow_persist {
                lines.push("-     PERSIST   (keep session after detach)".to_owned());
            }
            lines.push("-     QUIT      (end the session)".to_owned());
            if self.class.allow_die {
                lines.push("-     DIE       (terminate the bouncer)".to_owned());
            }
            if self.class.allow_users {
                lines.push("-     USERS     (show sessions)".to_owned());
            }
            if self.class.allow_kill {
                lines.push("-     KILL      (terminate a session)".to_owned());
            }
            if self.class.allow_notify {
                lines.push("-     NOTIFY    (send a notice to a session)".to_owned());
            }
            lines.push("-     SERVERS   (show the server list)".to_owned());
            if self.class.allow_jump {
                lines.push("-     JUMP      (jump to a different server)".to_owned());
            }
            if self.class.allow_host {
                lines.push("-     HOST      (change your visible hostname)".to_owned());
            }
        } else {
            for text in page {
                lines.push(format!("- {}", text));
            }
        }
        lines.push("-".to_owned());

        for line in lines {
            self.send_notice(line);
        }
    }
}
