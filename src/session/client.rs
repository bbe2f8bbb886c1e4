//! Client-side handling: commands from the attached client, the detach
//! and attach transitions, and the replayed welcome.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tracing::debug;

use crate::dcc::{self, DccRequest, DccTaskKind};
use crate::logs::{LogEvent, RecallStyle};
use crate::{PACKAGE, VERSION};
use slbnc_proto::ctcp::{frame, replace_payload, strip_ctcp, CtcpMessage};
use slbnc_proto::dcc::DccOffer;
use slbnc_proto::Message;

use super::{ClientHandoff, ClientLink, LogTarget, Session};

/// Logo shown at the top of the message of the day.
const MOTD_LOGO: &[&str] = &[
    "     _ _                   _",
    " ___| | |__  _ __   ___ __| |",
    "/ __| | '_ \\| '_ \\ / __/ _` |",
    "\\__ \\ | |_) | | | | (_| (_| |",
    "|___/_|_.__/|_| |_|\\___\\__,_|",
];

impl Session {
    /// One line from the attached client.
    pub(crate) async fn on_client_line(&mut self, line: String) {
        let Ok(msg) = Message::parse(&line) else {
            return;
        };
        let command = msg.command.to_ascii_uppercase();

        if !self.cstat.got_nick {
            // Nickname was lost to the server; only NICK makes progress
            if command == "NICK" {
                match msg.param(0) {
                    Some(nick) => {
                        let nick = nick.to_owned();
                        self.change_nick(nick);
                    }
                    None => self.send_numeric(431, ":No nickname given"),
                }
            } else {
                self.send_notice("Please send a /NICK command");
            }
        } else if self.server_active() {
            // Handled commands are not passed to the server unless the
            // handler clears the squelch
            let mut squelch = true;
            match command.as_str() {
                "PASS" | "USER" | "PONG" => {}
                "DIRCPROXY" => {}
                "QUIT" => {
                    // The user wants to detach
                    self.announce_status();
                    self.send_error(&format!("Detached from {} {}", PACKAGE, VERSION));
                    self.detach(None).await;
                    return;
                }
                "NICK" => match msg.param(0) {
                    Some(nick) => {
                        let nick = nick.to_owned();
                        self.change_nick(nick);
                    }
                    None => self.send_numeric(431, ":No nickname given"),
                },
                "AWAY" => {
                    squelch = false;
                    // ircII marks back with an empty parameter
                    match msg.param(0).filter(|a| !a.is_empty()) {
                        Some(away) => self.away = Some(away.to_owned()),
                        None => self.away = None,
                    }
                }
                "MOTD" => {
                    self.allow_motd = true;
                    squelch = false;
                }
                "PING" => {
                    self.allow_pong = true;
                    squelch = false;
                }
                "PRIVMSG" => {
                    squelch = self.client_privmsg(&msg).await;
                }
                "NOTICE" => {
                    if msg.params.len() >= 2 {
                        let (clean, _) = strip_ctcp(&msg.params[1]);
                        if !clean.is_empty() {
                            let from = self.self_prefix();
                            let target = msg.params[0].clone();
                            self.log_event(
                                LogEvent::Notice,
                                LogTarget::Name(&target),
                                &from,
                                clean,
                            );
                        }
                    }
                    self.reset_idle();
                    squelch = false;
                }
                _ => squelch = false,
            }

            if !squelch {
                self.send_server(line.clone());
            }
        } else if command != "DIRCPROXY" {
            // Not handled, won't be handled: RPL_TRYAGAIN
            self.send_numeric(
                263,
                &format!("{} :Please wait a while and try again.", msg.command),
            );
        }

        if command == "DIRCPROXY" {
            if self.handle_dircproxy(&msg).await {
                return;
            }
        }

        self.ensure_server_connection();
    }

    /// The client's PRIVMSG: log it, intercept outgoing DCC offers, and
    /// forward what remains.  Returns whether the original was consumed.
    async fn client_privmsg(&mut self, msg: &Message) -> bool {
        if msg.params.len() < 2 {
            self.reset_idle();
            return false;
        }
        let target = msg.params[0].clone();
        let (clean, payloads) = strip_ctcp(&msg.params[1]);

        if !clean.is_empty() {
            let from = self.self_prefix();
            self.log_event(LogEvent::Message, LogTarget::Name(&target), &from, clean);
        }

        let mut body = msg.params[1].clone();
        for payload in payloads {
            let Some(ctcp) = CtcpMessage::parse(&payload) else {
                continue;
            };

            if ctcp.is("ACTION") {
                let from = self.self_prefix();
                let text = ctcp.text.clone().unwrap_or_default();
                self.log_event(LogEvent::Action, LogTarget::Name(&target), &from, text);
            } else if ctcp.is("DCC") && self.class.dcc_proxy_outgoing {
                body = self.rewrite_outgoing_dcc(&target, &payload, &ctcp, body).await;
            } else {
                let from = self.self_prefix();
                let text = format!("Sent CTCP {}", ctcp.command);
                self.log_event(LogEvent::Ctcp, LogTarget::Name(&target), &from, text);
            }
        }

        if !body.is_empty() {
            self.send_server(format!("PRIVMSG {} :{}", target, body));
        }
        self.reset_idle();
        true
    }

    /// Rewrite an outgoing DCC offer so the peer connects back through
    /// us, advertising our server-visible address.
    async fn rewrite_outgoing_dcc(
        &mut self,
        target: &str,
        payload: &str,
        ctcp: &CtcpMessage,
        body: String,
    ) -> String {
        let Some(offer) = DccOffer::from_ctcp(ctcp) else {
            if let Some(sub) = ctcp.param(0) {
                debug!(sub, "Unknown or unimplemented DCC request");
            }
            return body;
        };

        // Visible address comes from our server-side socket
        let local_ip = self.server.as_ref().and_then(|link| {
            match link.framed.get_ref().local_addr() {
                Ok(addr) => match addr.ip() {
                    IpAddr::V4(ip) => Some(ip),
                    IpAddr::V6(_) => None,
                },
                Err(_) => None,
            }
        });
        let Some(local_ip) = local_ip else {
            return body;
        };

        let remote = if self.class.dcc_tunnel_outgoing > 0 {
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.class.dcc_tunnel_outgoing)
        } else {
            SocketAddrV4::new(offer.endpoint.addr, offer.endpoint.port)
        };

        let kind = match offer.kind {
            slbnc_proto::DccOfferKind::Chat => DccTaskKind::Chat,
            slbnc_proto::DccOfferKind::Send => {
                if self.class.dcc_send_fast {
                    DccTaskKind::SendFast
                } else {
                    DccTaskKind::SendSimple
                }
            }
        };

        let reject_notice = format!(
            ":{} NOTICE {} :\x01DCC REJECT {} {}",
            target,
            self.nickname,
            offer.kind.as_str(),
            offer.argument
        );

        let request = DccRequest {
            kind,
            remote,
            ports: self.class.dcc_port_ranges(),
            timeout: Duration::from_secs(self.class.dcc_proxy_timeout),
            capture_maxsize_kb: 0,
            events: self.dcc_tx.clone(),
            reject_notice: reject_notice.clone(),
            reject_to_server: false,
        };

        match dcc::spawn(request).await {
            Ok(port) => {
                let rewritten = offer.rewritten(local_ip, port);
                let from = self.self_prefix();
                let text = format!("Sent DCC {} Request", offer.kind.as_str());
                self.log_event(LogEvent::Ctcp, LogTarget::Name(target), &from, text);
                replace_payload(&body, payload, &frame(&rewritten)).unwrap_or(body)
            }
            Err(e) => {
                debug!(error = %e, "Couldn't establish outgoing DCC proxy");
                self.send_dcc_reject(&reject_notice, Some("Couldn't establish proxy"), false);
                replace_payload(&body, payload, "").unwrap_or(body)
            }
        }
    }

    /// The client socket dropped without a QUIT: detach (or die, for
    /// sessions that cannot be reattached).
    pub(crate) async fn client_gone(&mut self, bad: bool) {
        if self.client.is_none() {
            return;
        }
        if bad {
            debug!("Client socket error");
        } else {
            debug!("Client disconnected");
        }
        self.detach(None).await;
    }

    /// Detach the client, keeping the server connection alive (unless the
    /// session is `die_on_close`).
    pub(crate) async fn detach(&mut self, away: Option<&str>) {
        if self.die_on_close {
            debug!("Killing proxy");
            let quit = away
                .map(str::to_owned)
                .or_else(|| self.quit_message.clone())
                .unwrap_or_else(|| format!("Leaving IRC - {} {}", PACKAGE, VERSION));
            if self.sstat.created {
                self.send_server(format!("QUIT :{}", quit));
                let _ = self.flush().await;
            }
            self.close_server_sock();
            self.close_client().await;
            self.dead = true;
            return;
        }

        debug!("Detaching proxy");
        let was_active = self.client_active();

        if was_active {
            self.log_event(
                LogEvent::Client,
                LogTarget::All,
                PACKAGE,
                "You disconnected".to_owned(),
            );
        }

        // Drop modes
        if was_active {
            if let Some(drop) = self.class.drop_modes.clone() {
                let change = format!("-{}", drop);
                debug!(change = %change, "Auto-mode-change");
                self.apply_umode_change(&change);
                if self.server_active() {
                    let nick = self.nickname.clone();
                    self.send_server(format!("MODE {} {}", nick, change));
                }
            }
        }

        // Tell the channels
        if was_active && self.server_active() {
            if let Some(message) = self.detach_message.clone() {
                let names: Vec<String> = self
                    .channels
                    .iter()
                    .filter(|c| !c.inactive && !c.unjoined)
                    .map(|c| c.name.clone())
                    .collect();
                for name in names {
                    self.send_channel_message(&name, &message);
                }
            }
        }

        // Leave channels until the client comes back
        if was_active && self.server_active() && self.class.channel_leave_on_detach {
            let names: Vec<String> = self
                .channels
                .iter()
                .filter(|c| !c.inactive && !c.unjoined)
                .map(|c| c.name.clone())
                .collect();
            for name in names {
                self.send_server(format!("PART :{}", name));
                if self.class.channel_rejoin_on_attach {
                    if let Some(index) = self.channel_index(&name) {
                        self.channels[index].unjoined = true;
                    }
                } else {
                    self.del_channel(&name);
                }
            }
        }

        // Away message
        if was_active && self.server_active() {
            if let Some(away) = away {
                self.send_server(format!("AWAY :{}", away));
            } else if self.away.is_none() {
                if let Some(message) = self.away_message_cfg.clone() {
                    self.send_server(format!("AWAY :{}", message));
                }
            }
        }

        // Detach nickname
        if was_active {
            if let Some(pattern) = self.detach_nickname.clone() {
                let new_nick = match pattern.find('*') {
                    Some(at) => format!("{}{}{}", &pattern[..at], self.nickname, &pattern[at + 1..]),
                    None => pattern,
                };
                debug!(nick = %new_nick, "Auto-nick-change");
                self.old_nickname = Some(self.set_nickname.clone());
                self.set_nickname = new_nick.clone();
                self.change_nick(new_nick);
            }
        }

        // Open the logs that only run while detached
        if was_active {
            if self.class.private_log_enabled && !self.class.private_log_always {
                if self.private_log.open().is_err() {
                    self.send_notice("(warning) Unable to log private messages");
                }
            }
            if self.class.server_log_enabled && !self.class.server_log_always {
                if self.server_log.open().is_err() {
                    self.send_notice("(warning) Unable to log server messages");
                }
            }
            if self.class.chan_log_enabled && !self.class.chan_log_always {
                let mut failed = Vec::new();
                for channel in &mut self.channels {
                    if channel.log.open().is_err() {
                        failed.push(channel.name.clone());
                    }
                }
                for name in failed {
                    self.send_notice(format!("(warning) Unable to log channel: {}", name));
                }
            }
        }

        self.close_client().await;
        self.update_info();
    }

    /// Flush and drop the client socket.
    pub(crate) async fn close_client(&mut self) {
        self.timers.cancel("client_connect");
        let _ = self.flush().await;
        self.client = None;
        self.cstat.connected = false;
        self.cstat.authed = false;
        self.cstat.sent_welcome = false;

        if !self.cstat.got_nick || !self.cstat.got_user {
            if self.sstat.created {
                self.send_server(format!(
                    "QUIT :I shouldn't really be here - {} {}",
                    PACKAGE, VERSION
                ));
                let _ = self.flush().await;
                self.close_server_sock();
            }
            self.dead = true;
        }
        self.update_info();
    }

    /// A freshly authenticated client arrived for this session.
    pub(crate) async fn on_attach(&mut self, handoff: ClientHandoff) {
        if self.client.is_some() && self.cstat.connected {
            if self.class.disconnect_existing {
                debug!("Already connected, disconnecting existing client");
                self.send_error("Collided with new user");
                let _ = self.flush().await;
                self.client = None;
            } else {
                debug!("Already connected, refusing incoming client");
                let mut framed = handoff.framed;
                use futures_util::SinkExt;
                let _ = framed
                    .send(format!(
                        "ERROR :Closing Link: {}[{}@{}] (Already connected)",
                        handoff.nickname, handoff.username, handoff.host
                    ))
                    .await;
                return;
            }
        }

        debug!("Attaching new client to existing session");
        self.client = Some(ClientLink {
            framed: handoff.framed,
            out: VecDeque::new(),
        });
        self.client_host = Some(handoff.host);
        self.cstat.connected = true;
        self.cstat.authed = true;
        self.cstat.got_nick = true;
        self.cstat.got_user = true;
        self.cstat.sent_welcome = false;

        // If the connecting client disagrees about its nickname, fix it
        if handoff.nickname != self.nickname {
            let nick = self.nickname.clone();
            self.send_selfcmd("NICK", &format!(":{}", nick));
        }

        // Restore the nickname stashed at detach
        if let Some(old) = self.old_nickname.take() {
            if old != self.nickname {
                self.change_nick(old);
            }
        }

        if let Some(password) = self.class.nickserv_password.clone() {
            if self.server_ready() {
                self.send_server(format!("PRIVMSG NICKSERV :IDENTIFY {}", password));
            }
        }

        // Unset the away message if it was ours
        if self.away.is_none() && self.server_active() && self.away_message_cfg.is_some() {
            self.send_server("AWAY".to_owned());
        }

        // Rejoin channels we left at detach
        if self.server_active() {
            let rejoin: Vec<(String, Option<String>)> = self
                .channels
                .iter()
                .filter(|c| c.unjoined)
                .map(|c| (c.name.clone(), c.key.clone()))
                .collect();
            for (name, key) in rejoin {
                match key {
                    Some(key) => self.send_server(format!("JOIN {} :{}", name, key)),
                    None => self.send_server(format!("JOIN :{}", name)),
                }
            }

            if let Some(message) = self.attach_message.clone() {
                let names: Vec<String> = self
                    .channels
                    .iter()
                    .filter(|c| !c.inactive)
                    .map(|c| c.name.clone())
                    .collect();
                for name in names {
                    self.send_channel_message(&name, &message);
                }
            }
        }

        if self.server_active() && !self.cstat.sent_welcome {
            self.welcome();
        }
        self.update_info();
        self.ensure_server_connection();
    }

    /// Replay the welcome burst, MOTD, mode and away state, and the logs.
    pub(crate) fn welcome(&mut self) {
        let nick = self.nickname.clone();
        self.send_numeric(
            1,
            &format!(":Welcome to the Internet Relay Network {}", nick),
        );
        let server_name = self.server_display_name();
        let version = self
            .server_version
            .clone()
            .unwrap_or_else(|| "(unknown)".to_owned());
        self.send_numeric(
            2,
            &format!(
                ":Your host is {} running {} via {} {}",
                server_name, version, PACKAGE, VERSION
            ),
        );
        let started = self.start_time.format("%a, %d %b %Y %H:%M:%S %z").to_string();
        self.send_numeric(3, &format!(":This proxy has been running since {}", started));
        if let (Some(version), Some(umodes), Some(cmodes)) = (
            self.server_version.clone(),
            self.server_umodes.clone(),
            self.server_cmodes.clone(),
        ) {
            self.send_numeric(
                4,
                &format!("{} {} {} {}", server_name, version, umodes, cmodes),
            );
        }
        for supported in self.server_supported.clone() {
            self.send_numeric(5, &supported);
        }

        self.motd();

        if let Some(modes) = self.modes_string() {
            let nick = self.nickname.clone();
            self.send_selfcmd("MODE", &format!("{} +{}", nick, modes));
        }

        if let Some(away) = self.away.clone() {
            // No client expects AWAY from a server; remind them with a 306
            self.send_numeric(
                306,
                &format!(":You left yourself away.  Your message was: {}", away),
            );
        }

        // Server log
        if self.class.server_log_enabled {
            self.autorecall_server();
            if !self.class.server_log_always {
                self.server_log.close();
            }
        }

        // Channels: synthetic self-JOIN, upstream TOPIC and NAMES, recall
        let names: Vec<String> = self
            .channels
            .iter()
            .filter(|c| !c.inactive && !c.unjoined)
            .map(|c| c.name.clone())
            .collect();
        for name in names {
            self.send_selfcmd("JOIN", &format!(":{}", name));
            self.send_server(format!("TOPIC :{}", name));
            self.send_server(format!("NAMES :{}", name));

            if self.class.chan_log_enabled {
                self.autorecall_channel(&name);
                if !self.class.chan_log_always {
                    if let Some(index) = self.channel_index(&name) {
                        self.channels[index].log.close();
                    }
                }
            }
        }

        // Private log
        if self.class.private_log_enabled {
            self.autorecall_private();
            if !self.class.private_log_always {
                self.private_log.close();
            }
        }

        self.log_event(
            LogEvent::Client,
            LogTarget::All,
            PACKAGE,
            "You connected".to_owned(),
        );
        self.announce_status();
        self.cstat.sent_welcome = true;
    }

    /// Tell the client whether it can come back.
    pub(crate) fn announce_status(&mut self) {
        if self.die_on_close {
            if self.client_ready() {
                self.send_notice("You cannot reconnect to this session");
            }
        }
    }

    // ------------------------------------------------------------------
    // Log recall
    // ------------------------------------------------------------------

    /// How many lines autorecall replays for a log: `-1` means all unless
    /// the log is always-on (where replaying the full history every
    /// attach would drown the client).
    fn autorecall_window(recall: i64, always: bool, nlines: u64) -> Option<(u64, u64)> {
        match recall {
            0 => None,
            -1 if always => None,
            -1 => Some((0, nlines)),
            n => {
                let n = n as u64;
                let start = nlines.saturating_sub(n);
                Some((start, nlines - start))
            }
        }
    }

    fn autorecall_server(&mut self) {
        let recall = self.class.server_log_recall;
        let always = self.class.server_log_always;
        let Some((start, lines)) =
            Self::autorecall_window(recall, always, self.server_log.nlines())
        else {
            return;
        };
        let entries = match self.server_log.entries() {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let nick = self.nickname.clone();
        let style = RecallStyle {
            package: PACKAGE,
            to: &nick,
            nickname: &nick,
            timestamp: self.class.log_timestamp,
            relativetime: self.class.log_relativetime,
        };
        let lines = crate::logs::recall_lines(&entries, start, Some(lines), &style, None);
        for line in lines {
            self.send_client_raw(line);
        }
    }

    pub(crate) fn autorecall_channel(&mut self, name: &str) {
        let recall = self.class.chan_log_recall;
        let always = self.class.chan_log_always;
        let Some(index) = self.channel_index(name) else {
            return;
        };
        let Some((start, lines)) =
            Self::autorecall_window(recall, always, self.channels[index].log.nlines())
        else {
            return;
        };
        let entries = match self.channels[index].log.entries() {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let nick = self.nickname.clone();
        let channel = self.channels[index].name.clone();
        let style = RecallStyle {
            package: PACKAGE,
            to: &channel,
            nickname: &nick,
            timestamp: self.class.log_timestamp,
            relativetime: self.class.log_relativetime,
        };
        let lines = crate::logs::recall_lines(&entries, start, Some(lines), &style, None);
        for line in lines {
            self.send_client_raw(line);
        }
    }

    fn autorecall_private(&mut self) {
        let recall = self.class.private_log_recall;
        let always = self.class.private_log_always;
        let Some((start, lines)) =
            Self::autorecall_window(recall, always, self.private_log.nlines())
        else {
            return;
        };
        let entries = match self.private_log.entries() {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let nick = self.nickname.clone();
        let style = RecallStyle {
            package: PACKAGE,
            to: &nick,
            nickname: &nick,
            timestamp: self.class.log_timestamp,
            relativetime: self.class.log_relativetime,
        };
        let lines = crate::logs::recall_lines(&entries, start, Some(lines), &style, None);
        for line in lines {
            self.send_client_raw(line);
        }
    }

    // ------------------------------------------------------------------
    // Message of the day
    // ------------------------------------------------------------------

    /// Compose the bouncer's message of the day: logo, custom file, and
    /// session statistics.
    pub(crate) fn motd(&mut self) {
        let file_text = self
            .class
            .motd_file
            .as_deref()
            .and_then(|path| std::fs::read_to_string(path).ok());

        if !self.class.motd_logo && !self.class.motd_stats && file_text.is_none() {
            if self.class.motd_file.is_some() {
                self.send_numeric(422, ":MOTD File is missing");
            } else {
                self.send_numeric(422, ":No MOTD");
            }
            return;
        }

        self.send_numeric(375, &format!(":- {} Message of the Day -", PACKAGE));

        if self.class.motd_logo {
            for line in MOTD_LOGO {
                self.send_numeric(372, &format!(":- {}", line));
            }
            self.send_numeric(
                372,
                &format!(":- Straylight IRC Bouncer, version {}", VERSION),
            );
            self.send_numeric(372, ":-");
        }

        if let Some(text) = file_text {
            for line in text.lines() {
                self.send_numeric(372, &format!(":- {}", line.trim_end()));
            }
            self.send_numeric(372, ":-");
        }

        if self.class.motd_stats {
            self.motd_stats();
        }

        self.send_numeric(376, ":End of /MOTD command");
    }

    fn recall_summary(recall: i64, nlines: u64) -> String {
        match recall {
            -1 => (if nlines > 0 { "all" } else { "none" }).to_owned(),
            0 => "none".to_owned(),
            n if n as u64 >= nlines => "all".to_owned(),
            n => n.to_string(),
        }
    }

    fn motd_stats(&mut self) {
        let plural = |n: u64| if n == 1 { "" } else { "s" };

        if self.private_log.is_made() {
            let n = self.private_log.nlines();
            let summary = Self::recall_summary(self.class.private_log_recall, n);
            self.send_numeric(
                372,
                &format!(
                    ":- {} private message{} ({} will be sent)",
                    n,
                    plural(n),
                    summary
                ),
            );
            self.send_numeric(372, ":-");
        }

        if self.server_log.is_made() {
            let n = self.server_log.nlines();
            let summary = Self::recall_summary(self.class.server_log_recall, n);
            self.send_numeric(
                372,
                &format!(
                    ":- {} server message{} ({} will be sent)",
                    n,
                    plural(n),
                    summary
                ),
            );
            self.send_numeric(372, ":-");
        }

        if !self.channels.is_empty() {
            let summaries: Vec<String> = self
                .channels
                .iter()
                .map(|c| {
                    if c.inactive {
                        if c.log.nlines() > 0 {
                            format!(":- was on {} but removed by force", c.name)
                        } else {
                            format!(":- yet to join {}", c.name)
                        }
                    } else if c.unjoined {
                        format!(":- was on {}, yet to rejoin", c.name)
                    } else if c.log.is_made() {
                        let n = c.log.nlines();
                        let summary = Self::recall_summary(self.class.chan_log_recall, n);
                        format!(
                            ":- {}. {} line{} logged. ({} will be sent)",
                            c.name,
                            n,
                            plural(n),
                            summary
                        )
                    } else {
                        format!(":- {} (not logged)", c.name)
                    }
                })
                .collect();
            for summary in summaries {
                self.send_numeric(372, &summary);
            }
            self.send_numeric(372, ":-");
        }
    }
}
