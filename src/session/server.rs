//! Server-side handling: numerics, channel tracking, squelching, nickname
//! repair, and the incoming CTCP/DCC pipeline.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;
use tracing::debug;

use crate::dcc::{self, DccRequest, DccTaskKind};
use crate::logs::LogEvent;
use crate::{PACKAGE, VERSION};
use slbnc_proto::ctcp::{frame, replace_payload, strip_ctcp, CtcpMessage};
use slbnc_proto::dcc::DccOffer;
use slbnc_proto::{irc_eq, Message, Prefix};

use super::{LogTarget, ResumeRequest, Session};

/// Time/date format for CTCP TIME replies.
const CTCP_TIMEDATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S %z";

impl Session {
    /// One line from the server.
    pub(crate) async fn on_server_line(&mut self, line: String) {
        let Ok(msg) = Message::parse(&line) else {
            return;
        };

        // Messages without a source come from our peer, the server
        let source = msg
            .prefix
            .clone()
            .unwrap_or_else(|| Prefix::server(&self.server_display_name()));

        let mut squelch = true;
        let mut important = false;

        // 437 is bizarre: it either means our nickname is juped (treat as
        // a 433) or a channel is (treat as a 471)
        let mut command = msg.command.to_ascii_uppercase();
        if command == "437" && msg.params.len() >= 2 {
            command = if irc_eq(&self.nickname, msg.param(1).unwrap_or("")) {
                "433".to_owned()
            } else {
                "471".to_owned()
            };
        }

        match command.as_str() {
            "001" => {
                // Use 001 to learn the server's name
                if !source.is_user() {
                    self.server_name = Some(source.name.clone());
                    self.update_info();
                }
            }
            "002" | "003" => {}
            "004" => self.on_welcome(&msg),
            "005" => {
                squelch = false;
                self.on_isupport(&msg).await;
            }
            "375" | "372" => {
                if self.allow_motd {
                    squelch = false;
                }
            }
            "376" | "422" => {
                if self.allow_motd {
                    squelch = false;
                    self.allow_motd = false;
                }
            }
            "431" | "432" | "433" | "436" | "438" => {
                squelch = self.on_nick_error(&msg, &line);
            }
            "471" | "473" | "474" => {
                if msg.params.len() >= 2 {
                    let channel = msg.params[1].clone();
                    if !self.client_active() {
                        // No client connected, rejoin it ourselves
                        if let Some(index) = self.channel_index(&channel) {
                            self.channels[index].inactive = true;
                            self.schedule_rejoin(&channel);
                        }
                    } else {
                        self.del_channel(&channel);
                    }
                    squelch = false;
                }
            }
            "403" | "405" | "475" | "476" => {
                if msg.params.len() >= 2 {
                    let channel = msg.params[1].clone();
                    if self.channel_index(&channel).is_some() {
                        if !self.client_active() {
                            let reason = match msg.param(2) {
                                Some(text) => format!(
                                    "Couldn't rejoin {}: {} ({})",
                                    channel, text, msg.command
                                ),
                                None => {
                                    format!("Couldn't rejoin {} ({})", channel, msg.command)
                                }
                            };
                            self.log_event(
                                LogEvent::Fault,
                                LogTarget::Server,
                                PACKAGE,
                                reason,
                            );
                            if let Some(index) = self.channel_index(&channel) {
                                self.channels[index].unjoined = true;
                            }
                        } else {
                            self.del_channel(&channel);
                        }
                    }
                    squelch = false;
                }
            }
            "411" => {
                // The reply to our own anti-idle probe is suppressed
                if self.squelch_411 {
                    self.squelch_411 = false;
                } else {
                    squelch = false;
                }
            }
            "324" => {
                if msg.params.len() >= 2 {
                    squelch = false;
                    let channel = msg.params[1].clone();
                    if let Some(index) = self.channel_index(&channel) {
                        if msg.params.len() >= 3 {
                            self.apply_channel_mode(index, &msg, 2);
                        } else {
                            self.channels[index].key = None;
                        }
                        if self.unsquelch_mode_reply(&channel) {
                            squelch = true;
                        }
                    }
                }
            }
            "477" => {
                // No channel modes for this channel
                if msg.params.len() >= 2 {
                    squelch = false;
                    let channel = msg.params[1].clone();
                    if let Some(index) = self.channel_index(&channel) {
                        self.channels[index].key = None;
                        if self.unsquelch_mode_reply(&channel) {
                            squelch = true;
                        }
                    }
                }
            }
            "PING" => {
                // Answer for the client, ahead of anything queued
                match (msg.param(0), msg.param(1)) {
                    (Some(first), Some(second)) => {
                        self.send_server_urgent(format!("PONG {} :{}", first, second));
                    }
                    (Some(first), None) => {
                        self.send_server_urgent(format!("PONG :{}", first));
                    }
                    _ => {}
                }
                // But let it see them
                squelch = false;
            }
            "PONG" => {
                if self.allow_pong {
                    squelch = false;
                }
                if self.class.server_pingtimeout > 0 {
                    let timeout = self.class.server_pingtimeout;
                    self.timers.cancel("server_stoned");
                    self.timers
                        .schedule("server_stoned", Duration::from_secs(timeout));
                    self.allow_pong = false;
                }
            }
            "NICK" => squelch = self.on_server_nick(&msg, &source),
            "MODE" => {
                if msg.params.len() >= 2 {
                    self.on_server_mode(&msg, &source).await;
                    squelch = false;
                }
            }
            "TOPIC" => {
                if msg.params.len() >= 2 {
                    let channel = msg.params[0].clone();
                    if self.channel_index(&channel).is_some() {
                        let text = format!(
                            "{} changed topic: {}",
                            source.full_name(),
                            msg.tail(1).unwrap_or_default()
                        );
                        let from = self.server_display_name();
                        self.log_event(LogEvent::Topic, LogTarget::Name(&channel), &from, text);
                    }
                    squelch = false;
                }
            }
            "JOIN" => squelch = self.on_server_join(&msg, &source, &line),
            "PART" => {
                if let Some(channel) = msg.param(0).map(str::to_owned) {
                    if self.msg_is_for_us(&msg.prefix) {
                        let from = self.server_display_name();
                        self.log_event(
                            LogEvent::Part,
                            LogTarget::Name(&channel),
                            &from,
                            "You left the channel".to_owned(),
                        );
                        // Server PARTs for unjoined channels are our own
                        // detach-time parts coming back to us
                        if let Some(index) = self.channel_index(&channel) {
                            if !self.channels[index].unjoined {
                                self.del_channel(&channel);
                            }
                        }
                    } else {
                        let from = self.server_display_name();
                        let text = format!("{} left the channel", source.full_name());
                        self.log_event(LogEvent::Part, LogTarget::Name(&channel), &from, text);
                    }
                    squelch = false;
                }
            }
            "KICK" => {
                if msg.params.len() >= 2 {
                    squelch = false;
                    let channel = msg.params[0].clone();
                    let victim = msg.params[1].clone();
                    let from = self.server_display_name();
                    if irc_eq(&self.nickname, &victim) {
                        let text = match msg.param(2) {
                            Some(reason) => {
                                format!("Kicked off by {}: {}", source.full_name(), reason)
                            }
                            None => format!("Kicked off by {}", source.full_name()),
                        };
                        self.log_event(LogEvent::Kick, LogTarget::Name(&channel), &from, text);

                        if !self.client_active() {
                            if let Some(index) = self.channel_index(&channel) {
                                self.channels[index].inactive = true;
                                self.schedule_rejoin(&channel);
                            }
                        } else {
                            self.del_channel(&channel);
                        }
                    } else {
                        let text = match msg.param(2) {
                            Some(reason) => format!(
                                "{} kicked off by {}: {}",
                                victim,
                                source.full_name(),
                                reason
                            ),
                            None => {
                                format!("{} kicked off by {}", victim, source.full_name())
                            }
                        };
                        self.log_event(LogEvent::Kick, LogTarget::Name(&channel), &from, text);
                    }
                }
            }
            "QUIT" => {
                let from = self.server_display_name();
                let text = match msg.param(0) {
                    Some(reason) => {
                        format!("{} quit from IRC: {}", source.full_name(), reason)
                    }
                    None => format!("{} quit from IRC", source.full_name()),
                };
                self.log_event(LogEvent::Quit, LogTarget::Server, &from, text);
                squelch = false;
            }
            "ERROR" => {
                // Important enough to always forward
                important = true;
                squelch = false;
            }
            "PRIVMSG" => {
                if msg.params.len() >= 2 {
                    self.server_privmsg(&msg, &source).await;
                } else if self.client_active() {
                    self.send_client_raw(line.clone());
                }
            }
            "NOTICE" => {
                self.server_notice(&msg, &source);
                squelch = false;
            }
            _ => squelch = false,
        }

        if !squelch
            && (self.client_active() || (important && self.cstat.connected && self.client.is_some()))
        {
            self.send_client_raw(line);
        }
    }

    /// Numeric 004: the welcome.  Capture the server's identity and then
    /// push all our state back at it.
    fn on_welcome(&mut self, msg: &Message) {
        if msg.params.len() < 5 {
            return;
        }
        self.server_name = Some(msg.params[1].clone());
        self.server_version = Some(msg.params[2].clone());
        self.server_umodes = Some(msg.params[3].clone());
        self.server_cmodes = Some(msg.params[4].clone());

        self.sstat.got_welcome = true;
        self.sstat.seen = true;
        self.attempts = 0;
        self.update_info();

        if self.client_ready() && !self.cstat.sent_welcome {
            self.welcome();
        }

        // From this moment on we assume the server is happy: restore the
        // user mode, the away message and the channel list
        if let Some(modes) = self.modes_string() {
            let nick = self.nickname.clone();
            self.send_server(format!("MODE {} +{}", nick, modes));
        }

        if let Some(away) = self.away.clone() {
            self.send_server(format!("AWAY :{}", away));
        } else if !self.cstat.authed {
            if let Some(message) = self.away_message_cfg.clone() {
                self.send_server(format!("AWAY :{}", message));
            }
        }

        let joins: Vec<(String, Option<String>)> = self
            .channels
            .iter()
            .filter(|c| !c.unjoined)
            .map(|c| (c.name.clone(), c.key.clone()))
            .collect();
        for (name, key) in joins {
            match key {
                Some(key) => self.send_server(format!("JOIN {} :{}", name, key)),
                None => self.send_server(format!("JOIN :{}", name)),
            }
        }
    }

    /// Numeric 005: either a capability line to store for replay, or a
    /// redirect to another server.
    async fn on_isupport(&mut self, msg: &Message) {
        let Some(text) = msg.tail(1) else { return };

        if let Some((host, port)) = parse_redirect(&text) {
            let spec_raw = format!("{}:{}", host, port);
            let mut index = self
                .servers
                .iter()
                .position(|s| irc_eq(&s.raw, &spec_raw) || (irc_eq(&s.host, &host) && s.port == port));

            if index.is_none() && self.class.allow_jump_new {
                debug!(server = %spec_raw, "New server because of a 005");
                self.servers
                    .push(crate::config::ServerSpec::parse(&spec_raw, self.class.server_port));
                index = Some(self.servers.len() - 1);
            }

            if let Some(index) = index {
                if self.class.allow_jump {
                    let raw = self.servers[index].raw.clone();
                    debug!(server = %raw, "Jumping because of a 005");
                    if self.client_ready() {
                        self.send_notice(format!("Got redirected to server {}", raw));
                    }
                    let text = format!(
                        "Got redirected to server {} by {}",
                        raw,
                        self.server_display_name()
                    );
                    self.log_event(LogEvent::Server, LogTarget::Server, PACKAGE, text);
                    self.cursor = index;
                    self.connect_again().await;
                }
            }
            return;
        }

        // Store for future clients, without duplicates
        if !self.server_supported.iter().any(|s| s == &text) {
            self.server_supported.push(text);
        }
    }

    /// Numerics 431/432/433/436/438: our nickname was rejected.  Returns
    /// the squelch decision.
    fn on_nick_error(&mut self, msg: &Message, line: &str) -> bool {
        if msg.params.len() < 2 {
            return false;
        }
        let old = msg.params[0].clone();
        if !old.is_empty() && old != "*" {
            // Fall back on the nickname the server still considers ours
            if self.client_active() {
                self.send_selfcmd("NICK", &format!(":{}", old));
            }
            self.nick_changed(old);
            self.check_nickname();
            false
        } else {
            // We don't have a nickname any more
            self.cstat.got_nick = false;
            if self.client.is_none() || !self.cstat.connected {
                // No client around to pick a new one; generate it
                let tried = msg.params[1].clone();
                self.regenerate_nick(&tried);
                true
            } else {
                // Pass it through for the client to fix
                self.send_client_raw(line.to_owned());
                true
            }
        }
    }

    /// A NICK from the server.
    fn on_server_nick(&mut self, msg: &Message, source: &Prefix) -> bool {
        if self.msg_is_for_us(&msg.prefix) {
            if let Some(new_nick) = msg.param(0).map(str::to_owned) {
                if new_nick != self.nickname {
                    if self.client_ready() {
                        self.send_selfcmd("NICK", &format!(":{}", new_nick));
                    }
                    self.nick_changed(new_nick.clone());
                    let from = self.server_display_name();
                    self.log_event(
                        LogEvent::NickChange,
                        LogTarget::Server,
                        &from,
                        format!("You changed your nickname to {}", new_nick),
                    );
                }

                // Was this the result of a client NICK command?
                if self.expecting_nick {
                    self.set_nickname = self.nickname.clone();
                    self.expecting_nick = false;
                }
                self.check_nickname();
            }
            true
        } else {
            if let Some(new_nick) = msg.param(0) {
                let from = self.server_display_name();
                let text = format!("{} changed nickname to {}", source.full_name(), new_nick);
                self.log_event(LogEvent::NickChange, LogTarget::Server, &from, text);
            }
            false
        }
    }

    /// A MODE from the server, for us or for a channel we track.
    async fn on_server_mode(&mut self, msg: &Message, source: &Prefix) {
        let target = msg.params[0].clone();
        if irc_eq(&self.nickname, &target) {
            let from = self.server_display_name();
            let text = format!("Your mode was changed: {}", msg.tail(1).unwrap_or_default());
            self.log_event(LogEvent::Mode, LogTarget::Server, &from, text);

            let changes: Vec<String> = msg.params[1..].to_vec();
            for change in &changes {
                self.apply_umode_change(change);
            }

            // Modes we refuse to hold drop the server connection
            if let Some(refuse) = self.class.refuse_modes.clone() {
                if self.modes.iter().any(|m| refuse.contains(*m)) {
                    debug!("Got refusal mode from server");
                    self.send_server(format!(
                        "QUIT :Don't like this server - {} {}",
                        PACKAGE, VERSION
                    ));
                    let change = format!("-{}", refuse);
                    debug!(change = %change, "Auto-mode-change");
                    self.apply_umode_change(&change);
                    let _ = self.flush().await;
                    self.server_lost().await;
                }
            }
        } else if let Some(index) = self.channel_index(&target) {
            self.apply_channel_mode(index, msg, 1);
            let from = self.server_display_name();
            let text = format!(
                "{} changed mode: {}",
                source.full_name(),
                msg.tail(1).unwrap_or_default()
            );
            self.log_event(LogEvent::Mode, LogTarget::Name(&target), &from, text);
        }
    }

    /// A JOIN from the server.
    fn on_server_join(&mut self, msg: &Message, source: &Prefix, line: &str) -> bool {
        let Some(channel) = msg.param(0).map(str::to_owned) else {
            return false;
        };

        if !self.msg_is_for_us(&msg.prefix) {
            let from = self.server_display_name();
            let text = format!("{} joined the channel", source.full_name());
            self.log_event(LogEvent::Join, LogTarget::Name(&channel), &from, text);
            return false;
        }

        let mut squelch = true;
        match self.channel_index(&channel) {
            Some(index) if self.channels[index].inactive => {
                // Must have got kicked or something; we're back now
                self.channels[index].inactive = false;
                if self.client_active() {
                    self.send_client_raw(line.to_owned());
                    if self.class.chan_log_enabled {
                        self.autorecall_channel(&channel);
                    }
                }
            }
            Some(index) if self.channels[index].unjoined => {
                // Rejoined a channel we left on detach
                self.channels[index].unjoined = false;
                squelch = false;
            }
            Some(_) => {
                // Bizarre: joined a channel we thought we were on
                squelch = false;
            }
            None => {
                self.add_channel(&channel);
                // Ask for the modes as if the client had, and hide the
                // reply it never asked for
                self.squelch_modes.push(channel.clone());
                self.send_server(format!("MODE {}", channel));
                squelch = false;
            }
        }

        if !self.client_active() {
            if let Some(message) = self.detach_message.clone() {
                self.send_channel_message(&channel, &message);
            }
        }

        let from = self.server_display_name();
        self.log_event(
            LogEvent::Join,
            LogTarget::Name(&channel),
            &from,
            "You joined the channel".to_owned(),
        );
        squelch
    }

    /// Remove a channel from the squelch-modes list; returns whether it
    /// was there (remove-once semantics).
    fn unsquelch_mode_reply(&mut self, channel: &str) -> bool {
        if let Some(position) = self
            .squelch_modes
            .iter()
            .position(|c| irc_eq(c, channel))
        {
            self.squelch_modes.remove(position);
            true
        } else {
            false
        }
    }

    // ------------------------------------------------------------------
    // Incoming PRIVMSG / NOTICE
    // ------------------------------------------------------------------

    /// An incoming PRIVMSG: log it, intercept DCC offers and answer CTCP
    /// requests while detached, and forward the remainder ourselves.
    async fn server_privmsg(&mut self, msg: &Message, source: &Prefix) {
        let target = msg.params[0].clone();
        let (clean, payloads) = strip_ctcp(&msg.params[1]);

        // Channel text goes to the destination's log, private messages to
        // the source's
        let logdest = if self.channel_index(&target).is_some() {
            target.clone()
        } else {
            source.name.clone()
        };

        if !clean.is_empty() {
            self.log_event(
                LogEvent::Message,
                LogTarget::Name(&logdest),
                &source.raw,
                clean,
            );
        }

        let mut body = msg.params[1].clone();
        for payload in payloads {
            let Some(ctcp) = CtcpMessage::parse(&payload) else {
                continue;
            };

            if ctcp.is("ACTION") {
                let text = ctcp.text.clone().unwrap_or_default();
                self.log_event(LogEvent::Action, LogTarget::Name(&logdest), &source.raw, text);
            } else if ctcp.is("DCC") && self.class.dcc_proxy_incoming {
                body = self
                    .incoming_dcc(&logdest, source, &payload, &ctcp, body)
                    .await;
            } else {
                self.offline_ctcp_reply(source, &ctcp);
            }

            // Don't log DCC or ACTION twice
            if !ctcp.is("DCC") && !ctcp.is("ACTION") {
                let text = format!("Received CTCP {}", ctcp.command);
                self.log_event(LogEvent::Ctcp, LogTarget::Name(&logdest), &source.raw, text);
            }
        }

        if !body.is_empty() && self.client_active() {
            self.send_client_raw(format!(":{} PRIVMSG {} :{}", source.raw, target, body));
        }
    }

    /// Canned CTCP replies while the client is detached.
    fn offline_ctcp_reply(&mut self, source: &Prefix, ctcp: &CtcpMessage) {
        if !self.class.ctcp_replies || self.client_active() {
            return;
        }
        let nick = source.name.clone();
        let reply = match ctcp.command.as_str() {
            "PING" => Some(match ctcp.text {
                Some(ref args) => format!("PING {}", args),
                None => "PING".to_owned(),
            }),
            "ECHO" => ctcp.text.as_ref().map(|args| format!("ECHO {}", args)),
            "TIME" => Some(format!(
                "TIME {}",
                Local::now().format(CTCP_TIMEDATE_FORMAT)
            )),
            "CLIENTINFO" => Some(
                "CLIENTINFO ACTION DCC VERSION CLIENTINFO USERINFO FINGER PING TIME ECHO"
                    .to_owned(),
            ),
            "VERSION" => Some(format!("VERSION {} {}", PACKAGE, VERSION)),
            "USERINFO" => Some(format!("USERINFO {} - detachable IRC proxy", PACKAGE)),
            "FINGER" => Some(format!("FINGER {} proxying for unconnected client", PACKAGE)),
            _ => None,
        };
        if let Some(reply) = reply {
            self.send_server(format!("NOTICE {} :{}", nick, frame(&reply)));
        }
    }

    /// An incoming DCC CTCP: ACCEPT completes a resume negotiation;
    /// CHAT/SEND offers are rewritten, captured or rejected.
    async fn incoming_dcc(
        &mut self,
        logdest: &str,
        source: &Prefix,
        payload: &str,
        ctcp: &CtcpMessage,
        body: String,
    ) -> String {
        // Someone accepted our RESUME request
        if ctcp.params.len() >= 4 && ctcp.param(0).is_some_and(|s| s.eq_ignore_ascii_case("ACCEPT"))
        {
            let id = format!("{}:{}", source.name, ctcp.params[2]);
            debug!(id = %id, "Received DCC ACCEPT");
            if let Some(position) = self.resume.iter().position(|r| r.id == id) {
                let request = self.resume.remove(position);
                self.timers.cancel(&format!("resume:{}", id));
                self.start_capture(request, true).await;
            }
            return body;
        }

        let Some(offer) = DccOffer::from_ctcp(ctcp) else {
            if let Some(sub) = ctcp.param(0) {
                debug!(sub, "Unknown or unimplemented DCC request");
            }
            return body;
        };

        // Decide what we're doing with this offer
        let kind = match offer.kind {
            slbnc_proto::DccOfferKind::Chat => {
                // Can only proxy chats when we have a client
                if self.client_active() {
                    Some(DccTaskKind::Chat)
                } else {
                    None
                }
            }
            slbnc_proto::DccOfferKind::Send => {
                let capture_dir = self.class.dcc_capture_directory.clone();
                if let Some(dir) = capture_dir
                    .filter(|_| !self.client_active() || self.class.dcc_capture_always)
                {
                    match sanitize_capture_name(&offer.argument) {
                        Some(base) => {
                            let name = if self.class.dcc_capture_withnick {
                                format!("{}.{}", source.name, base)
                            } else {
                                base
                            };
                            Some(DccTaskKind::Capture {
                                path: PathBuf::from(dir).join(name),
                                resume_from: 0,
                            })
                        }
                        None => {
                            debug!(file = %offer.argument, "Refusing unsafe capture filename");
                            None
                        }
                    }
                } else if self.client_active() {
                    Some(if self.class.dcc_send_fast {
                        DccTaskKind::SendFast
                    } else {
                        DccTaskKind::SendSimple
                    })
                } else {
                    None
                }
            }
        };

        let remote = if self.class.dcc_tunnel_incoming > 0 {
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, self.class.dcc_tunnel_incoming)
        } else {
            SocketAddrV4::new(offer.endpoint.addr, offer.endpoint.port)
        };

        let reject_notice = format!(
            ":{} NOTICE {} :\x01DCC REJECT {} {}",
            self.nickname,
            source.name,
            ctcp.param(0).unwrap_or(""),
            offer.argument
        );

        // An existing capture target means we try to resume it
        if let Some(DccTaskKind::Capture { ref path, .. }) = kind {
            if let Ok(meta) = std::fs::metadata(path) {
                let offset = meta.len();
                let id = format!("{}:{}", source.name, offer.endpoint.port);
                debug!(id = %id, offset, "File exists, negotiating resume");

                self.resume.push(ResumeRequest {
                    id: id.clone(),
                    capfile: path.clone(),
                    reject_notice,
                    source_fullname: source.full_name(),
                    remote,
                    offset,
                });
                self.send_server(format!(
                    "PRIVMSG {} :{}",
                    source.name,
                    frame(&format!(
                        "DCC RESUME {} {} {}",
                        offer.argument, offer.endpoint.port, offset
                    ))
                ));
                let retry = self.class.server_retry;
                self.timers
                    .schedule(format!("resume:{}", id), Duration::from_secs(retry));
                return replace_payload(&body, payload, "").unwrap_or(body);
            }
        }

        let Some(kind) = kind else {
            // Nothing we can do with it; strip and reject
            self.send_dcc_reject(&reject_notice, None, true);
            return replace_payload(&body, payload, "").unwrap_or(body);
        };

        // Visible address for the rewritten offer comes from the client
        // socket
        let local_ip = self.client.as_ref().and_then(|link| {
            match link.framed.get_ref().local_addr() {
                Some(addr) => match addr.ip() {
                    IpAddr::V4(ip) => Some(ip),
                    IpAddr::V6(_) => None,
                },
                None => None,
            }
        });

        let is_capture = matches!(kind, DccTaskKind::Capture { .. });
        let request = DccRequest {
            kind,
            remote,
            ports: self.class.dcc_port_ranges(),
            timeout: Duration::from_secs(self.class.dcc_proxy_timeout),
            capture_maxsize_kb: self.class.dcc_capture_maxsize,
            events: self.dcc_tx.clone(),
            reject_notice: reject_notice.clone(),
            reject_to_server: true,
        };

        match dcc::spawn(request).await {
            Ok(port) => {
                if is_capture {
                    let text = format!(
                        "Captured DCC {} from {} into {}",
                        offer.kind.as_str(),
                        source.full_name(),
                        offer.argument
                    );
                    self.log_event(LogEvent::Ctcp, LogTarget::Name(logdest), &source.raw, text);
                    replace_payload(&body, payload, "").unwrap_or(body)
                } else if let Some(ip) = local_ip {
                    let text = format!(
                        "DCC {} Request from {}",
                        offer.kind.as_str(),
                        source.full_name()
                    );
                    self.log_event(LogEvent::Ctcp, LogTarget::Name(logdest), &source.raw, text);
                    let rewritten = offer.rewritten(ip, port);
                    replace_payload(&body, payload, &frame(&rewritten)).unwrap_or(body)
                } else {
                    self.send_dcc_reject(&reject_notice, None, true);
                    replace_payload(&body, payload, "").unwrap_or(body)
                }
            }
            Err(e) => {
                debug!(error = %e, "Couldn't establish incoming DCC proxy");
                self.send_dcc_reject(&reject_notice, None, true);
                replace_payload(&body, payload, "").unwrap_or(body)
            }
        }
    }

    /// Begin (or restart) a DCC capture for a resume negotiation.
    async fn start_capture(&mut self, request: ResumeRequest, resumed: bool) {
        let offset = if resumed { request.offset } else { 0 };
        let dcc_request = DccRequest {
            kind: DccTaskKind::Capture {
                path: request.capfile.clone(),
                resume_from: offset,
            },
            remote: request.remote,
            ports: self.class.dcc_port_ranges(),
            timeout: Duration::from_secs(self.class.dcc_proxy_timeout),
            capture_maxsize_kb: self.class.dcc_capture_maxsize,
            events: self.dcc_tx.clone(),
            reject_notice: request.reject_notice.clone(),
            reject_to_server: true,
        };

        match dcc::spawn(dcc_request).await {
            Ok(_) => {
                let text = format!(
                    "Captured DCC SEND from {} into {}",
                    request.source_fullname,
                    request.capfile.display()
                );
                let name = self.server_display_name();
                self.log_event(LogEvent::Ctcp, LogTarget::Server, &name, text);
            }
            Err(e) => {
                debug!(error = %e, "Couldn't establish resume capture");
                self.send_dcc_reject(&request.reject_notice, None, true);
            }
        }
    }

    /// The resume negotiation timed out: move the partial target aside
    /// and capture from scratch.
    pub(crate) async fn resume_timeout(&mut self, id: &str) {
        let Some(position) = self.resume.iter().position(|r| r.id == id) else {
            return;
        };
        let request = self.resume.remove(position);
        debug!(id, "DCC resume timed out");

        // Rename the partial file to the first free numbered name
        let mut counter = 1u32;
        loop {
            let candidate = PathBuf::from(format!("{}.{}", request.capfile.display(), counter));
            if !candidate.exists() {
                let _ = std::fs::rename(&request.capfile, &candidate);
                break;
            }
            counter += 1;
        }

        self.start_capture(request, false).await;
    }

    /// An incoming NOTICE: log the text and any CTCP replies, and let the
    /// caller forward the original.
    fn server_notice(&mut self, msg: &Message, source: &Prefix) {
        if msg.params.len() < 2 {
            return;
        }
        let target = msg.params[0].clone();
        let (clean, payloads) = strip_ctcp(&msg.params[1]);

        let logdest = if self.channel_index(&target).is_some() {
            target
        } else {
            source.name.clone()
        };

        if !clean.is_empty() {
            self.log_event(LogEvent::Notice, LogTarget::Name(&logdest), &source.raw, clean);
        }

        for payload in payloads {
            let Some(ctcp) = CtcpMessage::parse(&payload) else {
                continue;
            };
            let text = match ctcp.text {
                Some(ref args) => {
                    format!("Received CTCP {} Reply: {}", ctcp.command, args)
                }
                None => format!("Received CTCP {} Reply", ctcp.command),
            };
            self.log_event(LogEvent::Ctcp, LogTarget::Name(&logdest), &source.raw, text);
        }
    }
}

/// Recognize a 005 redirect: a comma-delimited list whose final token is
/// `host:port`.  Anything else is a capability line.
fn parse_redirect(text: &str) -> Option<(String, u16)> {
    if !text.contains(',') {
        return None;
    }
    let last = text.split_whitespace().last()?;
    let (host, port) = last.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.to_owned(), port))
}

/// Reduce a DCC SEND filename to a safe basename: strip `/` and `\`
/// directory components, refuse absolute paths, parent references and
/// names that vanish entirely.
fn sanitize_capture_name(raw: &str) -> Option<String> {
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(raw);
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_redirect() {
        assert_eq!(
            parse_redirect("linux.fr.org,please use this server irc.example.org:6667"),
            Some(("irc.example.org".to_owned(), 6667))
        );
        assert_eq!(parse_redirect("CHANTYPES=#& NICKLEN=9 :are supported"), None);
        assert_eq!(parse_redirect("a,b no port here"), None);
    }

    #[test]
    fn test_sanitize_capture_name() {
        assert_eq!(sanitize_capture_name("file.bin").as_deref(), Some("file.bin"));
        assert_eq!(
            sanitize_capture_name("/etc/passwd").as_deref(),
            Some("passwd")
        );
        assert_eq!(
            sanitize_capture_name("..\\..\\boot.ini").as_deref(),
            Some("boot.ini")
        );
        assert_eq!(sanitize_capture_name(".."), None);
        assert_eq!(sanitize_capture_name(""), None);
        assert_eq!(sanitize_capture_name("dir/"), None);
    }
}
