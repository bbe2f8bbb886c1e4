//! Log files, rotation, recall and log helpers.
//!
//! Every session owns a private log, a server log and one log per channel,
//! kept as plain files in a per-session temporary directory.  Entries are
//! one line each: `<unix_ts> <event> <destination> <source> <text>`.
//! When a file reaches its line cap it is rolled by rewriting the most
//! recent lines into a fresh file of the same name.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{Local, TimeZone};
use slbnc_proto::{irc_eq, irc_to_lower};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// The kinds of event that can be logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogEvent {
    /// PRIVMSG text.
    Message,
    /// NOTICE text.
    Notice,
    /// CTCP ACTION text.
    Action,
    /// Other CTCP traffic.
    Ctcp,
    /// Channel joins.
    Join,
    /// Channel parts.
    Part,
    /// Channel kicks.
    Kick,
    /// IRC quits.
    Quit,
    /// Nickname changes.
    NickChange,
    /// Mode changes.
    Mode,
    /// Topic changes.
    Topic,
    /// Client attach/detach events.
    Client,
    /// Server connection events.
    Server,
    /// Errors worth keeping.
    Fault,
}

/// All events, in a fixed order for filter parsing.
const ALL_EVENTS: [LogEvent; 14] = [
    LogEvent::Message,
    LogEvent::Notice,
    LogEvent::Action,
    LogEvent::Ctcp,
    LogEvent::Join,
    LogEvent::Part,
    LogEvent::Kick,
    LogEvent::Quit,
    LogEvent::NickChange,
    LogEvent::Mode,
    LogEvent::Topic,
    LogEvent::Client,
    LogEvent::Server,
    LogEvent::Fault,
];

impl LogEvent {
    /// Name used on disk and in the `log_events` configuration key.
    pub fn name(&self) -> &'static str {
        match self {
            LogEvent::Message => "message",
            LogEvent::Notice => "notice",
            LogEvent::Action => "action",
            LogEvent::Ctcp => "ctcp",
            LogEvent::Join => "join",
            LogEvent::Part => "part",
            LogEvent::Kick => "kick",
            LogEvent::Quit => "quit",
            LogEvent::NickChange => "nick",
            LogEvent::Mode => "mode",
            LogEvent::Topic => "topic",
            LogEvent::Client => "client",
            LogEvent::Server => "server",
            LogEvent::Fault => "error",
        }
    }

    /// Parse an event name.
    pub fn from_name(name: &str) -> Option<LogEvent> {
        ALL_EVENTS.iter().copied().find(|e| e.name().eq_ignore_ascii_case(name))
    }

    fn bit(&self) -> u16 {
        1 << ALL_EVENTS.iter().position(|e| e == self).unwrap_or(0)
    }

    /// Whether entries of this kind are replayed as synthetic
    /// PRIVMSG/NOTICE lines on recall (everything else becomes a NOTICE
    /// from the bouncer).
    pub fn is_recall_message(&self) -> bool {
        matches!(self, LogEvent::Message | LogEvent::Notice | LogEvent::Action)
    }
}

/// The set of events a class wants logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventFilter(u16);

impl EventFilter {
    /// Every event.
    pub fn all() -> Self {
        EventFilter(ALL_EVENTS.iter().fold(0, |acc, e| acc | e.bit()))
    }

    /// No events.
    pub fn none() -> Self {
        EventFilter(0)
    }

    /// Whether the filter includes `event`.
    pub fn contains(&self, event: LogEvent) -> bool {
        self.0 & event.bit() != 0
    }

    /// Parse a comma list of `all`, `none`, `+event`, `-event`, `event`.
    pub fn parse(raw: &str) -> Result<EventFilter, String> {
        let mut filter = EventFilter::none();
        for item in raw.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            match item.to_ascii_lowercase().as_str() {
                "all" => filter = EventFilter::all(),
                "none" => filter = EventFilter::none(),
                other => {
                    let (add, name) = match other.as_bytes()[0] {
                        b'+' => (true, &other[1..]),
                        b'-' => (false, &other[1..]),
                        _ => (true, other),
                    };
                    let event = LogEvent::from_name(name)
                        .ok_or_else(|| format!("unknown log event '{name}'"))?;
                    if add {
                        filter.0 |= event.bit();
                    } else {
                        filter.0 &= !event.bit();
                    }
                }
            }
        }
        Ok(filter)
    }
}

/// One log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Unix timestamp (already offset-adjusted when written).
    pub ts: i64,
    /// Event kind.
    pub event: LogEvent,
    /// Channel name, nickname or `server`.
    pub dest: String,
    /// Source prefix (`nick!user@host`, server name or the bouncer).
    pub source: String,
    /// Free text.
    pub text: String,
}

impl LogEntry {
    fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.ts,
            self.event.name(),
            self.dest,
            self.source,
            self.text
        )
    }

    fn parse(line: &str) -> Option<LogEntry> {
        let mut it = line.splitn(5, ' ');
        let ts = it.next()?.parse().ok()?;
        let event = LogEvent::from_name(it.next()?)?;
        let dest = it.next()?.to_owned();
        let source = it.next()?.to_owned();
        let text = it.next().unwrap_or("").to_owned();
        Some(LogEntry {
            ts,
            event,
            dest,
            source,
            text,
        })
    }

    /// Nickname portion of the source (before any `!`).
    pub fn source_nick(&self) -> &str {
        self.source.split('!').next().unwrap_or(&self.source)
    }
}

/// Make a destination safe for use as a file name.  Channel names may
/// contain `/`, which would otherwise escape the log directory.
pub fn safe_name(name: &str) -> String {
    irc_to_lower(name).replace('/', ":")
}

/// An append-only session log file.
#[derive(Debug, Default)]
pub struct LogFile {
    path: Option<PathBuf>,
    file: Option<File>,
    /// A file was created at some point (recall works on closed logs too).
    made: bool,
    nlines: u64,
    maxlines: u64,
    /// Log even while a client is attached.
    pub always: bool,
}

impl LogFile {
    /// Prepare the log under `dir` for destination `name`.  No file is
    /// created until [`LogFile::open`].
    pub fn init(&mut self, dir: &Path, name: &str, maxlines: u64, always: bool) {
        self.close();
        self.path = Some(dir.join(safe_name(name)));
        self.made = false;
        self.nlines = 0;
        self.maxlines = maxlines;
        self.always = always;
    }

    /// Whether the log is currently open for writing.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Whether a file exists to recall from.
    pub fn is_made(&self) -> bool {
        self.made
    }

    /// Number of entries currently in the file.
    pub fn nlines(&self) -> u64 {
        self.nlines
    }

    /// Open the log, truncating anything already there.
    pub fn open(&mut self) -> std::io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let path = self
            .path
            .clone()
            .ok_or_else(|| std::io::Error::other("log not initialised"))?;

        // Unlink first so nobody holds the old inode open
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let file = open_private(&path)?;
        self.file = Some(file);
        self.made = true;
        self.nlines = 0;
        Ok(())
    }

    /// Close the log; the file stays on disk for recall.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Remove the log file entirely.
    pub fn delete(&mut self) {
        self.close();
        if let Some(ref path) = self.path {
            let _ = std::fs::remove_file(path);
        }
        self.nlines = 0;
        self.made = false;
    }

    /// Append an entry, rolling the file first when it is at its cap.
    /// A dropped entry (log closed) is not an error.
    pub fn append(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        if self.file.is_none() {
            return Ok(());
        }

        if self.maxlines > 0 && self.nlines >= self.maxlines {
            self.roll()?;
        }

        if let Some(ref mut file) = self.file {
            file.seek(SeekFrom::End(0))?;
            writeln!(file, "{}", entry.to_line())?;
            file.flush()?;
            self.nlines += 1;
        }
        Ok(())
    }

    /// Keep the most recent `maxlines - 1` entries in a fresh file of the
    /// same name, so the append that follows lands exactly on the cap.
    fn roll(&mut self) -> std::io::Result<()> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| std::io::Error::other("log not initialised"))?;
        let keep = self.maxlines.saturating_sub(1) as usize;

        let mut lines = Vec::new();
        if let Some(ref mut file) = self.file {
            file.seek(SeekFrom::Start(0))?;
            for line in BufReader::new(&mut *file).lines() {
                lines.push(line?);
            }
        }
        let skip = lines.len().saturating_sub(keep);
        let tail = &lines[skip..];

        let _ = std::fs::remove_file(&path);
        let mut out = open_private(&path)?;
        for line in tail {
            writeln!(out, "{}", line)?;
        }
        out.flush()?;

        debug!(path = %path.display(), kept = tail.len(), "Rolled log file");
        self.file = Some(out);
        self.nlines = tail.len() as u64;
        Ok(())
    }

    /// Read every entry back.  Works on open and on closed-but-made logs;
    /// unparseable lines are skipped.
    pub fn entries(&mut self) -> std::io::Result<Vec<LogEntry>> {
        let mut out = Vec::new();
        if let Some(ref mut file) = self.file {
            file.seek(SeekFrom::Start(0))?;
            for line in BufReader::new(&mut *file).lines() {
                if let Some(entry) = LogEntry::parse(&line?) {
                    out.push(entry);
                }
            }
            // Leave the handle at the end for the next append
            file.seek(SeekFrom::End(0))?;
        } else if self.made {
            if let Some(ref path) = self.path {
                let file = File::open(path)?;
                for line in BufReader::new(file).lines() {
                    if let Some(entry) = LogEntry::parse(&line?) {
                        out.push(entry);
                    }
                }
            }
        }
        Ok(out)
    }
}

fn open_private(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

/// Recall formatting parameters.
pub struct RecallStyle<'a> {
    /// Prefix used for bouncer-originated notices.
    pub package: &'a str,
    /// Target the synthetic message lines are addressed to.
    pub to: &'a str,
    /// Nickname bouncer notices are addressed to.
    pub nickname: &'a str,
    /// Whether to timestamp recalled lines.
    pub timestamp: bool,
    /// Whether timestamps coarsen with age.
    pub relativetime: bool,
}

/// Format a recalled timestamp, progressively coarser with age.
fn format_ts(ts: i64, now: i64, relative: bool) -> String {
    let Some(when) = Local.timestamp_opt(ts, 0).single() else {
        return String::new();
    };
    if !relative {
        return when.format("%H:%M").to_string();
    }
    let diff = now - ts;
    if diff < 82_800 {
        // Within 23 hours
        when.format("%H:%M").to_string()
    } else if diff < 518_400 {
        // Within 6 days
        when.format("%a %H:%M").to_string()
    } else if diff < 25_920_000 {
        // Within 300 days
        when.format("%d %b").to_string()
    } else {
        when.format("%d %b %Y").to_string()
    }
}

/// Render log entries into raw IRC lines for delivery to the client.
///
/// `start` entries are skipped, then up to `lines` are rendered (`None` =
/// the rest).  `filter` keeps only message entries whose source nickname
/// matches.
pub fn recall_lines(
    entries: &[LogEntry],
    start: u64,
    lines: Option<u64>,
    style: &RecallStyle<'_>,
    filter: Option<&str>,
) -> Vec<String> {
    let now = Local::now().timestamp();
    let mut out = Vec::new();
    let mut budget = lines;

    for entry in entries.iter().skip(start as usize) {
        if matches!(budget, Some(0)) {
            break;
        }

        if let Some(nick) = filter {
            if !entry.event.is_recall_message() || !irc_eq(entry.source_nick(), nick) {
                continue;
            }
        }

        let stamp = if style.timestamp {
            Some(format_ts(entry.ts, now, style.relativetime))
        } else {
            None
        };

        let line = match entry.event {
            LogEvent::Message | LogEvent::Notice => {
                let cmd = if entry.event == LogEvent::Message {
                    "PRIVMSG"
                } else {
                    "NOTICE"
                };
                match stamp {
                    Some(t) => format!(":{} {} {} :[{}] {}", entry.source, cmd, style.to, t, entry.text),
                    None => format!(":{} {} {} :{}", entry.source, cmd, style.to, entry.text),
                }
            }
            LogEvent::Action => match stamp {
                // The command goes before the timestamp inside the CTCP
                Some(t) => format!(
                    ":{} PRIVMSG {} :\x01ACTION [{}] {}\x01",
                    entry.source, style.to, t, entry.text
                ),
                None => format!(
                    ":{} PRIVMSG {} :\x01ACTION {}\x01",
                    entry.source, style.to, entry.text
                ),
            },
            _ => match stamp {
                Some(t) => format!(
                    ":{} NOTICE {} :[{}] {}",
                    style.package, style.nickname, t, entry.text
                ),
                None => format!(":{} NOTICE {} :{}", style.package, style.nickname, entry.text),
            },
        };
        out.push(line);

        if let Some(ref mut n) = budget {
            *n -= 1;
        }
    }
    out
}

/// Append a human-readable copy of an entry to the permanent log
/// directory.  These copies are never rotated or recalled.
pub fn append_user_copy(
    dir: &str,
    dest: &str,
    entry: &LogEntry,
    timestamp: bool,
) {
    let path = Path::new(dir).join(format!("{}.log", safe_name(dest)));
    // Refuse to follow anything that is not a regular file
    match std::fs::symlink_metadata(&path) {
        Ok(meta) if !meta.is_file() => {
            debug!(path = %path.display(), "User log exists but is not a file");
            return;
        }
        _ => {}
    }

    let stamp = if timestamp {
        Local
            .timestamp_opt(entry.ts, 0)
            .single()
            .map(|t| t.format("[%d %b %H:%M] ").to_string())
            .unwrap_or_default()
    } else {
        String::new()
    };

    let nick = entry.source_nick();
    let formatted = match entry.event {
        LogEvent::Message => format!("{}<{}> {}", stamp, entry.source, entry.text),
        LogEvent::Notice => format!("{}-{}- {}", stamp, entry.source, entry.text),
        LogEvent::Action => format!("{}* {} {}", stamp, nick, entry.text),
        LogEvent::Ctcp => format!("{}[{}] {}", stamp, entry.source, entry.text),
        LogEvent::Join => format!("{}--> {}", stamp, entry.text),
        LogEvent::Part | LogEvent::Kick | LogEvent::Quit => {
            format!("{}<-- {}", stamp, entry.text)
        }
        LogEvent::NickChange | LogEvent::Mode | LogEvent::Topic => {
            format!("{}--- {}", stamp, entry.text)
        }
        LogEvent::Client | LogEvent::Server | LogEvent::Fault => {
            format!("{}*** {}", stamp, entry.text)
        }
    };

    let result = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .and_then(|mut f| writeln!(f, "{}", formatted));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to write user log copy");
    }
}

/// Pipe a log line into an external program, fire-and-forget.  The program
/// gets `<event> <destination> <source>` as arguments and the text on
/// stdin; nothing waits for it and there is no back-pressure.
pub fn pipe_to_program(program: &str, entry: &LogEntry) {
    let mut command = tokio::process::Command::new(program);
    command
        .arg(entry.event.name())
        .arg(&entry.dest)
        .arg(&entry.source)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    match command.spawn() {
        Ok(mut child) => {
            let text = format!("{}\n", entry.text);
            tokio::spawn(async move {
                if let Some(mut stdin) = child.stdin.take() {
                    let _ = stdin.write_all(text.as_bytes()).await;
                }
                let _ = child.wait().await;
            });
        }
        Err(e) => warn!(program, error = %e, "Failed to spawn log program"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ts: i64, text: &str) -> LogEntry {
        LogEntry {
            ts,
            event: LogEvent::Message,
            dest: "#chan".into(),
            source: "nick!user@host".into(),
            text: text.into(),
        }
    }

    #[test]
    fn test_event_filter_parse() {
        let all = EventFilter::parse("all").unwrap();
        assert!(all.contains(LogEvent::Message));
        assert!(all.contains(LogEvent::Fault));

        let none = EventFilter::parse("none").unwrap();
        assert!(!none.contains(LogEvent::Message));

        let some = EventFilter::parse("none,+message,+notice").unwrap();
        assert!(some.contains(LogEvent::Message));
        assert!(!some.contains(LogEvent::Join));

        let minus = EventFilter::parse("all,-join,-part").unwrap();
        assert!(!minus.contains(LogEvent::Join));
        assert!(minus.contains(LogEvent::Kick));

        assert!(EventFilter::parse("bogus").is_err());
    }

    #[test]
    fn test_entry_roundtrip() {
        let e = entry(1700000000, "hello there world");
        let parsed = LogEntry::parse(&e.to_line()).unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn test_safe_name() {
        assert_eq!(safe_name("#Chan"), "#chan");
        assert_eq!(safe_name("#/../../etc/passwd"), "#:..:..:etc:passwd");
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = LogFile::default();
        log.init(dir.path(), "#chan", 0, true);
        log.open().unwrap();

        for i in 0..5 {
            log.append(&entry(i, &format!("line {i}"))).unwrap();
        }
        assert_eq!(log.nlines(), 5);
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[4].text, "line 4");
    }

    #[test]
    fn test_rotation_keeps_contiguous_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = LogFile::default();
        log.init(dir.path(), "#chan", 3, true);
        log.open().unwrap();

        for i in 0..10 {
            log.append(&entry(i, &format!("line {i}"))).unwrap();
            assert!(log.nlines() <= 3);
        }
        let entries = log.entries().unwrap();
        let texts: Vec<&str> = entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn test_recall_on_closed_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = LogFile::default();
        log.init(dir.path(), "private", 0, false);
        log.open().unwrap();
        log.append(&entry(1700000000, "remembered")).unwrap();
        log.close();

        assert!(log.is_made());
        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_recall_filter_and_format() {
        let entries = vec![
            entry(Local::now().timestamp(), "hello"),
            LogEntry {
                source: "other!u@h".into(),
                ..entry(Local::now().timestamp(), "not for you")
            },
        ];
        let style = RecallStyle {
            package: "slbncd",
            to: "#chan",
            nickname: "me",
            timestamp: true,
            relativetime: true,
        };
        let lines = recall_lines(&entries, 0, None, &style, Some("NICK"));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(":nick!user@host PRIVMSG #chan :["));
        assert!(lines[0].ends_with("] hello"));
    }

    #[test]
    fn test_recall_start_and_limit() {
        let entries: Vec<LogEntry> =
            (0..10).map(|i| entry(1700000000 + i, &format!("m{i}"))).collect();
        let style = RecallStyle {
            package: "slbncd",
            to: "me",
            nickname: "me",
            timestamp: false,
            relativetime: false,
        };
        let lines = recall_lines(&entries, 6, Some(2), &style, None);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(":m6"));
        assert!(lines[1].ends_with(":m7"));
    }

    #[test]
    fn test_non_message_recalled_as_bouncer_notice() {
        let entries = vec![LogEntry {
            ts: 1700000000,
            event: LogEvent::Kick,
            dest: "#chan".into(),
            source: "srv".into(),
            text: "Kicked off by bully (bad luck)".into(),
        }];
        let style = RecallStyle {
            package: "slbncd",
            to: "#chan",
            nickname: "me",
            timestamp: false,
            relativetime: false,
        };
        let lines = recall_lines(&entries, 0, None, &style, None);
        assert_eq!(lines, vec![":slbncd NOTICE me :Kicked off by bully (bad luck)"]);
    }
}
