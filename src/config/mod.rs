//! Configuration loading and validation.
//!
//! The configuration file is TOML; connection classes are `[[connection]]`
//! blocks.  Defaults live in [`defaults`], the type definitions in
//! [`types`].

mod defaults;
mod types;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::logs::EventFilter;

pub use types::{Config, ConnectionClass, LogFormat};

/// Accept either a TOML integer or string for fields like `listen_port`.
pub(crate) fn string_or_int<'de, D>(de: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }
    Ok(match Raw::deserialize(de)? {
        Raw::Int(n) => n.to_string(),
        Raw::Str(s) => s,
    })
}

/// A parsed `host[:port][:password]` server entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerSpec {
    /// The entry exactly as configured (shown in SERVERS listings).
    pub raw: String,
    /// Host to connect to.
    pub host: String,
    /// Port to connect to.
    pub port: u16,
    /// Server password, when given.
    pub password: Option<String>,
}

impl ServerSpec {
    /// Parse a server entry, falling back to `default_port` when the spec
    /// carries none.  With more than one colon the final segment is the
    /// server password.
    pub fn parse(raw: &str, default_port: u16) -> Self {
        let (hostport, password) = match raw.match_indices(':').count() {
            0 | 1 => (raw, None),
            _ => {
                let at = raw.rfind(':').unwrap_or(raw.len());
                let pass = &raw[at + 1..];
                (
                    &raw[..at],
                    if pass.is_empty() {
                        None
                    } else {
                        Some(pass.to_owned())
                    },
                )
            }
        };

        let (host, port) = match hostport.split_once(':') {
            Some((h, p)) => (h, p.parse().unwrap_or(default_port)),
            None => (hostport, default_port),
        };

        ServerSpec {
            raw: raw.to_owned(),
            host: host.to_owned(),
            port,
            password,
        }
    }
}

impl fmt::Display for ServerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A parsed `bytes[:period]` throttle value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThrottleSpec {
    /// Bytes allowed per window.
    pub bytes: usize,
    /// Window length in seconds.
    pub period: u64,
}

/// Parse a `bytes[:period]` throttle string; bare `N` means `N:1`.
/// Zero for either value disables the throttle.
pub fn parse_throttle(raw: &str) -> std::result::Result<Option<ThrottleSpec>, String> {
    let (bytes, period) = match raw.split_once(':') {
        Some((b, p)) => (
            b.parse::<usize>().map_err(|_| format!("bad throttle bytes '{b}'"))?,
            p.parse::<u64>().map_err(|_| format!("bad throttle period '{p}'"))?,
        ),
        None => (
            raw.parse::<usize>().map_err(|_| format!("bad throttle '{raw}'"))?,
            1,
        ),
    };
    if bytes == 0 || period == 0 {
        Ok(None)
    } else {
        Ok(Some(ThrottleSpec { bytes, period }))
    }
}

/// Parse a `low-high[,low-high...]` port range list.
pub fn parse_port_ranges(raw: &str) -> std::result::Result<Vec<(u16, u16)>, String> {
    let mut out = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (lo, hi) = match part.split_once('-') {
            Some((l, h)) => (
                l.trim().parse::<u16>().map_err(|_| format!("bad port '{l}'"))?,
                h.trim().parse::<u16>().map_err(|_| format!("bad port '{h}'"))?,
            ),
            None => {
                let p = part.parse::<u16>().map_err(|_| format!("bad port '{part}'"))?;
                (p, p)
            }
        };
        if lo == 0 || hi < lo {
            return Err(format!("bad port range '{part}'"));
        }
        out.push((lo, hi));
    }
    Ok(out)
}

/// Expand a leading `~/` from `$HOME`.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return Path::new(&home).join(rest);
        }
    }
    PathBuf::from(path)
}

fn clear_if_empty(field: &mut Option<String>) {
    if field.as_deref() == Some("") {
        *field = None;
    }
}

impl ConnectionClass {
    /// Parsed server list.
    pub fn server_specs(&self) -> Vec<ServerSpec> {
        self.servers
            .iter()
            .map(|s| ServerSpec::parse(s, self.server_port))
            .collect()
    }

    /// Parsed throttle, `None` when unset or disabled.
    pub fn throttle(&self) -> Option<ThrottleSpec> {
        self.server_throttle
            .as_deref()
            .and_then(|s| parse_throttle(s).ok().flatten())
    }

    /// Parsed DCC proxy port ranges, `None` for "any free port".
    pub fn dcc_port_ranges(&self) -> Option<Vec<(u16, u16)>> {
        self.dcc_proxy_ports
            .as_deref()
            .and_then(|s| parse_port_ranges(s).ok())
            .filter(|v| !v.is_empty())
    }

    /// Parsed log event filter.
    pub fn event_filter(&self) -> EventFilter {
        EventFilter::parse(&self.log_events).unwrap_or_else(|_| EventFilter::all())
    }

    fn normalize(&mut self) {
        for field in [
            &mut self.server_throttle,
            &mut self.initial_modes,
            &mut self.drop_modes,
            &mut self.refuse_modes,
            &mut self.local_address,
            &mut self.away_message,
            &mut self.quit_message,
            &mut self.attach_message,
            &mut self.detach_message,
            &mut self.detach_nickname,
            &mut self.nickserv_password,
            &mut self.log_dir,
            &mut self.log_program,
            &mut self.dcc_proxy_ports,
            &mut self.dcc_capture_directory,
            &mut self.motd_file,
        ] {
            clear_if_empty(field);
        }

        for field in [
            &mut self.log_dir,
            &mut self.log_program,
            &mut self.dcc_capture_directory,
            &mut self.motd_file,
        ] {
            if let Some(value) = field.as_deref() {
                *field = Some(expand_tilde(value).to_string_lossy().into_owned());
            }
        }
    }

    fn validate(&self, index: usize) -> Result<()> {
        let at = |what: &str| Error::Config(format!("connection #{}: {}", index + 1, what));

        if self.password.is_empty() {
            return Err(at("no password"));
        }
        if self.servers.is_empty() {
            return Err(at("no servers"));
        }
        if let Some(ref raw) = self.server_throttle {
            parse_throttle(raw).map_err(|e| at(&e))?;
        }
        if let Some(ref raw) = self.dcc_proxy_ports {
            parse_port_ranges(raw).map_err(|e| at(&e))?;
        }
        EventFilter::parse(&self.log_events).map_err(|e| at(&e))?;
        if self.allow_dynamic > 2 {
            return Err(at("allow_dynamic must be 0, 1 or 2"));
        }
        Ok(())
    }
}

impl Config {
    /// Load, normalize and validate a configuration file.
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        if let Some(ref pid) = config.pid_file {
            config.pid_file = Some(expand_tilde(pid).to_string_lossy().into_owned());
        }

        if config.connections.is_empty() {
            return Err(Error::Config("no connection classes defined".into()));
        }
        for (i, class) in config.connections.iter_mut().enumerate() {
            class.normalize();
            class.validate(i)?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(extra: &str) -> String {
        format!(
            r#"
[[connection]]
password = "secret"
server = ["irc.example.org"]
{extra}
"#
        )
    }

    fn load_str(text: &str) -> Result<Config> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("slbncd.toml");
        std::fs::write(&path, text).expect("write config");
        Config::load(&path)
    }

    #[test]
    fn test_minimal_config() {
        let config = load_str(&minimal("")).unwrap();
        assert_eq!(config.listen_port, "57000");
        assert_eq!(config.client_timeout, 60);
        let class = &config.connections[0];
        assert_eq!(class.server_retry, 15);
        assert_eq!(class.server_maxinitattempts, 5);
        assert_eq!(class.chan_log_recall, 128);
        assert_eq!(class.private_log_recall, -1);
        assert_eq!(class.initial_modes.as_deref(), Some("i"));
        assert_eq!(class.drop_modes.as_deref(), Some("oOws"));
        assert!(class.chan_log_always);
        assert!(!class.private_log_always);
        assert!(!class.allow_die);
    }

    #[test]
    fn test_no_classes_fatal() {
        assert!(load_str("listen_port = 57000").is_err());
    }

    #[test]
    fn test_class_without_servers_fatal() {
        let text = r#"
[[connection]]
password = "secret"
"#;
        assert!(load_str(text).is_err());
    }

    #[test]
    fn test_empty_strings_normalized() {
        let config = load_str(&minimal("away_message = \"\"\ndetach_nickname = \"\"")).unwrap();
        let class = &config.connections[0];
        assert!(class.away_message.is_none());
        assert!(class.detach_nickname.is_none());
    }

    #[test]
    fn test_listen_port_as_int() {
        let text = format!("listen_port = 12345\n{}", minimal(""));
        let config = load_str(&text).unwrap();
        assert_eq!(config.listen_port, "12345");
    }

    #[test]
    fn test_server_spec_parse() {
        let spec = ServerSpec::parse("irc.example.org", 6667);
        assert_eq!((spec.host.as_str(), spec.port, spec.password), ("irc.example.org", 6667, None));

        let spec = ServerSpec::parse("irc.example.org:7000", 6667);
        assert_eq!(spec.port, 7000);

        let spec = ServerSpec::parse("irc.example.org:7000:secret", 6667);
        assert_eq!(spec.port, 7000);
        assert_eq!(spec.password.as_deref(), Some("secret"));

        let spec = ServerSpec::parse("irc.example.org::secret", 6667);
        assert_eq!(spec.port, 6667);
        assert_eq!(spec.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_throttle_parse() {
        assert_eq!(
            parse_throttle("1024:10").unwrap(),
            Some(ThrottleSpec { bytes: 1024, period: 10 })
        );
        assert_eq!(
            parse_throttle("512").unwrap(),
            Some(ThrottleSpec { bytes: 512, period: 1 })
        );
        assert_eq!(parse_throttle("0").unwrap(), None);
        assert!(parse_throttle("x:y").is_err());
    }

    #[test]
    fn test_port_ranges() {
        assert_eq!(
            parse_port_ranges("57100-57199,57300").unwrap(),
            vec![(57100, 57199), (57300, 57300)]
        );
        assert!(parse_port_ranges("9-1").is_err());
    }
}
