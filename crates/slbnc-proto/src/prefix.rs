//! The source prefix of an IRC message (`nick!user@host` or a server name).

use std::fmt;

/// A parsed message prefix.
///
/// IRC does not mark whether a prefix names a user or a server; a `!`
/// separator is the only reliable signal that it is a user.  The original
/// prefix text is kept so it can be echoed back verbatim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prefix {
    /// Nickname or server name.
    pub name: String,
    /// Username, when the prefix contained `!`.
    pub user: Option<String>,
    /// Hostname, when the prefix contained `@`.
    pub host: Option<String>,
    /// The prefix exactly as received, without the leading `:`.
    pub raw: String,
}

impl Prefix {
    /// Parse a prefix from its textual form (without the leading `:`).
    pub fn parse(s: &str) -> Self {
        match s.split_once('!') {
            Some((name, rest)) => match rest.split_once('@') {
                Some((user, host)) => Prefix {
                    name: name.to_owned(),
                    user: Some(user.to_owned()),
                    host: Some(host.to_owned()),
                    raw: s.to_owned(),
                },
                None => Prefix {
                    name: name.to_owned(),
                    user: Some(rest.to_owned()),
                    host: None,
                    raw: s.to_owned(),
                },
            },
            None => Prefix {
                name: s.to_owned(),
                user: None,
                host: None,
                raw: s.to_owned(),
            },
        }
    }

    /// Build a full `nick!user@host` prefix.
    pub fn user(nick: &str, user: &str, host: &str) -> Self {
        Prefix {
            name: nick.to_owned(),
            user: Some(user.to_owned()),
            host: Some(host.to_owned()),
            raw: format!("{}!{}@{}", nick, user, host),
        }
    }

    /// Build a bare server (or nickname-only) prefix.
    pub fn server(name: &str) -> Self {
        Prefix {
            name: name.to_owned(),
            user: None,
            host: None,
            raw: name.to_owned(),
        }
    }

    /// Whether this prefix definitely names a user (it contained `!`).
    pub fn is_user(&self) -> bool {
        self.user.is_some()
    }

    /// A human-readable form: `nick (user@host)` when both parts are known,
    /// otherwise just the name.  Used in log file text.
    pub fn full_name(&self) -> String {
        match (&self.user, &self.host) {
            (Some(u), Some(h)) => format!("{} ({}@{})", self.name, u, h),
            _ => self.name.clone(),
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let p = Prefix::parse("nick!user@host.example.com");
        assert_eq!(p.name, "nick");
        assert_eq!(p.user.as_deref(), Some("user"));
        assert_eq!(p.host.as_deref(), Some("host.example.com"));
        assert!(p.is_user());
        assert_eq!(p.full_name(), "nick (user@host.example.com)");
    }

    #[test]
    fn test_parse_server() {
        let p = Prefix::parse("irc.example.com");
        assert_eq!(p.name, "irc.example.com");
        assert!(!p.is_user());
        assert_eq!(p.full_name(), "irc.example.com");
    }

    #[test]
    fn test_display_roundtrip() {
        let raw = "nick!user@host";
        assert_eq!(Prefix::parse(raw).to_string(), raw);
    }
}
