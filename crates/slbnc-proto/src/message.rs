//! IRC message parsing and construction.
//!
//! A message is `{prefix, command, params}`.  Commands are kept as strings
//! (numerics included) because a bouncer must forward commands it has never
//! heard of; callers that need the raw line keep it alongside the parsed
//! form.

use std::fmt;
use std::str::FromStr;

use crate::error::MessageParseError;
use crate::prefix::Prefix;

/// A parsed IRC message.
///
/// # Example
///
/// ```
/// use slbnc_proto::Message;
///
/// let msg: Message = ":nick!user@host PRIVMSG #channel :Hello!".parse().unwrap();
/// assert_eq!(msg.command, "PRIVMSG");
/// assert_eq!(msg.params, vec!["#channel", "Hello!"]);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Message source, when present.
    pub prefix: Option<Prefix>,
    /// Command or three-digit numeric, as received.
    pub command: String,
    /// Parameters; the trailing parameter loses its `:` marker.
    pub params: Vec<String>,
}

/// Consume any separator spaces beyond the single one `split_once` has
/// already taken.  RFC 2812 mandates exactly one space between parameters
/// (allowing empty ones), so this is a no-op by default; the
/// `rfc1459-param-space` feature restores the older one-or-more-spaces
/// rule.
fn skip_extra_spaces(s: &str) -> &str {
    #[cfg(feature = "rfc1459-param-space")]
    {
        s.trim_start_matches(' ')
    }
    #[cfg(not(feature = "rfc1459-param-space"))]
    {
        s
    }
}

impl Message {
    /// Build a message from a command and parameters, without a prefix.
    pub fn new<C, P, I>(command: C, params: I) -> Self
    where
        C: Into<String>,
        P: Into<String>,
        I: IntoIterator<Item = P>,
    {
        Message {
            prefix: None,
            command: command.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Attach a prefix to this message.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Prefix) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Parse a raw IRC line (any trailing CR/LF is ignored).
    pub fn parse(line: &str) -> Result<Self, MessageParseError> {
        let mut rest = line.trim_end_matches(['\r', '\n']);

        let prefix = if let Some(after) = rest.strip_prefix(':') {
            let (pfx, tail) = after.split_once(' ').unwrap_or((after, ""));
            rest = skip_extra_spaces(tail);
            Some(Prefix::parse(pfx))
        } else {
            None
        };

        if rest.is_empty() {
            return Err(if prefix.is_some() {
                MessageParseError::NoCommand
            } else {
                MessageParseError::Empty
            });
        }

        let (command, tail) = rest.split_once(' ').unwrap_or((rest, ""));
        if command.is_empty() {
            return Err(MessageParseError::NoCommand);
        }
        let mut rest = skip_extra_spaces(tail);

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            let (param, tail) = rest.split_once(' ').unwrap_or((rest, ""));
            params.push(param.to_owned());
            rest = skip_extra_spaces(tail);
        }

        Ok(Message {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// The nickname of the source, when the prefix names a user.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix.as_ref().map(|p| p.name.as_str())
    }

    /// The numeric value of the command, when it is a three-digit numeric.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit()) {
            self.command.parse().ok()
        } else {
            None
        }
    }

    /// Parameter `i`, when present.
    pub fn param(&self, i: usize) -> Option<&str> {
        self.params.get(i).map(String::as_str)
    }

    /// Parameters from `i` onwards joined back into a single string, the
    /// way clients see trailing free text.
    pub fn tail(&self, i: usize) -> Option<String> {
        if i >= self.params.len() {
            None
        } else {
            Some(self.params[i..].join(" "))
        }
    }
}

impl FromStr for Message {
    type Err = MessageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Message::parse(s)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        f.write_str(&self.command)?;
        let last = self.params.len().wrapping_sub(1);
        for (i, param) in self.params.iter().enumerate() {
            if i == last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        let msg = Message::parse("PING :irc.example.com").unwrap();
        assert!(msg.prefix.is_none());
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["irc.example.com"]);
    }

    #[test]
    fn test_parse_prefixed() {
        let msg = Message::parse(":nick!user@host PRIVMSG #chan :hello there").unwrap();
        assert_eq!(msg.source_nick(), Some("nick"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "hello there"]);
    }

    #[test]
    fn test_parse_numeric() {
        let msg = Message::parse(":srv 433 old new :Nickname is already in use").unwrap();
        assert_eq!(msg.numeric(), Some(433));
        assert_eq!(msg.param(1), Some("new"));
    }

    #[test]
    fn test_parse_crlf_stripped() {
        let msg = Message::parse("QUIT :bye\r\n").unwrap();
        assert_eq!(msg.params, vec!["bye"]);
    }

    #[test]
    fn test_parse_empty_trailing() {
        let msg = Message::parse("AWAY :").unwrap();
        assert_eq!(msg.params, vec![""]);
    }

    #[test]
    fn test_parse_no_params() {
        // An anti-idle probe is a PRIVMSG with no parameters at all
        let msg = Message::parse("PRIVMSG ").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert!(msg.params.is_empty());
    }

    #[test]
    fn test_parse_empty_middle_param() {
        // Two separators in a row carry an empty parameter under RFC 2812
        let msg = Message::parse("PRIVMSG  x").unwrap();
        assert_eq!(msg.params, vec!["", "x"]);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Message::parse(""), Err(MessageParseError::Empty));
        assert_eq!(
            Message::parse(":prefix.only "),
            Err(MessageParseError::NoCommand)
        );
    }

    #[test]
    fn test_tail() {
        let msg = Message::parse("DIRCPROXY DETACH gone for lunch").unwrap();
        assert_eq!(msg.tail(1), Some("gone for lunch".to_owned()));
        assert_eq!(msg.tail(4), None);
    }

    #[test]
    fn test_display_trailing() {
        let msg = Message::new("PRIVMSG", vec!["#chan", "hello there"]);
        assert_eq!(msg.to_string(), "PRIVMSG #chan :hello there");
    }

    #[test]
    fn test_roundtrip() {
        let cases = [
            ":nick!user@host PRIVMSG #chan :hello there",
            "NICK :newnick",
            ":srv 004 nick srv ver aoOirw biklmnopstv",
            "JOIN #chan key",
            "AWAY :",
        ];
        for raw in cases {
            let msg = Message::parse(raw).unwrap();
            assert_eq!(Message::parse(&msg.to_string()).unwrap(), msg, "{raw}");
        }
    }
}
