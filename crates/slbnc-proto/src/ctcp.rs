//! CTCP (Client-To-Client Protocol) handling.
//!
//! CTCP messages are embedded in PRIVMSG/NOTICE bodies between `\x01`
//! delimiters, possibly mixed with ordinary text.  A bouncer needs three
//! operations: strip the embedded payloads out of a body while preserving
//! the surrounding text byte-for-byte, parse an extracted payload
//! (dequoting it first), and splice a rewritten payload back into the
//! original body.

use crate::casemap::irc_eq;

/// The CTCP delimiter character (`\x01`).
pub const CTCP_DELIM: char = '\x01';

/// Low-level CTCP dequoting: `\a` becomes `\x01`, `\\` becomes `\`, any
/// other quoted character stands for itself.  A trailing lone backslash is
/// dropped.
pub fn dequote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut quoted = false;
    for c in s.chars() {
        if quoted {
            out.push(if c == 'a' { '\x01' } else { c });
            quoted = false;
        } else if c == '\\' {
            quoted = true;
        } else {
            out.push(c);
        }
    }
    out
}

/// Strip embedded CTCP payloads from a message body.
///
/// Returns the body with every well-formed `\x01...\x01` span removed, plus
/// the list of payloads (delimiters excluded, still quoted) in order of
/// appearance.  An unterminated `\x01` span is left in the text, as the
/// original client sent it.  Empty payloads (`\x01\x01`) are dropped.
pub fn strip_ctcp(body: &str) -> (String, Vec<String>) {
    let mut clean = String::with_capacity(body.len());
    let mut payloads = Vec::new();
    let mut span_start: Option<usize> = None;

    for c in body.chars() {
        if c == CTCP_DELIM {
            match span_start.take() {
                Some(start) => {
                    // Close of span: remove it from the clean text
                    let payload = clean[start + 1..].to_owned();
                    clean.truncate(start);
                    if !payload.is_empty() {
                        payloads.push(payload);
                    }
                }
                None => {
                    span_start = Some(clean.len());
                    clean.push(c);
                }
            }
        } else {
            clean.push(c);
        }
    }

    (clean, payloads)
}

/// Replace the first occurrence of `\x01{payload}\x01` in `body` with
/// `replacement` (which should carry its own delimiters, or be empty to
/// drop the CTCP entirely).  Returns `None` when the payload is not found.
pub fn replace_payload(body: &str, payload: &str, replacement: &str) -> Option<String> {
    let needle = format!("{}{}{}", CTCP_DELIM, payload, CTCP_DELIM);
    let at = body.find(&needle)?;
    let mut out = String::with_capacity(body.len() + replacement.len());
    out.push_str(&body[..at]);
    out.push_str(replacement);
    out.push_str(&body[at + needle.len()..]);
    Some(out)
}

/// A parsed CTCP payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtcpMessage {
    /// The CTCP command, uppercased.
    pub command: String,
    /// Space-separated arguments.
    pub params: Vec<String>,
    /// Everything after the command, dequoted, as one string.
    pub text: Option<String>,
}

impl CtcpMessage {
    /// Parse a payload previously extracted by [`strip_ctcp`].  The payload
    /// is dequoted before splitting.  Returns `None` for an empty payload.
    pub fn parse(payload: &str) -> Option<Self> {
        let dequoted = dequote(payload);
        let mut it = dequoted.split_ascii_whitespace();
        let command = it.next()?.to_ascii_uppercase();
        let params: Vec<String> = it.map(str::to_owned).collect();
        let text = dequoted
            .split_once(' ')
            .map(|(_, rest)| rest.trim_start_matches(' ').to_owned())
            .filter(|t| !t.is_empty());
        Some(CtcpMessage {
            command,
            params,
            text,
        })
    }

    /// Whether this payload is the given command (ASCII case-insensitive).
    pub fn is(&self, command: &str) -> bool {
        irc_eq(&self.command, command)
    }

    /// Argument `i`, when present.
    pub fn param(&self, i: usize) -> Option<&str> {
        self.params.get(i).map(String::as_str)
    }
}

/// Frame a payload in CTCP delimiters for transmission.
pub fn frame(payload: &str) -> String {
    format!("{}{}{}", CTCP_DELIM, payload, CTCP_DELIM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dequote() {
        assert_eq!(dequote("plain"), "plain");
        assert_eq!(dequote("a\\ab"), "a\x01b");
        assert_eq!(dequote("a\\\\b"), "a\\b");
        assert_eq!(dequote("a\\nb"), "anb");
        assert_eq!(dequote("trailing\\"), "trailing");
    }

    #[test]
    fn test_strip_plain() {
        let (clean, ctcps) = strip_ctcp("just some text");
        assert_eq!(clean, "just some text");
        assert!(ctcps.is_empty());
    }

    #[test]
    fn test_strip_whole_body() {
        let (clean, ctcps) = strip_ctcp("\x01ACTION waves\x01");
        assert_eq!(clean, "");
        assert_eq!(ctcps, vec!["ACTION waves"]);
    }

    #[test]
    fn test_strip_mixed() {
        let (clean, ctcps) = strip_ctcp("before \x01PING 123\x01 after");
        assert_eq!(clean, "before  after");
        assert_eq!(ctcps, vec!["PING 123"]);
    }

    #[test]
    fn test_strip_multiple() {
        let (clean, ctcps) = strip_ctcp("\x01A 1\x01mid\x01B 2\x01");
        assert_eq!(clean, "mid");
        assert_eq!(ctcps, vec!["A 1", "B 2"]);
    }

    #[test]
    fn test_strip_unterminated() {
        let (clean, ctcps) = strip_ctcp("text \x01DCC CHAT");
        assert_eq!(clean, "text \x01DCC CHAT");
        assert!(ctcps.is_empty());
    }

    #[test]
    fn test_strip_empty_payload() {
        let (clean, ctcps) = strip_ctcp("a\x01\x01b");
        assert_eq!(clean, "ab");
        assert!(ctcps.is_empty());
    }

    #[test]
    fn test_replace_payload() {
        let body = "keep \x01DCC CHAT chat 1 2\x01 this";
        let out = replace_payload(body, "DCC CHAT chat 1 2", "\x01DCC CHAT chat 3 4\x01");
        assert_eq!(out.as_deref(), Some("keep \x01DCC CHAT chat 3 4\x01 this"));

        let gone = replace_payload(body, "DCC CHAT chat 1 2", "");
        assert_eq!(gone.as_deref(), Some("keep  this"));

        assert!(replace_payload(body, "NOT THERE", "").is_none());
    }

    #[test]
    fn test_framing_preserved_around_rewrite() {
        // The non-CTCP portion must be byte-identical before and after
        let body = "a \x01DCC SEND f 1 2 3\x01 b";
        let (clean_before, _) = strip_ctcp(body);
        let rewritten = replace_payload(body, "DCC SEND f 1 2 3", "\x01DCC SEND f 9 8 3\x01")
            .expect("payload present");
        let (clean_after, _) = strip_ctcp(&rewritten);
        assert_eq!(clean_before, clean_after);
    }

    #[test]
    fn test_parse() {
        let c = CtcpMessage::parse("ACTION waves hello").unwrap();
        assert_eq!(c.command, "ACTION");
        assert_eq!(c.params, vec!["waves", "hello"]);
        assert_eq!(c.text.as_deref(), Some("waves hello"));
    }

    #[test]
    fn test_parse_bare_command() {
        let c = CtcpMessage::parse("version").unwrap();
        assert_eq!(c.command, "VERSION");
        assert!(c.params.is_empty());
        assert!(c.text.is_none());
    }

    #[test]
    fn test_parse_empty() {
        assert!(CtcpMessage::parse("").is_none());
        assert!(CtcpMessage::parse("\\").is_none());
    }

    #[test]
    fn test_parse_roundtrip_params() {
        let c = CtcpMessage::parse("DCC SEND file.bin 16909060 5000 10000").unwrap();
        assert_eq!(c.param(0), Some("SEND"));
        assert_eq!(c.param(1), Some("file.bin"));
        assert_eq!(c.param(4), Some("10000"));
    }
}
