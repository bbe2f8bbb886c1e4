//! Wildcard matching for hostmasks and server names.
//!
//! `*` matches any run of characters (including none), `?` matches exactly
//! one.  The match runs in linear state with at most one remembered star
//! position, so adversarial patterns like `*a*a*a*a*b` cannot cause an
//! exponential blowup.

use crate::casemap::irc_lower_char;

/// Match `text` against `mask`, case-sensitively.
pub fn wildmatch(text: &str, mask: &str) -> bool {
    wildmatch_by(text, mask, |c| c)
}

/// Match `text` against `mask` under IRC case folding.
pub fn irc_wildmatch(text: &str, mask: &str) -> bool {
    wildmatch_by(text, mask, irc_lower_char)
}

fn wildmatch_by(text: &str, mask: &str, fold: fn(char) -> char) -> bool {
    let t: Vec<char> = text.chars().map(fold).collect();
    let m: Vec<char> = mask.chars().map(fold).collect();

    let (mut ti, mut mi) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if mi < m.len() && (m[mi] == '?' || m[mi] == t[ti]) {
            ti += 1;
            mi += 1;
        } else if mi < m.len() && m[mi] == '*' {
            star = Some((mi, ti));
            mi += 1;
        } else if let Some((smi, sti)) = star {
            // Stretch the last star by one character and retry
            star = Some((smi, sti + 1));
            mi = smi + 1;
            ti = sti + 1;
        } else {
            return false;
        }
    }

    m[mi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_matches_everything() {
        for text in ["", "x", "anything at all", "*?"] {
            assert!(wildmatch(text, "*"));
        }
    }

    #[test]
    fn test_literal() {
        assert!(wildmatch("host.example.com", "host.example.com"));
        assert!(!wildmatch("host.example.com", "host.example.org"));
    }

    #[test]
    fn test_star() {
        assert!(wildmatch("user.dsl.example.com", "*.example.com"));
        assert!(wildmatch("abc", "a*c"));
        assert!(wildmatch("ac", "a*c"));
        assert!(!wildmatch("ab", "a*c"));
        assert!(wildmatch("abc", "abc*"));
    }

    #[test]
    fn test_question() {
        assert!(wildmatch("abc", "a?c"));
        assert!(!wildmatch("ac", "a?c"));
        assert!(!wildmatch("abbc", "a?c"));
    }

    #[test]
    fn test_mixed() {
        assert!(wildmatch("nick!user@host", "*!*@host"));
        assert!(wildmatch("nick!user@host", "n?ck!*@*"));
        assert!(!wildmatch("nick!user@host", "x*!*@*"));
    }

    #[test]
    fn test_no_backtracking_blowup() {
        // Degenerate pattern against a non-matching string; must terminate
        // promptly rather than exploring 2^n split points.
        let text = "a".repeat(64);
        let mask = "*a*a*a*a*a*a*b";
        assert!(!wildmatch(&text, mask));

        let matching = format!("{}b", "a".repeat(64));
        assert!(wildmatch(&matching, mask));
    }

    #[test]
    fn test_case_folding() {
        assert!(irc_wildmatch("Nick[1]", "nick{1}"));
        assert!(irc_wildmatch("HOST.EXAMPLE.COM", "*.example.com"));
        assert!(!wildmatch("HOST.EXAMPLE.COM", "*.example.com"));
    }

    #[test]
    fn test_deterministic() {
        for _ in 0..3 {
            assert!(wildmatch("abcabc", "*abc"));
            assert!(!wildmatch("abcabd", "*abc"));
        }
    }
}
