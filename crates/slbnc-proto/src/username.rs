//! Username sanitisation.

/// Used when sanitisation leaves nothing behind.
const FALLBACK_USERNAME: &str = "user";

/// Strip everything but ASCII alphanumerics from a username before passing
/// it to a server in a USER command.  Falls back to `"user"` when nothing
/// survives.
pub fn sanitize_username(raw: &str) -> String {
    let cleaned: String = raw.chars().filter(char::is_ascii_alphanumeric).collect();
    if cleaned.is_empty() {
        FALLBACK_USERNAME.to_owned()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough() {
        assert_eq!(sanitize_username("alice"), "alice");
        assert_eq!(sanitize_username("Alice42"), "Alice42");
    }

    #[test]
    fn test_strips_punctuation() {
        assert_eq!(sanitize_username("~al.ice!"), "alice");
        assert_eq!(sanitize_username("a b c"), "abc");
    }

    #[test]
    fn test_fallback() {
        assert_eq!(sanitize_username(""), "user");
        assert_eq!(sanitize_username("~!@#"), "user");
    }
}
