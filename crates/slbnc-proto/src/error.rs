//! Error types for protocol parsing and framing.

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while reading or writing the IRC transport.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// An underlying I/O error.
    #[error("an io error occurred")]
    Io(#[from] io::Error),

    /// A line exceeded the configured maximum length.
    #[error("message too long: {actual} bytes (limit {limit})")]
    MessageTooLong {
        /// Observed length in bytes.
        actual: usize,
        /// Configured limit in bytes.
        limit: usize,
    },

    /// A line was not valid UTF-8.
    #[error("invalid utf-8 at byte {byte_pos}: {details}")]
    InvalidUtf8 {
        /// Offset of the first invalid byte.
        byte_pos: usize,
        /// Description from the UTF-8 decoder.
        details: String,
    },

    /// A line failed to parse as an IRC message.
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] MessageParseError),
}

/// Errors that can occur while parsing an IRC message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageParseError {
    /// The line was empty (or contained only a prefix).
    #[error("empty message")]
    Empty,

    /// The line had a prefix but no command after it.
    #[error("message has no command")]
    NoCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ProtocolError::MessageTooLong {
            actual: 600,
            limit: 512,
        };
        assert_eq!(err.to_string(), "message too long: 600 bytes (limit 512)");
    }
}
