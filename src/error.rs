//! Unified error handling for slbncd.

use std::io;
use thiserror::Error;

/// Top-level daemon errors.
///
/// Each variant maps to the exit code the command-line front-end reports:
/// usage problems exit 1, configuration problems exit 2, listen failures
/// exit 3.
#[derive(Debug, Error)]
pub enum Error {
    #[error("usage: {0}")]
    Usage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot listen: {0}")]
    Listen(io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// The process exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage(_) => 1,
            Error::Config(_) => 2,
            Error::Listen(_) => 3,
            Error::Io(_) => 1,
        }
    }
}

/// Daemon-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
