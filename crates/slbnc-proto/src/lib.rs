//! # slbnc-proto
//!
//! Protocol primitives for the slbncd IRC bouncer.
//!
//! A bouncer sits between an IRC client and an IRC server and forwards most
//! traffic verbatim, so this crate deliberately models messages with a
//! generic parameter list rather than a typed command enum: unknown commands
//! must survive the round trip untouched.
//!
//! ## Features
//!
//! - IRC message parsing to `{prefix, command, params}` with the original
//!   line preserved by the caller
//! - CTCP dequoting, stripping and payload parsing (`\x01`-delimited)
//! - DCC CHAT/SEND offer parsing and rewriting (host-order IPv4 integers)
//! - RFC 1459 case mapping and case-insensitive comparison
//! - Wildcard hostmask matching without pathological backtracking
//! - Username sanitisation for the USER command
//! - Optional Tokio line codec for framed transports
//!
//! ## Quick Start
//!
//! ```rust
//! use slbnc_proto::Message;
//!
//! let msg: Message = ":nick!user@host PRIVMSG #channel :Hello!".parse().unwrap();
//! assert_eq!(msg.command, "PRIVMSG");
//! assert_eq!(msg.params, vec!["#channel", "Hello!"]);
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod casemap;
pub mod ctcp;
pub mod dcc;
pub mod error;
#[cfg(feature = "tokio")]
pub mod line;
pub mod message;
pub mod prefix;
pub mod username;
pub mod wildcard;

pub use self::casemap::{irc_eq, irc_lower_char, irc_to_lower};
pub use self::ctcp::{strip_ctcp, CtcpMessage, CTCP_DELIM};
pub use self::dcc::{DccEndpoint, DccOffer, DccOfferKind};
pub use self::error::{MessageParseError, ProtocolError};
#[cfg(feature = "tokio")]
pub use self::line::LineCodec;
pub use self::message::Message;
pub use self::prefix::Prefix;
pub use self::username::sanitize_username;
pub use self::wildcard::{irc_wildmatch, wildmatch};
