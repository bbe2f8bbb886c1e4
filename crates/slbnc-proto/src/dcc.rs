//! DCC offer payloads.
//!
//! DCC negotiates a direct TCP connection through a CTCP payload of the
//! form `DCC CHAT chat <addr> <port>` or `DCC SEND <filename> <addr>
//! <port> [<size>...]`, where `<addr>` is the decimal form of the IPv4
//! address as a host-order 32-bit integer.  A bouncer rewrites the address
//! and port to point at itself before forwarding the offer.

use std::fmt;
use std::net::Ipv4Addr;

use crate::ctcp::CtcpMessage;

/// Encode an IPv4 address as the DCC decimal integer form.
pub fn encode_addr(addr: Ipv4Addr) -> u32 {
    u32::from(addr)
}

/// Decode the DCC decimal integer form into an IPv4 address.
pub fn decode_addr(n: u32) -> Ipv4Addr {
    Ipv4Addr::from(n)
}

/// The two kinds of DCC offer a bouncer proxies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DccOfferKind {
    /// `DCC CHAT chat <addr> <port>`
    Chat,
    /// `DCC SEND <filename> <addr> <port> [<size>]`
    Send,
}

impl DccOfferKind {
    /// Wire name of the sub-command.
    pub fn as_str(&self) -> &'static str {
        match self {
            DccOfferKind::Chat => "CHAT",
            DccOfferKind::Send => "SEND",
        }
    }
}

/// The remote endpoint advertised inside a DCC offer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DccEndpoint {
    /// IPv4 address, decoded from the host-order integer.
    pub addr: Ipv4Addr,
    /// TCP port.
    pub port: u16,
}

impl fmt::Display for DccEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// A parsed `DCC CHAT` or `DCC SEND` offer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DccOffer {
    /// Chat or send.
    pub kind: DccOfferKind,
    /// `chat` for CHAT offers, the filename for SEND offers.
    pub argument: String,
    /// Where the offering party is listening.
    pub endpoint: DccEndpoint,
    /// Any parameters after the port (file size, for SEND), joined.
    pub rest: Option<String>,
}

impl DccOffer {
    /// Extract an offer from a parsed `DCC` CTCP payload.  Returns `None`
    /// for other sub-commands (ACCEPT, RESUME, REJECT, ...) and for
    /// malformed offers.
    pub fn from_ctcp(ctcp: &CtcpMessage) -> Option<Self> {
        if !ctcp.is("DCC") || ctcp.params.len() < 4 {
            return None;
        }
        let kind = match ctcp.params[0].to_ascii_uppercase().as_str() {
            "CHAT" => DccOfferKind::Chat,
            "SEND" => DccOfferKind::Send,
            _ => return None,
        };
        let addr = decode_addr(ctcp.params[2].parse().ok()?);
        let port: u16 = ctcp.params[3].parse().ok()?;
        let rest = if ctcp.params.len() > 4 {
            Some(ctcp.params[4..].join(" "))
        } else {
            None
        };
        Some(DccOffer {
            kind,
            argument: ctcp.params[1].clone(),
            endpoint: DccEndpoint { addr, port },
            rest,
        })
    }

    /// Format the offer payload (without CTCP delimiters) advertising a
    /// different address and port, keeping the trailing parameters.
    pub fn rewritten(&self, addr: Ipv4Addr, port: u16) -> String {
        let mut out = format!(
            "DCC {} {} {} {}",
            self.kind.as_str(),
            self.argument,
            encode_addr(addr),
            port
        );
        if let Some(ref rest) = self.rest {
            out.push(' ');
            out.push_str(rest);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctcp(s: &str) -> CtcpMessage {
        CtcpMessage::parse(s).expect("valid ctcp")
    }

    #[test]
    fn test_addr_codec() {
        let ip = Ipv4Addr::new(1, 2, 3, 4);
        assert_eq!(encode_addr(ip), 0x0102_0304);
        assert_eq!(decode_addr(0x0102_0304), ip);
    }

    #[test]
    fn test_parse_chat() {
        let offer = DccOffer::from_ctcp(&ctcp("DCC CHAT chat 2130706433 5000")).unwrap();
        assert_eq!(offer.kind, DccOfferKind::Chat);
        assert_eq!(offer.argument, "chat");
        assert_eq!(offer.endpoint.addr, Ipv4Addr::LOCALHOST);
        assert_eq!(offer.endpoint.port, 5000);
        assert!(offer.rest.is_none());
    }

    #[test]
    fn test_parse_send_with_size() {
        let offer = DccOffer::from_ctcp(&ctcp("DCC SEND file.bin 16909060 5000 10000")).unwrap();
        assert_eq!(offer.kind, DccOfferKind::Send);
        assert_eq!(offer.argument, "file.bin");
        assert_eq!(offer.endpoint.addr, Ipv4Addr::new(1, 2, 3, 4));
        assert_eq!(offer.rest.as_deref(), Some("10000"));
    }

    #[test]
    fn test_other_subcommands_ignored() {
        assert!(DccOffer::from_ctcp(&ctcp("DCC RESUME file.bin 5000 4000")).is_none());
        assert!(DccOffer::from_ctcp(&ctcp("DCC ACCEPT file.bin 5000 4000")).is_none());
        assert!(DccOffer::from_ctcp(&ctcp("PING 12345")).is_none());
    }

    #[test]
    fn test_rewrite_keeps_trailing() {
        let offer = DccOffer::from_ctcp(&ctcp("DCC SEND file.bin 16909060 5000 10000")).unwrap();
        let out = offer.rewritten(Ipv4Addr::new(10, 0, 0, 1), 57123);
        assert_eq!(out, format!("DCC SEND file.bin {} 57123 10000", 0x0a00_0001u32));
    }
}
