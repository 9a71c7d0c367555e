//! Peer endpoint addresses.
//!
//! Peers are identified by their URI string (e.g.
//! `ws://[::ffff:120.26.164.224]:8100`). The parsed form only exists so a
//! connector can dial the host; equality and pooling always key on the
//! original URI.

use crate::error::RelayError;

/// A peer broker's address, parsed from its URI string.
///
/// Immutable once parsed. Identity is the normalized `uri` string, not the
/// derived fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    /// The original URI, used as the pooling/identity key.
    pub uri: String,
    /// URI host with any trailing `:port` suffix stripped. Bracketed IPv6
    /// hosts keep their brackets.
    pub hostname: String,
    pub port: Option<u16>,
    /// Set for `wss:` and `https:` schemes.
    pub secure: bool,
}

impl PeerEndpoint {
    /// Parse a `scheme://host[:port]` URI.
    pub fn parse(uri: &str) -> Result<Self, RelayError> {
        let invalid = || RelayError::InvalidEndpoint {
            uri: uri.to_string(),
        };

        let (scheme, rest) = uri.split_once("://").ok_or_else(invalid)?;
        // Authority ends at the first path/query/fragment separator.
        let authority = rest
            .split(['/', '?', '#'])
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(invalid)?;

        let (hostname, port) = split_host_port(authority);
        if hostname.is_empty() {
            return Err(invalid());
        }

        let port = match port {
            Some(raw) => Some(raw.parse::<u16>().map_err(|_| invalid())?),
            None => None,
        };

        Ok(Self {
            uri: uri.to_string(),
            hostname: hostname.to_string(),
            port,
            secure: matches!(scheme, "wss" | "https"),
        })
    }
}

/// Split a trailing `:port` off an authority string, leaving bracketed
/// IPv6 hosts intact.
fn split_host_port(authority: &str) -> (&str, Option<&str>) {
    if let Some(bracket_end) = authority.rfind(']') {
        // `[::1]:8100` -> host `[::1]`, port `8100`; `[::1]` -> no port.
        match authority[bracket_end + 1..].strip_prefix(':') {
            Some(port) => (&authority[..=bracket_end], Some(port)),
            None => (authority, None),
        }
    } else if let Some((host, port)) = authority.rsplit_once(':') {
        (host, Some(port))
    } else {
        (authority, None)
    }
}
