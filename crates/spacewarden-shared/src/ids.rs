//! Matrix identifier grammars.
//!
//! Every identifier the bot accepts is parsed through one of the newtypes
//! here.  Parsing is strict: missing sigil, doubled sigil, or a missing
//! server name are rejected, never coerced.  All identifiers are restricted
//! to printable ASCII, which also rules out zero-width and confusable
//! characters by construction.
//!
//! Grammars:
//! - user ID:    `@<localpart>:<server>`
//! - room ID:    `!<opaque-id>:<server>`
//! - alias:      `#<name>:<server>`
//!
//! `<server>` is a DNS name, an IPv4 literal, or a bracketed IPv6 literal,
//! optionally followed by `:<port>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::MAX_ID_LENGTH;
use crate::error::IdParseError;

/// A fully-qualified Matrix user ID, e.g. `@alice:example.com`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

/// A Matrix room ID, e.g. `!abc123:example.com`.
///
/// Spaces are rooms; a space ID uses the same grammar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

/// A Matrix room alias, e.g. `#general:example.com`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RoomAlias(String);

/// A room reference as accepted in command arguments: either a room ID or
/// an alias that still needs resolution through the homeserver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRef {
    Id(RoomId),
    Alias(RoomAlias),
}

impl UserId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The server-name component, e.g. `example.com`.
    pub fn server_name(&self) -> &str {
        // The separator is guaranteed present by the parser.
        self.0.split_once(':').map(|(_, s)| s).unwrap_or("")
    }
}

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl RoomAlias {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl RoomRef {
    /// Parse a room reference: `!room:server` or `#alias:server`.
    pub fn parse(raw: &str) -> Result<Self, IdParseError> {
        match raw.as_bytes().first() {
            Some(b'!') => RoomId::from_str(raw).map(RoomRef::Id),
            Some(b'#') => RoomAlias::from_str(raw).map(RoomRef::Alias),
            _ => Err(IdParseError::BadSigil),
        }
    }
}

impl FromStr for UserId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_identifier(s, b'@')?;
        Ok(Self(s.to_owned()))
    }
}

impl FromStr for RoomId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_identifier(s, b'!')?;
        Ok(Self(s.to_owned()))
    }
}

impl FromStr for RoomAlias {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_identifier(s, b'#')?;
        Ok(Self(s.to_owned()))
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RoomAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RoomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomRef::Id(id) => f.write_str(id.as_str()),
            RoomRef::Alias(alias) => f.write_str(alias.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// Grammar checks
// ---------------------------------------------------------------------------

/// Validate `<sigil><localpart>:<server>` and return `Ok` on success.
fn parse_identifier(raw: &str, sigil: u8) -> Result<(), IdParseError> {
    if raw.len() > MAX_ID_LENGTH {
        return Err(IdParseError::TooLong);
    }
    if !raw.is_ascii() {
        return Err(IdParseError::BadCharacter);
    }

    let rest = match raw.as_bytes().first() {
        Some(b) if *b == sigil => &raw[1..],
        _ => return Err(IdParseError::BadSigil),
    };

    // The localpart charset excludes ':', so the first colon separates the
    // localpart from the server name.
    let (localpart, server) = rest
        .split_once(':')
        .ok_or(IdParseError::MissingServerName)?;

    if localpart.is_empty() {
        return Err(IdParseError::EmptyLocalpart);
    }
    if !localpart.bytes().all(is_localpart_byte) {
        return Err(IdParseError::BadLocalpart);
    }
    if server.is_empty() {
        return Err(IdParseError::MissingServerName);
    }
    if !is_valid_server_name(server) {
        return Err(IdParseError::BadServerName);
    }

    Ok(())
}

/// Characters allowed in localparts, opaque room IDs, and alias names.
fn is_localpart_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'=' | b'-' | b'/' | b'+')
}

/// Validate a Matrix server name: DNS name, IPv4 literal, or bracketed IPv6
/// literal, each with an optional `:<port>` suffix.
pub fn is_valid_server_name(server: &str) -> bool {
    if server.is_empty() || server.len() > MAX_ID_LENGTH || !server.is_ascii() {
        return false;
    }

    if let Some(rest) = server.strip_prefix('[') {
        // Bracketed IPv6: `[<addr>]` or `[<addr>]:<port>`.
        let Some((addr, tail)) = rest.split_once(']') else {
            return false;
        };
        if !is_valid_ipv6_literal(addr) {
            return false;
        }
        return match tail.strip_prefix(':') {
            Some(port) => is_valid_port(port),
            None => tail.is_empty(),
        };
    }

    // DNS names and IPv4 literals cannot contain ':', so a colon starts the
    // port suffix.
    let (host, port) = match server.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (server, None),
    };

    if let Some(port) = port {
        if !is_valid_port(port) {
            return false;
        }
    }

    // An IPv4 literal is also a syntactically valid DNS name (all-numeric
    // labels), so one grammar covers both.
    is_valid_dns_name(host)
}

fn is_valid_dns_name(host: &str) -> bool {
    if host.is_empty() || host.len() > 255 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

fn is_valid_ipv6_literal(addr: &str) -> bool {
    // Syntactic check only: hex digits, colons, and dots (for v4-mapped
    // addresses).  At least one colon distinguishes it from other hosts.
    addr.len() >= 2
        && addr.len() <= 45
        && addr.contains(':')
        && addr
            .bytes()
            .all(|b| b.is_ascii_hexdigit() || b == b':' || b == b'.')
}

fn is_valid_port(port: &str) -> bool {
    !port.is_empty()
        && port.len() <= 5
        && port.bytes().all(|b| b.is_ascii_digit())
        && matches!(port.parse::<u32>(), Ok(1..=65535))
}
