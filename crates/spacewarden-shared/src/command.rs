//! Command parsing and shape validation.
//!
//! [`parse_command`] turns raw message text into a typed [`Command`] or a
//! [`ValidationError`].  It is pure input validation: no store lookups, no
//! network, no authorization.  Authorization happens afterwards in
//! [`crate::authz`].
//!
//! The validation pipeline, in order:
//! 1. the configured prefix must be immediately followed by a verb from the
//!    byte-exact allow-list ([`crate::constants::COMMAND_VERBS`]);
//! 2. the whole message is restricted to printable ASCII, which rejects
//!    control characters, null bytes, zero-width characters, and
//!    mixed-script verb lookalikes in one pass;
//! 3. tokens are split on spaces in a single pass with a bounded count;
//! 4. each identifier argument must match its grammar exactly;
//! 5. total and per-argument lengths are bounded (reject, never truncate).
//!
//! Every rejection maps to exactly one [`ValidationError`] kind with a
//! constant message that echoes nothing back.

use std::str::FromStr;

use crate::constants::{
    COMMAND_VERBS, MAX_ARGUMENT_LENGTH, MAX_COMMAND_LENGTH, MAX_TOKEN_COUNT,
};
use crate::error::{IdParseError, ValidationError};
use crate::ids::{RoomId, RoomRef, UserId};

/// A validated operator command, ready for authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `help` -- list commands.
    Help,
    /// `status` -- uptime, queue size, invite counters.
    Status,
    /// `invite <user> [space]` -- enqueue invite intents for one user.
    Invite {
        user: UserId,
        space: Option<RoomId>,
    },
    /// `rooms` -- list configured rules.
    Rooms,
    /// `autoinvite add <space> <room>`.
    AutoinviteAdd { space: RoomRef, room: RoomRef },
    /// `autoinvite remove <space> <room>`.
    AutoinviteRemove { space: RoomRef, room: RoomRef },
    /// `autoinvite list`.
    AutoinviteList,
    /// `unblock <user> [room]`.
    Unblock {
        user: UserId,
        room: Option<RoomId>,
    },
}

impl Command {
    /// Whether the command is served without a power-level check.
    pub fn is_public(&self) -> bool {
        matches!(self, Command::Help | Command::Status)
    }
}

/// Parse a raw message into a [`Command`].
///
/// `body` is the full message text including the prefix.  Text that does not
/// start with the prefix, or whose verb is not on the allow-list, yields
/// [`ValidationError::UnknownCommand`].
pub fn parse_command(prefix: &str, body: &str) -> Result<Command, ValidationError> {
    if body.len() > MAX_COMMAND_LENGTH {
        return Err(ValidationError::TooLong);
    }

    let payload = body
        .strip_prefix(prefix)
        .ok_or(ValidationError::UnknownCommand)?;

    // The verb must follow the prefix immediately; "!! help" is not a
    // command.
    if payload.is_empty() || payload.starts_with(' ') {
        return Err(ValidationError::UnknownCommand);
    }

    // One charset pass over the payload.  Printable ASCII plus the space
    // separator only: control characters (including NUL), zero-width
    // characters, and any non-ASCII byte are rejected here, before
    // tokenization.
    if !payload.bytes().all(|b| b == b' ' || (0x21..=0x7e).contains(&b)) {
        return Err(ValidationError::InvalidCharacters);
    }

    // Single-pass, space-delimited split with a bounded token count.
    let mut tokens = Vec::new();
    for token in payload.split(' ').filter(|t| !t.is_empty()) {
        if tokens.len() == MAX_TOKEN_COUNT {
            return Err(ValidationError::WrongArity);
        }
        if token.len() > MAX_ARGUMENT_LENGTH {
            return Err(ValidationError::TooLong);
        }
        tokens.push(token);
    }

    let (verb, args) = tokens
        .split_first()
        .ok_or(ValidationError::UnknownCommand)?;

    // Byte-exact, case-sensitive verb match.
    if !COMMAND_VERBS.contains(verb) {
        return Err(ValidationError::UnknownCommand);
    }

    match *verb {
        "help" => expect_no_args(args, Command::Help),
        "status" => expect_no_args(args, Command::Status),
        "rooms" => expect_no_args(args, Command::Rooms),
        "invite" => parse_invite(args),
        "autoinvite" => parse_autoinvite(args),
        "unblock" => parse_unblock(args),
        _ => unreachable!("verb was matched against the allow-list"),
    }
}

fn expect_no_args(args: &[&str], command: Command) -> Result<Command, ValidationError> {
    if args.is_empty() {
        Ok(command)
    } else {
        Err(ValidationError::WrongArity)
    }
}

fn parse_invite(args: &[&str]) -> Result<Command, ValidationError> {
    // Positional arguments are validated left to right, so a malformed ID
    // is reported as such even when extra tokens follow it.
    let mut args = args.iter();
    let user = parse_user(args.next().ok_or(ValidationError::WrongArity)?)?;
    let space = args.next().map(|raw| parse_room(raw)).transpose()?;
    if args.next().is_some() {
        return Err(ValidationError::WrongArity);
    }
    Ok(Command::Invite { user, space })
}

fn parse_autoinvite(args: &[&str]) -> Result<Command, ValidationError> {
    let (sub, rest) = args.split_first().ok_or(ValidationError::WrongArity)?;
    match *sub {
        "list" => expect_no_args(rest, Command::AutoinviteList),
        "add" | "remove" => {
            let mut rest = rest.iter();
            let space = parse_room_ref(rest.next().ok_or(ValidationError::WrongArity)?)?;
            let room = parse_room_ref(rest.next().ok_or(ValidationError::WrongArity)?)?;
            if rest.next().is_some() {
                return Err(ValidationError::WrongArity);
            }
            if *sub == "add" {
                Ok(Command::AutoinviteAdd { space, room })
            } else {
                Ok(Command::AutoinviteRemove { space, room })
            }
        }
        _ => Err(ValidationError::UnknownCommand),
    }
}

fn parse_unblock(args: &[&str]) -> Result<Command, ValidationError> {
    let mut args = args.iter();
    let user = parse_user(args.next().ok_or(ValidationError::WrongArity)?)?;
    let room = args.next().map(|raw| parse_room(raw)).transpose()?;
    if args.next().is_some() {
        return Err(ValidationError::WrongArity);
    }
    Ok(Command::Unblock { user, room })
}

fn parse_user(raw: &str) -> Result<UserId, ValidationError> {
    UserId::from_str(raw).map_err(id_error)
}

fn parse_room(raw: &str) -> Result<RoomId, ValidationError> {
    RoomId::from_str(raw).map_err(id_error)
}

fn parse_room_ref(raw: &str) -> Result<RoomRef, ValidationError> {
    RoomRef::parse(raw).map_err(id_error)
}

fn id_error(err: IdParseError) -> ValidationError {
    match err {
        IdParseError::TooLong => ValidationError::TooLong,
        _ => ValidationError::MalformedId,
    }
}
