//! Power-level authorization gate.
//!
//! [`authorize`] is a pure function over a pre-fetched fact set.  Callers
//! gather the sender's power levels once per command (current room plus
//! every configured space) and the gate only compares integers; it never
//! queries live state.

use crate::command::Command;

/// Power-level facts about a command sender, fetched once per command.
#[derive(Debug, Clone, Default)]
pub struct PowerLevelFacts {
    /// The sender's power level in the room the command was sent in, if
    /// known.
    pub room_level: Option<i64>,
    /// The sender's power levels in each configured space, where known.
    /// Unknown levels are simply absent.
    pub space_levels: Vec<i64>,
}

/// Authorization outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Decide whether a parsed command may run.
///
/// Public commands are always allowed.  Everything else requires a power
/// level of at least `threshold` in the current room or in at least one
/// configured space.  Absent facts never grant access: the default is
/// `Deny`.
pub fn authorize(command: &Command, facts: &PowerLevelFacts, threshold: i64) -> Decision {
    if command.is_public() {
        return Decision::Allow;
    }

    if facts.room_level.is_some_and(|level| level >= threshold) {
        return Decision::Allow;
    }

    if facts.space_levels.iter().any(|level| *level >= threshold) {
        return Decision::Allow;
    }

    Decision::Deny
}

/// The single operator-facing denial message.  Deliberately identical for
/// every denied command so the response reveals nothing about the command
/// itself.
pub const NOT_AUTHORIZED_MESSAGE: &str = "Not authorized.";
