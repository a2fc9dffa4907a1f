//! Protocol and validation limits.

/// Default command prefix recognized in room messages.
pub const DEFAULT_COMMAND_PREFIX: &str = "!!";

/// Default minimum power level required for restricted commands.
pub const DEFAULT_MIN_POWER_LEVEL: i64 = 50;

/// Maximum total length of a command message, in bytes.
pub const MAX_COMMAND_LENGTH: usize = 1024;

/// Maximum length of a single whitespace-delimited token, in bytes.
pub const MAX_ARGUMENT_LENGTH: usize = 255;

/// Maximum length of any Matrix identifier, in bytes.
pub const MAX_ID_LENGTH: usize = 255;

/// Maximum number of whitespace-delimited tokens in one command.
pub const MAX_TOKEN_COUNT: usize = 8;

/// The exact set of recognized command verbs.  Matching is byte-exact and
/// case-sensitive; anything else is an unknown command.
pub const COMMAND_VERBS: &[&str] = &["help", "status", "invite", "rooms", "autoinvite", "unblock"];
