use thiserror::Error;

/// Why an identifier failed to parse.
///
/// These variants exist for diagnostics and tests; operator-facing output
/// always collapses them into [`ValidationError::MalformedId`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("missing or wrong sigil")]
    BadSigil,

    #[error("identifier too long")]
    TooLong,

    #[error("empty localpart")]
    EmptyLocalpart,

    #[error("invalid character in localpart")]
    BadLocalpart,

    #[error("missing server name")]
    MissingServerName,

    #[error("invalid server name")]
    BadServerName,

    #[error("invalid character")]
    BadCharacter,
}

/// Command rejection kinds.
///
/// Each variant carries a constant, non-leaking message: no echoed input, no
/// storage or schema detail.  The set is fixed; new failure modes must map
/// onto one of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Unknown command.")]
    UnknownCommand,

    #[error("Malformed identifier argument.")]
    MalformedId,

    #[error("Command or argument is too long.")]
    TooLong,

    #[error("Command contains unsupported characters.")]
    InvalidCharacters,

    #[error("Wrong number of arguments.")]
    WrongArity,
}
