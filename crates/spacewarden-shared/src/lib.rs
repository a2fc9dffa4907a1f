//! # spacewarden-shared
//!
//! Pure domain logic shared by every Spacewarden crate: Matrix identifier
//! grammars, the command parser, and the power-level authorization gate.
//!
//! Nothing in this crate performs I/O.  The parser and the gate are plain
//! functions over their inputs so that adversarial command text is rejected
//! before any stateful component is touched.

pub mod authz;
pub mod command;
pub mod constants;
pub mod ids;

mod error;

pub use authz::{authorize, Decision, PowerLevelFacts, NOT_AUTHORIZED_MESSAGE};
pub use command::{parse_command, Command};
pub use error::{IdParseError, ValidationError};
pub use ids::{RoomAlias, RoomId, RoomRef, UserId};
