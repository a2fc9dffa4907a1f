//! The homeserver abstraction.
//!
//! The engine never talks HTTP; it calls this trait.  The production
//! implementation lives in the bot binary; tests use a mock.

use std::collections::HashSet;

use async_trait::async_trait;
use spacewarden_shared::{RoomAlias, RoomId, UserId};
use thiserror::Error;

/// Errors surfaced by homeserver calls, classified for retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The server asked us to slow down.  Retryable after the given delay.
    #[error("rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    /// Network or 5xx-class failure.  Retryable.
    #[error("transient homeserver error: {0}")]
    Transient(String),

    /// The invited user is already a member of the room.  Not a failure.
    #[error("user is already a member")]
    AlreadyMember,

    /// The room does not exist (or the bot cannot see it).
    #[error("unknown room")]
    UnknownRoom,

    /// The user does not exist.
    #[error("unknown user")]
    UnknownUser,

    /// Any other non-retryable rejection (e.g. missing permission).
    #[error("homeserver rejected the request: {0}")]
    Rejected(String),
}

impl ClientError {
    /// Whether the dispatcher may retry the call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::RateLimited { .. } | ClientError::Transient(_)
        )
    }
}

/// The external chat client, reduced to the calls the engine needs.
///
/// Spaces are rooms, so one membership query serves both
/// `listSpaceMembers` and `listRoomMembers`.
#[async_trait]
pub trait Homeserver: Send + Sync {
    /// The set of currently joined members of a room or space.
    async fn joined_members(&self, room: &RoomId) -> Result<HashSet<UserId>, ClientError>;

    /// Invite a user to a room.
    async fn invite(&self, room: &RoomId, user: &UserId) -> Result<(), ClientError>;

    /// The user's power level in a room or space, if the server knows it.
    async fn power_level(&self, room: &RoomId, user: &UserId)
        -> Result<Option<i64>, ClientError>;

    /// Resolve a room alias to a room ID.
    async fn resolve_alias(&self, alias: &RoomAlias) -> Result<RoomId, ClientError>;

    /// Join a room (used after rule creation so the bot can see members).
    async fn join_room(&self, room: &RoomId) -> Result<(), ClientError>;

    /// Send an `m.notice` message to a room.
    async fn send_notice(&self, room: &RoomId, body: &str) -> Result<(), ClientError>;
}
