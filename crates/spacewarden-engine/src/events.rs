//! The event stream consumed by the bot's main loop.
//!
//! The transport adapter translates raw sync payloads into these variants;
//! whether a joined room is a watched space or a target room is decided by
//! the engine against the rule store, not by the adapter.

use spacewarden_shared::{RoomId, UserId};

/// One event from the homeserver, delivered serially.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A user joined a room (possibly a space).
    MemberJoined {
        event_id: Option<String>,
        room: RoomId,
        user: UserId,
        timestamp_ms: i64,
    },

    /// A user was invited to a room.  Invites aimed at the bot itself are
    /// how operators bootstrap it into spaces and rooms.
    MemberInvited {
        event_id: Option<String>,
        room: RoomId,
        user: UserId,
        timestamp_ms: i64,
    },

    /// A user left a room or was banned from it.
    MemberLeft {
        event_id: Option<String>,
        room: RoomId,
        user: UserId,
        banned: bool,
        timestamp_ms: i64,
    },

    /// A text message, potentially an operator command.
    Message {
        event_id: Option<String>,
        room: RoomId,
        sender: UserId,
        body: String,
        timestamp_ms: i64,
    },

    /// One sync long-poll cycle finished.
    SyncComplete { next_batch: Option<String> },
}
