//! Domain model structs persisted in the SQLite database.

use chrono::{DateTime, Utc};
use spacewarden_shared::{RoomId, UserId};

// ---------------------------------------------------------------------------
// Autoinvite rule
// ---------------------------------------------------------------------------

/// A durable `(space, room)` mapping: members joining `space_id` are invited
/// to `room_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoinviteRule {
    /// The space whose membership is watched.
    pub space_id: RoomId,
    /// The room members are invited into.
    pub room_id: RoomId,
    /// Who created the rule, when created by command.
    pub added_by: Option<UserId>,
    /// When the rule was created.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Block record
// ---------------------------------------------------------------------------

/// Why a user is blocked from re-invitation to a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// The user left the room on their own.
    Left,
    /// The user was banned from the room.
    Banned,
    /// Reserved for operator tooling; never produced by event handling.
    Manual,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Left => "left",
            BlockReason::Banned => "banned",
            BlockReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "left" => Some(BlockReason::Left),
            "banned" => Some(BlockReason::Banned),
            "manual" => Some(BlockReason::Manual),
            _ => None,
        }
    }
}

/// One `(user, room)` suppression entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub user_id: UserId,
    pub room_id: RoomId,
    pub reason: BlockReason,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Invite queue
// ---------------------------------------------------------------------------

/// Lifecycle of an invite intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteStatus {
    /// Waiting for the dispatcher.
    Pending,
    /// Invite issued, awaiting acceptance.
    Invited,
    /// The user joined (or was already a member).
    Accepted,
    /// Acceptance timeout elapsed with the user still absent.
    Expired,
    /// Suppressed by a block created after enqueueing.
    Blocked,
    /// Retries exhausted or a non-retryable failure.
    Failed,
}

impl InviteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InviteStatus::Pending => "pending",
            InviteStatus::Invited => "invited",
            InviteStatus::Accepted => "accepted",
            InviteStatus::Expired => "expired",
            InviteStatus::Blocked => "blocked",
            InviteStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InviteStatus::Pending),
            "invited" => Some(InviteStatus::Invited),
            "accepted" => Some(InviteStatus::Accepted),
            "expired" => Some(InviteStatus::Expired),
            "blocked" => Some(InviteStatus::Blocked),
            "failed" => Some(InviteStatus::Failed),
            _ => None,
        }
    }

    /// Terminal rows are history: they never transition again, and a new
    /// intent for the same pair may be enqueued afterwards.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InviteStatus::Pending | InviteStatus::Invited)
    }
}

/// One row of the invite queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InviteQueueItem {
    pub id: i64,
    pub user_id: UserId,
    pub room_id: RoomId,
    pub space_id: Option<RoomId>,
    pub status: InviteStatus,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Per-status invite queue totals, reported by the `status` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub invited: u64,
    pub accepted: u64,
    pub expired: u64,
    pub blocked: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.invited + self.accepted + self.expired + self.blocked + self.failed
    }
}
