//! CRUD operations for the durable invite queue.
//!
//! The queue holds invite intents produced by the reconciliation engine and
//! consumed by the dispatcher.  A partial unique index over non-terminal
//! statuses makes `enqueue_invite` safe to fire redundantly from any
//! producer: at most one live row exists per `(user, room)` pair, while
//! terminal rows remain as history and allow later re-enqueueing.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::params;
use spacewarden_shared::{RoomId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::models::{InviteQueueItem, InviteStatus, QueueStats};

const ITEM_COLUMNS: &str = "id, user_id, room_id, space_id, status, attempts, enqueued_at, expires_at";

impl Database {
    // ------------------------------------------------------------------
    // Produce
    // ------------------------------------------------------------------

    /// Enqueue an invite intent.  Returns `true` if a new item was created,
    /// `false` if a non-terminal item for the pair already exists.
    pub fn enqueue_invite(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
        space_id: Option<&RoomId>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO invite_queue (user_id, room_id, space_id, enqueued_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id.as_str(),
                room_id.as_str(),
                space_id.map(|s| s.as_str()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(affected > 0)
    }

    /// Whether a non-terminal item exists for the pair.
    pub fn has_active_invite(&self, user_id: &UserId, room_id: &RoomId) -> Result<bool> {
        let mut stmt = self.conn().prepare(
            "SELECT 1 FROM invite_queue
             WHERE user_id = ?1 AND room_id = ?2 AND status IN ('pending', 'invited')",
        )?;
        let exists = stmt.exists(params![user_id.as_str(), room_id.as_str()])?;
        Ok(exists)
    }

    // ------------------------------------------------------------------
    // Consume
    // ------------------------------------------------------------------

    /// Fetch up to `limit` pending items, oldest first.
    pub fn next_pending(&self, limit: usize) -> Result<Vec<InviteQueueItem>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM invite_queue
             WHERE status = 'pending'
             ORDER BY enqueued_at ASC, id ASC
             LIMIT ?1"
        ))?;

        let rows = stmt.query_map(params![limit as i64], row_to_item)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Transition an item to a new status.
    pub fn set_invite_status(&self, id: i64, status: InviteStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE invite_queue SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(())
    }

    /// Mark an item `invited`, recording the acceptance deadline when an
    /// acceptance timeout is configured.
    pub fn mark_invited(&self, id: i64, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        self.conn().execute(
            "UPDATE invite_queue SET status = 'invited', expires_at = ?2 WHERE id = ?1",
            params![id, expires_at.map(|t| t.to_rfc3339())],
        )?;
        Ok(())
    }

    /// Record a failed attempt, keeping the item pending for a retry.
    /// Returns the updated attempt count.
    pub fn record_invite_attempt(&self, id: i64) -> Result<u32> {
        self.conn().execute(
            "UPDATE invite_queue SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        let attempts: u32 = self.conn().query_row(
            "SELECT attempts FROM invite_queue WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    /// Transition every non-terminal item for a `(user, room)` pair to
    /// `blocked`.  Called when a block is created so no live intent
    /// survives for a blocked pair.  Returns the number of rows updated.
    pub fn cancel_active_invites(&self, user_id: &UserId, room_id: &RoomId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE invite_queue SET status = 'blocked'
             WHERE user_id = ?1 AND room_id = ?2 AND status IN ('pending', 'invited')",
            params![user_id.as_str(), room_id.as_str()],
        )?;
        Ok(affected)
    }

    /// Mark an `invited` item `accepted` once the user joins the room.
    /// Returns the number of rows updated.
    pub fn mark_accepted(&self, user_id: &UserId, room_id: &RoomId) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE invite_queue SET status = 'accepted'
             WHERE user_id = ?1 AND room_id = ?2 AND status = 'invited'",
            params![user_id.as_str(), room_id.as_str()],
        )?;
        Ok(affected)
    }

    /// `invited` items whose acceptance deadline has passed.
    pub fn overdue_invited(&self, now: DateTime<Utc>) -> Result<Vec<InviteQueueItem>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM invite_queue
             WHERE status = 'invited' AND expires_at IS NOT NULL AND expires_at <= ?1
             ORDER BY expires_at ASC"
        ))?;

        let rows = stmt.query_map(params![now.to_rfc3339()], row_to_item)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// Per-status totals across the whole queue, history included.
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let mut stmt = self
            .conn()
            .prepare("SELECT status, COUNT(*) FROM invite_queue GROUP BY status")?;

        let mut stats = QueueStats::default();
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            let count: u64 = row.get(1)?;
            Ok((status, count))
        })?;

        for row in rows {
            let (status, count) = row?;
            match InviteStatus::parse(&status) {
                Some(InviteStatus::Pending) => stats.pending = count,
                Some(InviteStatus::Invited) => stats.invited = count,
                Some(InviteStatus::Accepted) => stats.accepted = count,
                Some(InviteStatus::Expired) => stats.expired = count,
                Some(InviteStatus::Blocked) => stats.blocked = count,
                Some(InviteStatus::Failed) => stats.failed = count,
                None => tracing::warn!(status, "ignoring unknown invite status in stats"),
            }
        }
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<InviteQueueItem> {
    let conversion = |idx: usize, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };

    let id: i64 = row.get(0)?;
    let user_raw: String = row.get(1)?;
    let room_raw: String = row.get(2)?;
    let space_raw: Option<String> = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let attempts: u32 = row.get(5)?;
    let enqueued_raw: String = row.get(6)?;
    let expires_raw: Option<String> = row.get(7)?;

    let user_id = UserId::from_str(&user_raw).map_err(|e| conversion(1, Box::new(e)))?;
    let room_id = RoomId::from_str(&room_raw).map_err(|e| conversion(2, Box::new(e)))?;
    let space_id = space_raw
        .map(|s| RoomId::from_str(&s))
        .transpose()
        .map_err(|e| conversion(3, Box::new(e)))?;

    let status = InviteStatus::parse(&status_raw)
        .ok_or_else(|| conversion(4, format!("unknown invite status: {status_raw}").into()))?;

    let enqueued_at = chrono::DateTime::parse_from_rfc3339(&enqueued_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion(6, Box::new(e)))?;

    let expires_at = expires_raw
        .map(|s| chrono::DateTime::parse_from_rfc3339(&s).map(|dt| dt.with_timezone(&Utc)))
        .transpose()
        .map_err(|e| conversion(7, Box::new(e)))?;

    Ok(InviteQueueItem {
        id,
        user_id,
        room_id,
        space_id,
        status,
        attempts,
        enqueued_at,
        expires_at,
    })
}
