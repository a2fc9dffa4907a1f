//! CRUD operations for [`BlockRecord`] entries.
//!
//! Blocks suppress automatic re-invitation.  `add_block` upserts on the
//! `(user, room)` key, so blocking twice is a success; `remove_*` on absent
//! records is a no-op success.

use std::str::FromStr;

use chrono::Utc;
use rusqlite::params;
use spacewarden_shared::{RoomId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::models::{BlockReason, BlockRecord};

impl Database {
    /// Block a user from automatic re-invitation to a room.  Idempotent;
    /// a repeated block refreshes the reason and timestamp.
    pub fn add_block(&self, user_id: &UserId, room_id: &RoomId, reason: BlockReason) -> Result<()> {
        self.conn().execute(
            "INSERT INTO user_blocks (user_id, room_id, reason, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, room_id) DO UPDATE SET
                 reason = excluded.reason,
                 created_at = excluded.created_at",
            params![
                user_id.as_str(),
                room_id.as_str(),
                reason.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Remove all blocks for a user.  Returns the number of rows removed.
    pub fn remove_blocks_for_user(&self, user_id: &UserId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM user_blocks WHERE user_id = ?1",
            params![user_id.as_str()],
        )?;
        Ok(affected)
    }

    /// Remove a single `(user, room)` block.  Returns the number of rows
    /// removed (zero or one).
    pub fn remove_block(&self, user_id: &UserId, room_id: &RoomId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM user_blocks WHERE user_id = ?1 AND room_id = ?2",
            params![user_id.as_str(), room_id.as_str()],
        )?;
        Ok(affected)
    }

    /// Whether a user is blocked from a room.
    pub fn is_blocked(&self, user_id: &UserId, room_id: &RoomId) -> Result<bool> {
        let mut stmt = self
            .conn()
            .prepare("SELECT 1 FROM user_blocks WHERE user_id = ?1 AND room_id = ?2")?;
        let exists = stmt.exists(params![user_id.as_str(), room_id.as_str()])?;
        Ok(exists)
    }

    /// All blocks for one user, newest first.
    pub fn blocks_for_user(&self, user_id: &UserId) -> Result<Vec<BlockRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, room_id, reason, created_at
             FROM user_blocks
             WHERE user_id = ?1
             ORDER BY created_at DESC",
        )?;

        let rows = stmt.query_map(params![user_id.as_str()], row_to_block)?;

        let mut blocks = Vec::new();
        for row in rows {
            blocks.push(row?);
        }
        Ok(blocks)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<BlockRecord> {
    let user_raw: String = row.get(0)?;
    let room_raw: String = row.get(1)?;
    let reason_raw: String = row.get(2)?;
    let created_raw: String = row.get(3)?;

    let conversion = |idx: usize, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };

    let user_id = UserId::from_str(&user_raw).map_err(|e| conversion(0, Box::new(e)))?;
    let room_id = RoomId::from_str(&room_raw).map_err(|e| conversion(1, Box::new(e)))?;

    let reason = BlockReason::parse(&reason_raw).ok_or_else(|| {
        conversion(2, format!("unknown block reason: {reason_raw}").into())
    })?;

    let created_at = chrono::DateTime::parse_from_rfc3339(&created_raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| conversion(3, Box::new(e)))?;

    Ok(BlockRecord {
        user_id,
        room_id,
        reason,
        created_at,
    })
}
