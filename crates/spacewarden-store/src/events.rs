//! Processed-event bookkeeping.
//!
//! Matrix delivers events at least once (initial sync replays history), so
//! membership and command events are recorded here and processed at most
//! once.

use chrono::Utc;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Whether an event has already been processed.
    pub fn is_event_seen(&self, event_id: &str) -> Result<bool> {
        let mut stmt = self
            .conn()
            .prepare("SELECT 1 FROM seen_events WHERE event_id = ?1")?;
        let exists = stmt.exists(params![event_id])?;
        Ok(exists)
    }

    /// Record that an event has been processed.
    pub fn mark_event_seen(
        &self,
        event_id: &str,
        event_type: &str,
        room_id: &str,
        sender: Option<&str>,
        timestamp_ms: i64,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO seen_events
             (event_id, event_type, room_id, sender, timestamp, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event_id,
                event_type,
                room_id,
                sender,
                timestamp_ms,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Delete seen events older than `days`.  Returns the number of rows
    /// deleted.
    pub fn cleanup_old_events(&self, days: i64) -> Result<usize> {
        let cutoff_ms = (Utc::now() - chrono::Duration::days(days)).timestamp_millis();
        let deleted = self.conn().execute(
            "DELETE FROM seen_events WHERE timestamp < ?1",
            params![cutoff_ms],
        )?;
        if deleted > 0 {
            tracing::debug!(deleted, days, "cleaned up old seen events");
        }
        Ok(deleted)
    }
}
