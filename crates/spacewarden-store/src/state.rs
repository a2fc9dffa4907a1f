//! Key/value runtime state, most importantly the sync token.

use chrono::Utc;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

/// Key under which the incremental sync token is persisted.
const NEXT_BATCH_KEY: &str = "next_batch";

impl Database {
    /// Retrieve a state value by key.
    pub fn get_state(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT value FROM bot_state WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Set a state value (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO bot_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// The last persisted sync token, if any.
    pub fn get_next_batch(&self) -> Result<Option<String>> {
        self.get_state(NEXT_BATCH_KEY)
    }

    /// Persist the sync token so the next start resumes incrementally.
    pub fn set_next_batch(&self, token: &str) -> Result<()> {
        self.set_state(NEXT_BATCH_KEY, token)
    }
}

#[cfg(test)]
mod tests {
    use crate::Database;

    #[test]
    fn state_upsert_round_trip() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_state("missing").unwrap(), None);

        db.set_state("k", "v1").unwrap();
        assert_eq!(db.get_state("k").unwrap().as_deref(), Some("v1"));

        db.set_state("k", "v2").unwrap();
        assert_eq!(db.get_state("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn next_batch_helpers() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_next_batch().unwrap(), None);
        db.set_next_batch("s_12345").unwrap();
        assert_eq!(db.get_next_batch().unwrap().as_deref(), Some("s_12345"));
    }
}
